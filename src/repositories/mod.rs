pub mod customer_repo;
pub mod memory_store;
pub mod sync_audit_repo;
pub mod sync_checkpoint_repo;
pub mod sync_rule_repo;
pub mod sync_store;

pub use customer_repo::CustomerRepository;
pub use memory_store::InMemorySyncStore;
pub use sync_audit_repo::SyncAuditRepository;
pub use sync_checkpoint_repo::SyncCheckpointRepository;
pub use sync_rule_repo::SyncRuleRepository;
pub use sync_store::{PgSyncStore, SyncStore};
