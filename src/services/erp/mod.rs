// Customer ERP Sync
// Change detection, push rules, pull/push orchestration and scheduling
// against the Zhibang ERP.

pub mod change_detector;
pub mod erp_client;
pub mod error;
pub mod rule_engine;
pub mod scheduler;
pub mod sync_service;
pub mod zhibang_client;

pub use change_detector::{Change, ChangeAction, ChangeDetector, ChangeSet, SourceStrategy};
pub use erp_client::{ErpClient, ErpClientError};
pub use error::{Result, SyncError};
pub use rule_engine::{quality_score, RuleDecision, RuleKind, RuleSet, RuleSource, SyncRule, SyncRuleEngine};
pub use scheduler::{ErpSyncScheduler, JobHistory, JobOutcome, JobRecord, TriggerDirection, TriggerReport};
pub use sync_service::UnifiedSyncService;
pub use zhibang_client::ZhibangErpClient;
