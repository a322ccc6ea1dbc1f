pub mod erp_sync;

pub use erp_sync::AppState;
