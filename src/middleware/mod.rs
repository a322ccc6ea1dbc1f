pub mod error_handling;
pub mod metrics;

pub use error_handling::*;
pub use metrics::{metrics_handler, metrics_middleware};
