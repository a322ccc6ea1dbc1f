pub mod customer;
pub mod sync;

pub use customer::*;
pub use sync::*;
