pub mod reporting;
pub mod store;

pub use reporting::*;
pub use store::*;
