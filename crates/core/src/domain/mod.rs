pub mod audit;
pub mod installed;
pub mod plugin;

pub use audit::*;
pub use installed::*;
pub use plugin::*;
