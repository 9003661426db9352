//! Order execution and fill tracking.

pub mod fills;
pub mod manager;

pub use fills::{FillProgress, FillTracker};
pub use manager::ExecutionManager;
