//! Entity models for the Sluice schema

mod runs;
mod steps;
mod tasks;
mod workflows;

pub use runs::*;
pub use steps::*;
pub use tasks::*;
pub use workflows::*;
