//! Sluice Storage Layer
//!
//! PostgreSQL persistence for the workflow engine: schema migrations, the
//! embedded message queue, the scheduler transactions that own every atomic
//! state transition, and read-side repositories.

pub mod migrations;
pub mod models;
pub mod pool;
pub mod queue;
pub mod repos;
pub mod scheduler;

pub use pool::{create_pool, DbPool};
pub use queue::{Queue, QueueError, QueueMessage, TaskMessage};
pub use repos::*;
