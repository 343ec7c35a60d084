//! Sluice Core Library
//!
//! Core primitives for the Sluice workflow engine:
//! - Error types
//! - Configuration
//! - Clock and id-generator injection
//! - Slug validation rules
//! - Structured output merging

pub mod config;
pub mod error;
pub mod merge;
pub mod slug;
pub mod telemetry;
pub mod time;

pub use config::Config;
pub use error::{Error, Result};
pub use time::{Clock, IdGen, SystemClock, UuidGen};
