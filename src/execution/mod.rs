//! Execution module.
//!
//! This module drives demand-driven updates and delivers stage events.

pub mod engine;
pub mod events;

pub use engine::{ExecutionOptions, UpdateReport, UpdateStats};
pub use events::{AbortFlag, Event, EventChannel, EventKind, EventPayload, ListenerId};
