//! Filter module.
//!
//! Contains the built-in stages and the shrink schedules used by the pyramid.

pub mod builtin;
pub mod schedule;

pub use schedule::{Schedule, ScheduleBuilder};
