//! Core domain types
//!
//! These types represent the entities the scheduler persists and the runner
//! executes. They are shared so both sides agree on the on-disk and wire shape.

pub mod control;
pub mod job;
pub mod step;
