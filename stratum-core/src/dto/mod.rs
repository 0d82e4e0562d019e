//! Data Transfer Objects for the runner API
//!
//! Bodies and query strings of the runner's HTTP endpoints, plus the message
//! pushed over the status stream.

pub mod task;
