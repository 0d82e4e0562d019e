//! Stratum Core
//!
//! Core types shared by the Stratum scheduler and runner.
//!
//! This crate contains:
//! - Domain types: jobs, job steps and abort control records
//! - DTOs: request/response bodies and stream messages of the runner API

pub mod domain;
pub mod dto;
