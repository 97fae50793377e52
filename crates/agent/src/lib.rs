//! Maintenance agent
//!
//! Long-running process that runs the training coordinator on a fixed
//! interval and serves health, readiness and metrics over HTTP.

pub mod api;
