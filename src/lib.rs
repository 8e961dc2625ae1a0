//! Library crate for the loginguard approval gate.
//!
//! Re-exports modules needed by the binary and by integration tests in `tests/`.

pub mod cancel;
pub mod cli;
pub mod config;
pub mod errors;
pub mod gate;
pub mod models;
pub mod notification;
pub mod rate_limit;
