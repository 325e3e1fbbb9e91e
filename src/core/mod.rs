//! Core infrastructure: configuration, runtime wiring, and time.

pub mod config;
pub mod runtime;
pub mod time;
