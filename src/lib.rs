#![deny(unused, dead_code)]
#![deny(clippy::all, clippy::pedantic)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: some functions are inherently complex
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
// Variable naming: domain terms often similar
#![allow(clippy::similar_names)]
// Documentation style: many terms don't need backticks
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
// Passing style
#![allow(clippy::needless_pass_by_value)]
// Control flow style
#![allow(clippy::if_not_else)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::single_match_else)]
#![allow(clippy::manual_let_else)]
// Numeric casts: intentional in timing code
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
// Option/Result patterns
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::field_reassign_with_default)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::map_unwrap_or)]
// Explicit type bounds
#![allow(clippy::significant_drop_tightening)]
// Explicit returns
#![allow(clippy::semicolon_if_nothing_returned)]

//! Meshbus - message-mesh broker core with session-group routing.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and validation
//! - `core::runtime` - Runtime orchestration and graceful shutdown
//! - `core::time` - Deterministic time utilities
//!
//! ## Protocol
//! - `protocol::event` - Mesh events and routing headers
//! - `protocol::subscription` - Subscription items and consumption modes
//! - `protocol::agent` - Client identity (group, subsystem, purpose)
//!
//! ## Queue
//! - `queue` - Backend message-queue seam (producer/consumer contracts)
//! - `queue::memory` - In-process queue driver for standalone mode and tests
//!
//! ## Session
//! - `session::session` - Connection lifecycle state machine
//! - `session::push` - Pending-acknowledgment table and downstream contexts
//! - `session::send` - Upstream send contexts
//!
//! ## Group
//! - `group::wrapper` - Per-group aggregate: session sets, topic index,
//!   backend channels
//! - `group::mapping` - Top-level session/group registry and sweepers
//! - `group::dispatch` - Downstream dispatch strategies
//!
//! ## Operations
//! - `ops::admin` - Client distribution snapshots and bulk rejection
//! - `ops::metrics` - Summary counters

// Core infrastructure
pub mod core;

// Protocol value types
pub mod protocol;

// Backend queue seam
pub mod queue;

// Session lifecycle
pub mod session;

// Group routing
pub mod group;

// Operations
pub mod ops;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, runtime, time};
pub use group::{dispatch, mapping, wrapper};
pub use protocol::{agent, event, subscription};
