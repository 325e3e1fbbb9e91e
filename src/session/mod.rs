//! Session lifecycle: one live client connection and its delivery state.
//!
//! - `session` - connection state machine and subscription context
//! - `push` - pending-acknowledgment table and downstream message contexts
//! - `send` - upstream send contexts and producer-side helpers

pub mod push;
pub mod send;
#[allow(clippy::module_inception)]
pub mod session;

pub use push::{DownStreamMsgContext, OutboundMessage, SessionPusher};
pub use send::UpStreamMsgContext;
pub use session::{Session, SessionError, SessionState};
