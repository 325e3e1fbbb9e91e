//! Client groups: the unit of backend connectivity and delivery routing.
//!
//! - `wrapper` - per-group aggregate of sessions, topics, and channels
//! - `mapping` - the top-level session/group registry
//! - `dispatch` - delivery target selection

pub mod dispatch;
pub mod mapping;
pub mod wrapper;

pub use dispatch::{DispatchStrategy, FreePriorityDispatch};
pub use mapping::{ClientSessionGroupMapping, MappingError};
pub use wrapper::{ClientGroupWrapper, GroupError, GroupSettings};
