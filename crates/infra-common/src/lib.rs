//! Common infrastructure for the B2BUA stack
//!
//! This crate holds the pieces every layer above the wire needs but none of
//! them owns:
//!
//! - [`MonoTime`]: a monotonic timestamp paired with a smoothed wall-clock
//!   reading, used to stamp received messages and call milestones
//! - [`Timeout`]: a one-shot or repeating timer whose callback runs under a
//!   caller supplied [`SessionLock`]
//! - [`SessionLock`]: the re-entrant per-call-leg lock that serializes timer
//!   firings, network input and application calls into a call leg
//! - [`logging`]: `tracing-subscriber` setup shared by binaries and tests

pub mod errors;
pub mod logging;
pub mod sync;
pub mod time;

pub use errors::types::{Error, Result};
pub use sync::{new_session_lock, SessionLock};
pub use time::monotime::MonoTime;
pub use time::timeout::Timeout;
