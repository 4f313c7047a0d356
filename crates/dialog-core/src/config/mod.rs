//! Configuration for dialog-core
//!
//! Plain `serde` structs with RFC 3261 defaults and `with_*` builders.
//! [`DialogCoreConfig`] bundles the transaction, transport and user agent
//! settings and validates them together.

pub mod timers;
pub mod unified;

pub use timers::TimerSettings;
pub use unified::{Credentials, DialogCoreConfig, TransactionConfig, UaConfig, DEFAULT_USER_AGENT};
