//! Error types for dialog-core
//!
//! One error enum covers the transaction layer and the call-leg engine.
//! Protocol-level failures seen on the wire never surface here; they are
//! answered with SIP responses. These errors are for local API misuse and
//! resource problems.

pub mod dialog_errors;

pub use dialog_errors::{DialogError, DialogResult};
