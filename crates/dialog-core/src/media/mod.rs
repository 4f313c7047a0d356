//! SDP offer/answer plumbing
//!
//! Mechanical handling only: per-leg bookkeeping of what each side described,
//! asynchronous hooks a user agent runs SDP bodies through, and media relay
//! sessions built on those hooks. Negotiation policy is left to the
//! application.

pub mod hook;
pub mod relay;
pub mod side;

pub use hook::{apply_hook, SdpChangeHook, SdpDirection};
pub use relay::{RelaySession, RelaySide, RtpRelayClient};
pub use side::{OriginTracker, SdpSide};
