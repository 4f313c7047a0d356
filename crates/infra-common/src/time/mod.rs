//! Clock and timer primitives

pub mod monotime;
pub mod timeout;

pub use monotime::MonoTime;
pub use timeout::Timeout;
