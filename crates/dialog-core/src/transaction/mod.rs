//! RFC 3261 transaction layer
//!
//! [`TransactionManager`] turns datagrams into transaction events and sends
//! what the transactions produce. [`ClientTransaction`] and
//! [`ServerTransaction`] run the per-request state machines and their
//! timers. The layers above plug in through [`ResponseReceiver`],
//! [`RequestReceiver`] and [`CallMap`].

pub mod cache;
pub mod client;
pub mod key;
pub mod manager;
pub mod routing;
pub mod server;
pub mod traits;

pub use cache::{checksum, CacheEntry, Checksum, ResponseCache};
pub use client::{ClientState, ClientTransaction};
pub use key::{KeyFields, TransactionKey};
pub use manager::{ClientTransactionOptions, TransactionManager};
pub use routing::{compute_route, remote_target, uac_route_set, RouteDecision};
pub use server::{AckCallback, CancelCallback, NoAckCallback, ServerState, ServerTransaction};
pub use traits::{CallMap, NewDialog, RequestReceiver, ResponseReceiver};
