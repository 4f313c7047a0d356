//! # Transaction and call-leg engine for SIP B2BUAs
//!
//! Two layers sit on top of [`b2bua_sip_transport`]:
//!
//! - [`transaction`]: the RFC 3261 transaction layer. A
//!   [`TransactionManager`] matches incoming messages to client and server
//!   transactions, absorbs retransmissions, runs the retransmission and
//!   timeout timers and routes new dialogs to a [`CallMap`].
//! - [`ua`]: call legs. A [`Ua`] drives one side of a call through its
//!   state machine and exchanges [`CCEvent`]s with a [`CallController`].
//!
//! [`media`] adds the SDP hooks a leg runs bodies through, including a media
//! relay session built on them.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use b2bua_dialog_core::{
//!     CallMap, DialogCoreConfig, NewDialog, ServerTransaction, TransactionManager,
//! };
//! use b2bua_sip_core::{HostPort, Request};
//! use b2bua_sip_transport::UdpServerConfig;
//!
//! struct Reject;
//!
//! impl CallMap for Reject {
//!     fn on_new_dialog(
//!         &self,
//!         _tm: &Arc<TransactionManager>,
//!         req: &Request,
//!         _tx: &Arc<ServerTransaction>,
//!     ) -> NewDialog {
//!         NewDialog::Reject(req.gen_response(403, "Forbidden"))
//!     }
//! }
//!
//! # async fn run() -> b2bua_dialog_core::DialogResult<()> {
//! let config = DialogCoreConfig::default();
//! let tm = TransactionManager::new(config.transaction.clone(), Arc::new(Reject));
//! tm.start_udp(UdpServerConfig::new(HostPort::new("127.0.0.1", 5060)))?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod errors;
pub mod events;
pub mod media;
pub mod transaction;
pub mod ua;

pub use config::{Credentials, DialogCoreConfig, TimerSettings, TransactionConfig, UaConfig};
pub use errors::{DialogError, DialogResult};
pub use events::{CCEvent, CCEventKind};
pub use media::{RelaySession, SdpChangeHook, SdpDirection};
pub use transaction::{
    CallMap, ClientTransaction, ClientTransactionOptions, NewDialog, RequestReceiver,
    ResponseReceiver, ServerTransaction, TransactionManager,
};
pub use ua::{CallController, Ua, UaListener, UaStateKind};
