//! Seams between the transaction layer and the layers above it

use std::sync::Arc;

use b2bua_infra_common::SessionLock;
use b2bua_sip_core::{Request, Response};

use crate::transaction::client::ClientTransaction;
use crate::transaction::manager::TransactionManager;
use crate::transaction::server::ServerTransaction;

/// Receives the responses of a client transaction.
///
/// Called under the transaction's session lock. Each final response is
/// delivered once; provisional responses as they arrive.
pub trait ResponseReceiver: Send + Sync {
    fn recv_response(&self, resp: Response, tx: &Arc<ClientTransaction>);
}

/// Owner of the requests of one or more dialogs of a Call-ID
pub trait RequestReceiver: Send + Sync {
    /// Handle a new request. The server transaction already runs under
    /// [`RequestReceiver::session_lock`], which is held during the call.
    fn recv_request(&self, req: Request, tx: &Arc<ServerTransaction>);

    /// Lock the server transaction switches to before the request is handed
    /// over
    fn session_lock(&self) -> SessionLock;

    /// Whether an in-dialog request with this Call-ID belongs to this receiver
    fn is_yours(&self, req: &Request) -> bool;
}

/// Outcome of offering a dialog-creating request to the [`CallMap`]
pub enum NewDialog {
    /// Hand the request to this receiver
    Accept(Arc<dyn RequestReceiver>),
    /// Answer immediately with this response
    Reject(Response),
    /// Drop the request without an answer
    Ignore,
}

/// Application hook deciding what to do with requests no dialog claims
pub trait CallMap: Send + Sync {
    fn on_new_dialog(
        &self,
        tm: &Arc<TransactionManager>,
        req: &Request,
        tx: &Arc<ServerTransaction>,
    ) -> NewDialog;
}
