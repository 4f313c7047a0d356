//! # Server transactions (RFC 3261 §17.2)
//!
//! ```text
//!          1xx              final                ACK
//! Trying ------> Ringing -----------> Completed -------> Confirmed --> Terminated
//!    \_____________________final_____/     |
//!                                          +--H (no ACK)--> Terminated
//! ```
//!
//! A server transaction starts under a private lock. Once a user agent claims
//! it, the manager swaps in the user agent's session lock
//! ([`ServerTransaction::upgrade_lock`]) and from then on the transaction is
//! serialized with everything else that call leg does.
//!
//! INVITE final responses are retransmitted on Timer G until the ACK arrives
//! or Timer H gives up. When the final response goes out the transaction is
//! re-keyed by To tag, so the ACK matches whatever branch it carries.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use b2bua_infra_common::{new_session_lock, SessionLock, Timeout};
use b2bua_sip_core::{
    Address, HeaderAccess, HeaderName, HostPort, Method, Request, Response, SipHeader,
};
use b2bua_sip_transport::Transport;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::TimerSettings;
use crate::errors::{DialogError, DialogResult};
use crate::transaction::cache::{CacheEntry, Checksum};
use crate::transaction::key::TransactionKey;
use crate::transaction::manager::TransactionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Trying,
    Ringing,
    Completed,
    Confirmed,
    Terminated,
}

/// Invoked with the CANCEL request while the INVITE is still unanswered
pub type CancelCallback = Box<dyn FnOnce(Request) + Send>;
/// Invoked with the ACK for the final response
pub type AckCallback = Box<dyn FnOnce(Request) + Send>;
/// Invoked when Timer H expires without an ACK
pub type NoAckCallback = Box<dyn FnOnce() + Send>;

struct ServerInner {
    state: ServerState,
    tid: TransactionKey,
    last_response: Option<Bytes>,
    last_scode: u16,
    to_tag: String,
    r487: Option<Response>,
    cancel_cb: Option<CancelCallback>,
    ack_cb: Option<AckCallback>,
    noack_cb: Option<NoAckCallback>,
    retransmit_interval: Duration,
    timer_g: Option<Timeout>,
    timer_h: Option<Timeout>,
    timer_j: Option<Timeout>,
    provisional_timer: Option<Timeout>,
    reliable: Option<Bytes>,
    reliable_timer: Option<Timeout>,
    reliable_interval: Duration,
}

/// State machine for one incoming request
pub struct ServerTransaction {
    me: Weak<ServerTransaction>,
    method: Method,
    request: Request,
    checksum: Checksum,
    transport: Arc<dyn Transport>,
    /// Where responses go: the top Via's received/rport target
    response_target: HostPort,
    timers: TimerSettings,
    provisional_retransmit: Option<Duration>,
    server_header: Option<String>,
    lossemul: u32,
    lock: Mutex<SessionLock>,
    manager: Mutex<Option<Arc<TransactionManager>>>,
    inner: Mutex<ServerInner>,
}

impl ServerTransaction {
    pub(crate) fn new(
        tm: &Arc<TransactionManager>,
        tid: TransactionKey,
        request: Request,
        checksum: Checksum,
        transport: Arc<dyn Transport>,
        response_target: HostPort,
    ) -> Arc<Self> {
        let config = tm.config();
        let to_tag = request
            .to_addr()
            .ok()
            .and_then(Address::tag)
            .map(str::to_string)
            .unwrap_or_else(Address::gen_tag);
        let r487 = (request.method == Method::Invite).then(|| {
            let mut resp = request.gen_response(487, "Request Terminated");
            if let Ok(to) = resp.to_addr_mut() {
                if to.tag().is_none() {
                    to.set_tag(&to_tag);
                }
            }
            resp
        });
        Arc::new_cyclic(|me| ServerTransaction {
            me: me.clone(),
            method: request.method.clone(),
            checksum,
            transport,
            response_target,
            timers: config.timers.clone(),
            provisional_retransmit: config.provisional_retransmit,
            server_header: config.server_header.clone(),
            lossemul: config.loss_emulation,
            lock: Mutex::new(new_session_lock()),
            manager: Mutex::new(Some(tm.clone())),
            inner: Mutex::new(ServerInner {
                state: ServerState::Trying,
                tid,
                last_response: None,
                last_scode: 0,
                to_tag,
                r487,
                cancel_cb: None,
                ack_cb: None,
                noack_cb: None,
                retransmit_interval: config.timers.t1,
                timer_g: None,
                timer_h: None,
                timer_j: None,
                provisional_timer: None,
                reliable: None,
                reliable_timer: None,
                reliable_interval: config.timers.t1,
            }),
            request,
        })
    }

    pub fn tid(&self) -> TransactionKey {
        self.inner.lock().tid.clone()
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request that created the transaction
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn response_target(&self) -> &HostPort {
        &self.response_target
    }

    pub fn state(&self) -> ServerState {
        self.inner.lock().state
    }

    pub fn checksum(&self) -> &Checksum {
        &self.checksum
    }

    /// Current session lock
    pub fn session_lock(&self) -> SessionLock {
        self.lock.lock().clone()
    }

    /// Switch to the claiming user agent's lock. The caller holds both locks
    /// while doing so.
    pub(crate) fn upgrade_lock(&self, lock: SessionLock) {
        *self.lock.lock() = lock;
    }

    /// Local To tag used for responses that carry none
    pub fn to_tag(&self) -> String {
        self.inner.lock().to_tag.clone()
    }

    /// Adopt the dialog's local tag for generated responses
    pub fn set_to_tag(&self, tag: &str) {
        let mut inner = self.inner.lock();
        inner.to_tag = tag.to_string();
        if let Some(r487) = inner.r487.as_mut() {
            if let Ok(to) = r487.to_addr_mut() {
                to.set_tag(tag);
            }
        }
    }

    pub fn set_cancel_callback(&self, cb: CancelCallback) {
        self.inner.lock().cancel_cb = Some(cb);
    }

    pub fn set_ack_callback(&self, cb: AckCallback) {
        self.inner.lock().ack_cb = Some(cb);
    }

    pub fn set_noack_callback(&self, cb: NoAckCallback) {
        self.inner.lock().noack_cb = Some(cb);
    }

    fn manager(&self) -> Option<Arc<TransactionManager>> {
        self.manager.lock().clone()
    }

    fn start_timer(&self, after: Duration, nticks: i64, fire: fn(&ServerTransaction)) -> Timeout {
        let weak = self.me.clone();
        // The lock may be swapped after the timer starts, so take it per firing
        Timeout::start_new(
            move || {
                if let Some(tx) = weak.upgrade() {
                    let lock = tx.session_lock();
                    let _guard = lock.lock();
                    fire(&tx);
                }
            },
            None,
            after,
            nticks,
        )
    }

    fn transmit(&self, data: Bytes, call_id: &str) {
        match self.manager() {
            Some(tm) => tm.transmit_data(
                &self.transport,
                data,
                &self.response_target,
                Some(self.checksum),
                call_id,
                self.lossemul,
            ),
            None => trace!("server transaction already cleaned up, not sending"),
        }
    }

    fn resend_last(&self) {
        let (data, call_id) = {
            let inner = self.inner.lock();
            match &inner.last_response {
                Some(data) => (data.clone(), inner.tid.call_id.clone()),
                None => return,
            }
        };
        if let Some(tm) = self.manager() {
            tm.transmit_data(&self.transport, data, &self.response_target, None, &call_id, 0);
        }
    }

    /// Send a response. A second final response is refused unless
    /// `retransmit` is set.
    pub fn send_response(&self, mut resp: Response, retransmit: bool) -> DialogResult<()> {
        let mut inner = self.inner.lock();
        let answered = matches!(
            inner.state,
            ServerState::Completed | ServerState::Confirmed | ServerState::Terminated
        );
        if answered && !retransmit {
            warn!(
                tid = %inner.tid,
                "attempt to send {} after final {}", resp.scode, inner.last_scode
            );
            return Err(DialogError::invalid_state(format!(
                "final response {} already sent",
                inner.last_scode
            )));
        }
        if answered {
            drop(inner);
            self.resend_last();
            return Ok(());
        }
        if resp.scode > 100 {
            if let Ok(to) = resp.to_addr_mut() {
                if to.tag().is_none() {
                    to.set_tag(&inner.to_tag);
                }
            }
        }
        if let Some(server) = &self.server_header {
            if !resp.has_header(&HeaderName::Server) {
                resp.append_header(SipHeader::Server(server.clone()));
            }
        }
        let data = resp.to_bytes();
        inner.last_response = Some(data.clone());
        inner.last_scode = resp.scode;
        let call_id = inner.tid.call_id.clone();

        if resp.is_provisional() {
            inner.state = ServerState::Ringing;
            if let Some(interval) = self.provisional_retransmit {
                if let Some(old) = inner.provisional_timer.take() {
                    old.cancel();
                }
                inner.provisional_timer = Some(self.start_timer(interval, -1, Self::retransmit_provisional));
            }
            drop(inner);
            self.transmit(data, &call_id);
            return Ok(());
        }

        inner.state = ServerState::Completed;
        inner.cancel_cb = None;
        stop(&mut inner.provisional_timer);
        stop(&mut inner.reliable_timer);
        inner.reliable = None;
        let rekey = if self.method == Method::Invite {
            let to_tag = resp
                .to_addr()
                .ok()
                .and_then(Address::tag)
                .map(str::to_string)
                .unwrap_or_else(|| inner.to_tag.clone());
            let old = inner.tid.clone();
            inner.tid = old.ack_key(&to_tag);
            inner.retransmit_interval = self.timers.t1;
            inner.timer_g = Some(self.start_timer(self.timers.t1, 1, Self::timer_g));
            inner.timer_h = Some(self.start_timer(self.timers.timer_h, 1, Self::timer_h));
            Some((old, inner.tid.clone()))
        } else {
            inner.timer_j = Some(self.start_timer(self.timers.timer_j, 1, Self::cleanup));
            None
        };
        drop(inner);
        if let Some((old, new)) = rekey {
            if let (Some(tm), Some(me)) = (self.manager(), self.me.upgrade()) {
                tm.rekey_server(&old, new, me);
            }
        }
        self.transmit(data, &call_id);
        Ok(())
    }

    /// Send a reliable provisional response (RFC 3262), retransmitting it
    /// until [`ServerTransaction::prack_received`]
    pub fn send_reliable_provisional(&self, resp: Response) -> DialogResult<()> {
        if !resp.is_provisional() || resp.scode == 100 {
            return Err(DialogError::protocol_error(format!(
                "{} cannot be sent reliably",
                resp.scode
            )));
        }
        self.send_response(resp, false)?;
        let mut inner = self.inner.lock();
        inner.reliable = inner.last_response.clone();
        inner.reliable_interval = self.timers.t1;
        stop(&mut inner.reliable_timer);
        inner.reliable_timer = Some(self.start_timer(self.timers.t1, 1, Self::retransmit_reliable));
        Ok(())
    }

    /// Stop retransmitting the outstanding reliable provisional
    pub fn prack_received(&self) {
        let mut inner = self.inner.lock();
        inner.reliable = None;
        stop(&mut inner.reliable_timer);
    }

    fn retransmit_reliable(&self) {
        let mut inner = self.inner.lock();
        let Some(data) = inner.reliable.clone() else {
            return;
        };
        let next = self.timers.next_retransmit(inner.reliable_interval, true);
        inner.reliable_interval = next;
        inner.reliable_timer = Some(self.start_timer(next, 1, Self::retransmit_reliable));
        let call_id = inner.tid.call_id.clone();
        drop(inner);
        trace!(call_id = %call_id, "retransmitting reliable provisional response");
        if let Some(tm) = self.manager() {
            tm.transmit_data(&self.transport, data, &self.response_target, None, &call_id, 0);
        }
    }

    fn retransmit_provisional(&self) {
        if matches!(self.state(), ServerState::Trying | ServerState::Ringing) {
            self.resend_last();
        }
    }

    fn timer_g(&self) {
        let mut inner = self.inner.lock();
        if inner.state != ServerState::Completed {
            return;
        }
        let next = self.timers.next_retransmit(inner.retransmit_interval, true);
        inner.retransmit_interval = next;
        inner.timer_g = Some(self.start_timer(next, 1, Self::timer_g));
        drop(inner);
        self.resend_last();
    }

    fn timer_h(&self) {
        let noack_cb = {
            let mut inner = self.inner.lock();
            if inner.state != ServerState::Completed {
                return;
            }
            inner.noack_cb.take()
        };
        debug!(tid = %self.tid(), "no ACK received for final response");
        self.cleanup();
        if let Some(cb) = noack_cb {
            cb();
        }
    }

    /// Same request again with different bytes (identical bytes never get
    /// this far): repeat the last response
    pub(crate) fn incoming_duplicate(&self) {
        self.resend_last();
    }

    /// CANCEL matched to this INVITE transaction
    pub(crate) fn incoming_cancel(&self, cancel: Request, checksum: Checksum) {
        let mut ok = cancel.gen_response(200, "OK");
        let (to_tag, call_id) = {
            let inner = self.inner.lock();
            (inner.to_tag.clone(), inner.tid.call_id.clone())
        };
        if let Ok(to) = ok.to_addr_mut() {
            if to.tag().is_none() {
                to.set_tag(&to_tag);
            }
        }
        if let Some(tm) = self.manager() {
            tm.transmit_data(
                &self.transport,
                ok.to_bytes(),
                &self.response_target,
                Some(checksum),
                &call_id,
                0,
            );
        }

        let (cancel_cb, r487) = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, ServerState::Trying | ServerState::Ringing) {
                return;
            }
            let cb = inner.cancel_cb.take();
            let r487 = if cb.is_none() { inner.r487.clone() } else { None };
            (cb, r487)
        };
        match (cancel_cb, r487) {
            (Some(cb), _) => cb(cancel),
            (None, Some(r487)) => {
                if let Err(e) = self.send_response(r487, false) {
                    debug!("cannot answer cancelled INVITE: {}", e);
                }
            }
            (None, None) => {}
        }
    }

    /// ACK matched to the re-keyed transaction
    pub(crate) fn incoming_ack(&self, ack: Request, checksum: Checksum) {
        let ack_cb = {
            let mut inner = self.inner.lock();
            if inner.state != ServerState::Completed {
                return;
            }
            inner.state = ServerState::Confirmed;
            stop(&mut inner.timer_g);
            stop(&mut inner.timer_h);
            inner.noack_cb = None;
            inner.ack_cb.take()
        };
        if let Some(tm) = self.manager() {
            let call_id = ack.call_id().unwrap_or_default().to_string();
            let source = ack.source.clone().unwrap_or_else(|| self.response_target.clone());
            tm.cache_insert(checksum, CacheEntry::suppress(self.transport.clone(), source, &call_id));
        }
        self.cleanup();
        if let Some(cb) = ack_cb {
            cb(ack);
        }
    }

    /// Stop timers and drop out of the manager
    pub(crate) fn cleanup(&self) {
        let tid = {
            let mut inner = self.inner.lock();
            if inner.state != ServerState::Confirmed {
                inner.state = ServerState::Terminated;
            }
            stop(&mut inner.timer_g);
            stop(&mut inner.timer_h);
            stop(&mut inner.timer_j);
            stop(&mut inner.provisional_timer);
            stop(&mut inner.reliable_timer);
            inner.cancel_cb = None;
            inner.ack_cb = None;
            inner.noack_cb = None;
            inner.tid.clone()
        };
        if let Some(tm) = self.manager.lock().take() {
            tm.remove_server(&tid);
        }
    }
}

fn stop(timer: &mut Option<Timeout>) {
    if let Some(timer) = timer.take() {
        timer.cancel();
    }
}

impl fmt::Debug for ServerTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ServerTransaction")
            .field("tid", &inner.tid)
            .field("state", &inner.state)
            .field("response_target", &self.response_target)
            .finish()
    }
}
