//! # Client transactions (RFC 3261 §17.1)
//!
//! One state machine covers INVITE and non-INVITE requests:
//!
//! ```text
//!            1xx                  final (non-INVITE)
//! Trying ---------> Ringing ----------------------------> Completed --K--> Terminated
//!   |                  |     final (INVITE)                  ^
//!   |                  +---------------------> ACK sent -----+--D-->
//!   |                  |     2xx with uack
//!   |                  +---------------------> Uack --send_ack()--> Completed
//!   +--B (32 s)--> synthetic 408 --C--> Terminated
//! ```
//!
//! Timer A retransmits the request while nothing was heard back, doubling
//! from T1 (capped at T2 for non-INVITE). Timer B gives up. A provisional
//! response replaces Timer B with the extended timeout for INVITE. Final
//! responses are delivered to the [`ResponseReceiver`] exactly once.
//!
//! Every timer runs under the owner's session lock; callbacks into the
//! receiver are made with the inner state lock released.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use b2bua_infra_common::{SessionLock, Timeout};
use b2bua_sip_core::{
    CSeq, HeaderAccess, HostPort, Method, MsgBody, Request, Response, SipHeader, Via,
    DEFAULT_MAX_FORWARDS,
};
use b2bua_sip_transport::Transport;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::config::TimerSettings;
use crate::errors::{DialogError, DialogResult};
use crate::transaction::key::TransactionKey;
use crate::transaction::manager::{ClientTransactionOptions, TransactionManager};
use crate::transaction::routing::{compute_route, remote_target, uac_route_set};
use crate::transaction::traits::ResponseReceiver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Trying,
    Ringing,
    Completed,
    /// 2xx received, ACK held until [`ClientTransaction::send_ack`]
    Uack,
    Terminated,
}

struct AckToSend {
    request: Request,
    destination: HostPort,
}

struct ClientInner {
    state: ClientState,
    data: Bytes,
    retransmit_interval: Duration,
    timer_a: Option<Timeout>,
    timer_b: Option<Timeout>,
    /// C, D or K: wait before cleanup
    teardown: Option<Timeout>,
    uack_timer: Option<Timeout>,
    ack: Option<AckToSend>,
    cancel_pending: Option<Vec<SipHeader>>,
    cancel_sent: bool,
    final_delivered: bool,
    resp_receiver: Option<Weak<dyn ResponseReceiver>>,
}

/// State machine for one outgoing request
pub struct ClientTransaction {
    me: Weak<ClientTransaction>,
    tid: TransactionKey,
    request: Request,
    destination: HostPort,
    transport: Arc<dyn Transport>,
    lock: SessionLock,
    timers: TimerSettings,
    outbound_proxy: Option<HostPort>,
    uack: bool,
    manager: Mutex<Option<Arc<TransactionManager>>>,
    inner: Mutex<ClientInner>,
}

impl ClientTransaction {
    pub(crate) fn new(
        tm: &Arc<TransactionManager>,
        tid: TransactionKey,
        request: Request,
        destination: HostPort,
        transport: Arc<dyn Transport>,
        options: &ClientTransactionOptions,
    ) -> Arc<Self> {
        let timers = tm.config().timers.clone();
        let data = request.to_bytes();
        Arc::new_cyclic(|me| ClientTransaction {
            me: me.clone(),
            tid,
            request,
            destination,
            transport,
            lock: options.session_lock.clone(),
            outbound_proxy: options.outbound_proxy.clone(),
            uack: options.uack,
            manager: Mutex::new(Some(tm.clone())),
            inner: Mutex::new(ClientInner {
                state: ClientState::Trying,
                data,
                retransmit_interval: timers.t1,
                timer_a: None,
                timer_b: None,
                teardown: None,
                uack_timer: None,
                ack: None,
                cancel_pending: None,
                cancel_sent: false,
                final_delivered: false,
                resp_receiver: options.resp_receiver.clone(),
            }),
            timers,
        })
    }

    pub fn tid(&self) -> &TransactionKey {
        &self.tid
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn method(&self) -> &Method {
        &self.request.method
    }

    pub fn destination(&self) -> &HostPort {
        &self.destination
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn session_lock(&self) -> &SessionLock {
        &self.lock
    }

    pub fn state(&self) -> ClientState {
        self.inner.lock().state
    }

    fn is_invite(&self) -> bool {
        self.request.method == Method::Invite
    }

    fn manager(&self) -> Option<Arc<TransactionManager>> {
        self.manager.lock().clone()
    }

    /// Initial transmission and Timers A/B. Called by the manager once the
    /// transaction is registered.
    pub(crate) fn start(&self) {
        self.transmit();
        let mut inner = self.inner.lock();
        let interval = inner.retransmit_interval;
        inner.timer_a = Some(self.start_timer(interval, Self::timer_a));
        inner.timer_b = Some(self.start_timer(self.timers.timer_b, Self::timer_b));
    }

    fn start_timer(&self, after: Duration, fire: fn(&ClientTransaction)) -> Timeout {
        let weak = self.me.clone();
        Timeout::start_new(
            move || {
                if let Some(tx) = weak.upgrade() {
                    fire(&tx);
                }
            },
            Some(self.lock.clone()),
            after,
            1,
        )
    }

    fn transmit(&self) {
        let data = self.inner.lock().data.clone();
        self.send(data, &self.destination);
    }

    fn send(&self, data: Bytes, destination: &HostPort) {
        let call_id = &self.tid.call_id;
        match self.manager() {
            Some(tm) => tm.transmit_data(&self.transport, data, destination, None, call_id, 0),
            None => trace!(tid = %self.tid, "transaction already cleaned up, not sending"),
        }
    }

    fn timer_a(&self) {
        let mut inner = self.inner.lock();
        if inner.state != ClientState::Trying {
            return;
        }
        let capped = !self.is_invite();
        let next = self.timers.next_retransmit(inner.retransmit_interval, capped);
        inner.retransmit_interval = next;
        inner.timer_a = Some(self.start_timer(next, Self::timer_a));
        drop(inner);
        debug!(tid = %self.tid, "retransmitting request, next in {:?}", next);
        self.transmit();
    }

    fn timer_b(&self) {
        let receiver = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, ClientState::Trying | ClientState::Ringing) {
                return;
            }
            cancel(&mut inner.timer_a);
            inner.timer_b = None;
            inner.state = ClientState::Completed;
            inner.final_delivered = true;
            inner.teardown = Some(self.start_timer(self.timers.timer_c, Self::cleanup));
            inner.resp_receiver.clone()
        };
        debug!(tid = %self.tid, "no final response, timing out");
        let mut resp = self.request.gen_response(408, "Request Timeout");
        resp.source = Some(self.destination.clone());
        self.deliver(receiver, resp);
    }

    fn uack_timer(&self) {
        let pending = {
            let mut inner = self.inner.lock();
            inner.uack_timer = None;
            inner.state == ClientState::Uack
        };
        if pending {
            error!(tid = %self.tid, "2xx ACK was never sent, probable UAC bug");
            self.cleanup();
        }
    }

    fn deliver(&self, receiver: Option<Weak<dyn ResponseReceiver>>, resp: Response) {
        let Some(receiver) = receiver.and_then(|r| r.upgrade()) else {
            return;
        };
        let Some(me) = self.me.upgrade() else {
            return;
        };
        receiver.recv_response(resp, &me);
    }

    /// Response matched to this transaction by the manager. Runs under the
    /// session lock.
    pub(crate) fn incoming_response(&self, resp: Response) {
        let mut inner = self.inner.lock();
        match inner.state {
            ClientState::Terminated => return,
            ClientState::Completed | ClientState::Uack => {
                // Retransmitted final: repeat the ACK if it went out already
                if resp.is_final() && inner.state == ClientState::Completed && self.is_invite() {
                    if let Some(ack) = &inner.ack {
                        let data = ack.request.to_bytes();
                        let destination = ack.destination.clone();
                        drop(inner);
                        trace!(tid = %self.tid, "final response retransmitted, resending ACK");
                        self.send(data, &destination);
                    }
                }
                return;
            }
            ClientState::Trying | ClientState::Ringing => {}
        }

        if resp.is_provisional() {
            cancel(&mut inner.timer_a);
            if self.is_invite() && inner.state == ClientState::Trying {
                cancel(&mut inner.timer_b);
                inner.timer_b = Some(self.start_timer(self.timers.extended_timeout, Self::timer_b));
            }
            inner.state = ClientState::Ringing;
            let cancel_now = inner.cancel_pending.take();
            let receiver = inner.resp_receiver.clone();
            drop(inner);
            self.deliver(receiver, resp);
            if let Some(extra_headers) = cancel_now {
                self.start_cancel(extra_headers);
            }
            return;
        }

        cancel(&mut inner.timer_a);
        cancel(&mut inner.timer_b);
        if self.is_invite() {
            let ack = if resp.is_success() {
                self.build_ack_for_2xx(&resp)
            } else {
                self.request.gen_ack(&resp).map_err(DialogError::from).map(|request| AckToSend {
                    request,
                    destination: self.destination.clone(),
                })
            };
            match ack {
                Ok(ack) => {
                    if resp.is_success() && self.uack {
                        inner.state = ClientState::Uack;
                        inner.uack_timer = Some(self.start_timer(self.timers.uack_wait, Self::uack_timer));
                    } else {
                        inner.state = ClientState::Completed;
                        let data = ack.request.to_bytes();
                        let destination = ack.destination.clone();
                        self.send(data, &destination);
                    }
                    inner.ack = Some(ack);
                }
                Err(e) => {
                    error!(tid = %self.tid, "cannot build ACK for {}: {}", resp.scode, e);
                    inner.state = ClientState::Completed;
                }
            }
            inner.teardown = Some(self.start_timer(self.timers.timer_d, Self::cleanup));
        } else {
            inner.state = ClientState::Completed;
            inner.teardown = Some(self.start_timer(self.timers.t4, Self::cleanup));
        }
        if inner.final_delivered {
            return;
        }
        inner.final_delivered = true;
        // A CANCEL still waiting for a provisional is moot now
        inner.cancel_pending = None;
        let receiver = inner.resp_receiver.clone();
        drop(inner);
        self.deliver(receiver, resp);
    }

    /// ACK for a 2xx: a new transaction of its own, routed with the dialog's
    /// route set and remote target (RFC 3261 §13.2.2.4)
    fn build_ack_for_2xx(&self, resp: &Response) -> DialogResult<AckToSend> {
        let route_set = uac_route_set(resp);
        let target = remote_target(resp, &self.request.uri);
        let decision = compute_route(&route_set, &target, self.outbound_proxy.as_ref());

        let mut via = self.request.top_via()?.clone();
        via.set_branch(&Via::gen_branch());
        let cseq = self.request.cseq()?.seq;

        let mut ack = Request::new(Method::Ack, decision.request_uri);
        ack.append_header(SipHeader::Via(via));
        ack.append_header(SipHeader::From(self.request.from_addr()?.clone()));
        ack.append_header(SipHeader::To(resp.to_addr()?.clone()));
        ack.append_header(SipHeader::CallId(self.tid.call_id.clone()));
        ack.append_header(SipHeader::CSeq(CSeq::new(cseq, Method::Ack)));
        ack.append_header(SipHeader::MaxForwards(DEFAULT_MAX_FORWARDS));
        for route in decision.routes {
            ack.append_header(SipHeader::Route(route));
        }
        for header in self.request.headers() {
            if let SipHeader::Authorization(_) | SipHeader::ProxyAuthorization(_) = header {
                ack.append_header(header.clone());
            }
        }
        Ok(AckToSend {
            request: ack,
            destination: decision.destination,
        })
    }

    /// The ACK built for the 2xx, if any
    pub fn ack(&self) -> Option<Request> {
        self.inner.lock().ack.as_ref().map(|a| a.request.clone())
    }

    /// Send the ACK held in uack mode, optionally with a body
    pub fn send_ack(&self, body: Option<MsgBody>) -> DialogResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != ClientState::Uack {
            return Err(DialogError::invalid_state(format!(
                "no ACK waiting on {} (state {:?})",
                self.tid, inner.state
            )));
        }
        let Some(ack) = inner.ack.as_mut() else {
            return Err(DialogError::invalid_state("uack transaction without ACK"));
        };
        ack.request.set_body(body);
        let data = ack.request.to_bytes();
        let destination = ack.destination.clone();
        inner.state = ClientState::Completed;
        cancel(&mut inner.uack_timer);
        drop(inner);
        self.send(data, &destination);
        Ok(())
    }

    /// Cancel an INVITE. Before any provisional response the CANCEL is held
    /// and sent as soon as one arrives (RFC 3261 §9.1).
    pub fn cancel(&self, extra_headers: Vec<SipHeader>) {
        if !self.is_invite() {
            warn!(tid = %self.tid, "only INVITE transactions can be cancelled");
            return;
        }
        let mut inner = self.inner.lock();
        match inner.state {
            ClientState::Trying => {
                debug!(tid = %self.tid, "no provisional response yet, CANCEL deferred");
                inner.cancel_pending = Some(extra_headers);
            }
            ClientState::Ringing => {
                drop(inner);
                self.start_cancel(extra_headers);
            }
            _ => {}
        }
    }

    fn start_cancel(&self, extra_headers: Vec<SipHeader>) {
        {
            let mut inner = self.inner.lock();
            if inner.cancel_sent {
                return;
            }
            inner.cancel_sent = true;
        }
        let Some(tm) = self.manager() else {
            return;
        };
        let mut cancel = match self.request.gen_cancel() {
            Ok(cancel) => cancel,
            Err(e) => {
                error!(tid = %self.tid, "cannot build CANCEL: {}", e);
                return;
            }
        };
        for header in extra_headers {
            cancel.append_header(header);
        }
        let options = ClientTransactionOptions::new(self.lock.clone())
            .with_target(self.destination.clone())
            .with_transport(self.transport.clone());
        if let Err(e) = tm.new_client_transaction(cancel, options) {
            error!(tid = %self.tid, "cannot start CANCEL transaction: {}", e);
        }
    }

    /// Stop all timers and drop out of the manager
    pub(crate) fn cleanup(&self) {
        {
            let mut inner = self.inner.lock();
            inner.state = ClientState::Terminated;
            cancel(&mut inner.timer_a);
            cancel(&mut inner.timer_b);
            cancel(&mut inner.teardown);
            cancel(&mut inner.uack_timer);
            inner.resp_receiver = None;
        }
        if let Some(tm) = self.manager.lock().take() {
            tm.remove_client(&self.tid);
        }
    }
}

fn cancel(timer: &mut Option<Timeout>) {
    if let Some(timer) = timer.take() {
        timer.cancel();
    }
}

impl fmt::Debug for ClientTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTransaction")
            .field("tid", &self.tid)
            .field("destination", &self.destination)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}
