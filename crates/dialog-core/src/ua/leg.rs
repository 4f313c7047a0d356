//! Data and SIP plumbing shared by all UA states

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use b2bua_infra_common::{MonoTime, SessionLock, Timeout};
use b2bua_sip_core::{
    Address, HeaderAccess, HostPort, Method, MsgBody, Reason, Request, Response, SipHeader, SipUri,
};
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use crate::config::UaConfig;
use crate::errors::DialogResult;
use crate::events::{CCEvent, CCEventKind};
use crate::media::{apply_hook, SdpChangeHook, SdpDirection};
use crate::transaction::{
    ClientTransaction, ClientTransactionOptions, RequestReceiver, ResponseReceiver,
    ServerTransaction, TransactionManager,
};
use crate::ua::dialog::Dialog;
use crate::ua::state::{ListenerCall, UaTimer};
use crate::ua::Ua;

/// Side effects collected under the UA's data lock and run after it is
/// released
pub(crate) enum Effect {
    Event(CCEvent),
    Listener(ListenerCall),
    Dead,
}

/// Everything a UA state reads and writes
pub(crate) struct UaCore {
    pub me: Weak<Ua>,
    pub tm: Arc<TransactionManager>,
    pub config: UaConfig,
    pub lock: SessionLock,
    pub dialog: Dialog,
    /// `caller` for a UAS leg, `callee` for a UAC leg
    pub origin: &'static str,
    /// First hop for the initial INVITE of a UAC
    pub destination: Option<HostPort>,
    pub local_sdp: Option<MsgBody>,
    pub remote_sdp: Option<MsgBody>,
    pub hook: Option<Arc<dyn SdpChangeHook>>,
    pub pending_sdp: usize,
    pub last_seq: u64,
    pub effects: Vec<Effect>,
    timers: HashMap<UaTimer, Timeout>,
    /// INVITE (or re-INVITE) we are answering
    pub invite_stx: Option<Arc<ServerTransaction>>,
    /// INVITE (or re-INVITE) we sent and still wait on
    pub invite_ctx: Option<Arc<ClientTransaction>>,
    /// 2xx whose ACK is held until the answer SDP is known
    pub pending_ack: Option<Arc<ClientTransaction>>,
    /// Client transactions without a final response, by CSeq
    pub outstanding: HashMap<u32, Arc<ClientTransaction>>,
    /// Last RSeq we sent (UAS) or PRACKed (UAC)
    pub rseq: Option<u32>,
    pub auth_attempted: bool,
    pub registered: bool,
    pub setup_time: MonoTime,
    pub connect_time: Option<MonoTime>,
    pub disconnect_time: Option<MonoTime>,
}

impl UaCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        me: Weak<Ua>,
        tm: Arc<TransactionManager>,
        config: UaConfig,
        lock: SessionLock,
        dialog: Dialog,
        origin: &'static str,
        destination: Option<HostPort>,
        setup_time: MonoTime,
    ) -> Self {
        UaCore {
            me,
            tm,
            config,
            lock,
            dialog,
            origin,
            destination,
            local_sdp: None,
            remote_sdp: None,
            hook: None,
            pending_sdp: 0,
            last_seq: 0,
            effects: Vec::new(),
            timers: HashMap::new(),
            invite_stx: None,
            invite_ctx: None,
            pending_ack: None,
            outstanding: HashMap::new(),
            rseq: None,
            auth_attempted: false,
            registered: false,
            setup_time,
            connect_time: None,
            disconnect_time: None,
        }
    }

    pub fn now(&self) -> MonoTime {
        MonoTime::now().unwrap_or(self.setup_time)
    }

    /// New event originating from this leg
    pub fn event(&self, kind: CCEventKind, rtime: Option<MonoTime>) -> CCEvent {
        CCEvent::new(kind, rtime.unwrap_or_else(|| self.now()), self.origin)
    }

    /// Queue `event` for the controller unless a later event went out already
    pub fn emit(&mut self, event: CCEvent) {
        if event.seq <= self.last_seq {
            debug!(
                call_id = %self.dialog.call_id,
                "dropping stale event {} (last emitted #{})", event, self.last_seq
            );
            return;
        }
        self.last_seq = event.seq;
        trace!(call_id = %self.dialog.call_id, "emitting {}", event);
        self.effects.push(Effect::Event(event));
    }

    /// Like [`UaCore::emit`] for events carrying a body from the peer. With
    /// an SDP hook installed the body is run through it first and the event
    /// goes out once the hook completes.
    pub fn emit_remote(&mut self, event: CCEvent) {
        let (Some(hook), Some(body)) = (self.hook.clone(), hookable(&event)) else {
            self.emit(event);
            return;
        };
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(call_id = %self.dialog.call_id, "no runtime for SDP hook, skipping it: {}", e);
                self.emit(event);
                return;
            }
        };
        self.pending_sdp += 1;
        let weak = self.me.clone();
        handle.spawn(async move {
            let result = apply_hook(hook.as_ref(), SdpDirection::Remote, body).await;
            if let Some(ua) = weak.upgrade() {
                ua.remote_sdp_ready(event, result);
            }
        });
    }

    /// Hand an event from the controller to the local SDP hook. Returns the
    /// event when there is nothing for the hook to do.
    pub fn intercept_local(&mut self, event: CCEvent) -> Option<CCEvent> {
        let (Some(hook), Some(body)) = (self.hook.clone(), hookable(&event)) else {
            return Some(event);
        };
        let handle = Handle::try_current().ok()?;
        self.pending_sdp += 1;
        let weak = self.me.clone();
        handle.spawn(async move {
            let result = apply_hook(hook.as_ref(), SdpDirection::Local, body).await;
            if let Some(ua) = weak.upgrade() {
                ua.local_sdp_ready(event, result);
            }
        });
        None
    }

    pub fn notify(&mut self, call: ListenerCall) {
        self.effects.push(Effect::Listener(call));
    }

    pub fn start_timer(&mut self, timer: UaTimer, after: Duration) {
        self.arm(timer, after, 1);
    }

    pub fn start_periodic(&mut self, timer: UaTimer, every: Duration) {
        self.arm(timer, every, -1);
    }

    fn arm(&mut self, timer: UaTimer, after: Duration, nticks: i64) {
        let weak = self.me.clone();
        let timeout = Timeout::start_new(
            move || {
                if let Some(ua) = weak.upgrade() {
                    ua.on_timer(timer);
                }
            },
            Some(self.lock.clone()),
            after,
            nticks,
        );
        if let Some(old) = self.timers.insert(timer, timeout) {
            old.cancel();
        }
    }

    /// Start `timer` to fire `total` after call setup unless it runs already
    pub fn start_setup_timer(&mut self, timer: UaTimer, total: Duration) {
        if self.timers.contains_key(&timer) {
            return;
        }
        let elapsed = self.now().since(&self.setup_time);
        self.start_timer(timer, total.saturating_sub(elapsed));
    }

    pub fn timer_armed(&self, timer: UaTimer) -> bool {
        self.timers.contains_key(&timer)
    }

    pub fn cancel_timer(&mut self, timer: UaTimer) {
        if let Some(timeout) = self.timers.remove(&timer) {
            timeout.cancel();
        }
    }

    pub fn cancel_timers(&mut self) {
        for (_, timeout) in self.timers.drain() {
            timeout.cancel();
        }
    }

    /// Forget a one-shot timer that just fired
    pub fn timer_fired(&mut self, timer: UaTimer) {
        if timer != UaTimer::Keepalive {
            self.timers.remove(&timer);
        }
    }

    /// Claim in-dialog requests for our Call-ID
    pub fn register(&mut self) {
        if self.registered {
            return;
        }
        let Some(ua) = self.me.upgrade() else {
            return;
        };
        let receiver: Arc<dyn RequestReceiver> = ua;
        self.tm.reg_consumer(receiver, &self.dialog.call_id);
        self.registered = true;
    }

    /// Contact to advertise: the configured one or the local address used
    /// towards the peer
    pub fn contact(&self) -> Address {
        if let Some(uri) = &self.config.local_contact {
            return Address::new(uri.clone());
        }
        let user = self.dialog.local_uri.uri.user.as_deref();
        let remote = self
            .destination
            .clone()
            .or_else(|| self.config.outbound_proxy.clone())
            .unwrap_or_else(|| self.dialog.remote_target.host_port());
        match self.tm.binding_for(&remote) {
            Ok(binding) => Address::new(SipUri::from_host_port(user, &binding.laddress)),
            Err(_) => Address::new(self.dialog.local_uri.uri.clone()),
        }
    }

    /// Send an in-dialog request (or the initial INVITE of a UAC)
    pub fn send_request(
        &mut self,
        method: Method,
        body: Option<MsgBody>,
        extra_headers: Vec<SipHeader>,
    ) -> DialogResult<Arc<ClientTransaction>> {
        let (mut req, next_hop) = self
            .dialog
            .gen_request(method.clone(), self.config.outbound_proxy.as_ref());
        if method == Method::Invite {
            req.append_header(SipHeader::Contact(self.contact()));
            if self.config.enable_100rel {
                req.append_header(SipHeader::Supported("100rel".to_string()));
            }
        }
        req.append_header(SipHeader::UserAgent(self.config.user_agent.clone()));
        for header in extra_headers {
            req.append_header(header);
        }
        let uack = method == Method::Invite && body.is_none();
        req.set_body(body);
        let target = match (&self.destination, &self.dialog.remote_tag, &self.config.outbound_proxy) {
            (Some(destination), None, None) => destination.clone(),
            _ => next_hop,
        };
        self.start_client_transaction(req, target, uack)
    }

    pub fn start_client_transaction(
        &mut self,
        req: Request,
        target: HostPort,
        uack: bool,
    ) -> DialogResult<Arc<ClientTransaction>> {
        let cseq = req.cseq()?.seq;
        let receiver: Weak<dyn ResponseReceiver> = self.me.clone();
        let options = ClientTransactionOptions::new(self.lock.clone())
            .with_receiver(receiver)
            .with_target(target)
            .with_outbound_proxy(self.config.outbound_proxy.clone())
            .with_uack(uack);
        let tx = self.tm.new_client_transaction(req, options)?;
        debug!(call_id = %self.dialog.call_id, "sent {} (CSeq {})", tx.method(), cseq);
        self.outstanding.insert(cseq, tx.clone());
        Ok(tx)
    }

    /// Fire-and-log variant of [`UaCore::send_request`]
    pub fn send(&mut self, method: Method, body: Option<MsgBody>, extra_headers: Vec<SipHeader>) {
        if let Err(e) = self.send_request(method.clone(), body, extra_headers) {
            warn!(call_id = %self.dialog.call_id, "cannot send {}: {}", method, e);
        }
    }

    pub fn send_bye(&mut self, reason: Option<Reason>, extra_headers: Vec<SipHeader>) {
        let mut headers: Vec<SipHeader> = reason.into_iter().map(SipHeader::Reason).collect();
        headers.extend(extra_headers);
        self.send(Method::Bye, None, headers);
    }

    /// Answer `req` with a bare response
    pub fn respond(&mut self, tx: &Arc<ServerTransaction>, req: &Request, scode: u16, reason: &str) {
        self.send_response(tx, req.gen_response(scode, reason));
    }

    pub fn send_response(&mut self, tx: &Arc<ServerTransaction>, resp: Response) {
        let scode = resp.scode;
        if let Err(e) = tx.send_response(resp, false) {
            warn!(call_id = %self.dialog.call_id, "cannot send {}: {}", scode, e);
        }
    }

    /// Response to the INVITE being answered. 1xx/2xx get our Contact.
    pub fn invite_response(
        &self,
        scode: u16,
        reason: &str,
        body: Option<MsgBody>,
        extra_headers: &[SipHeader],
    ) -> Option<(Arc<ServerTransaction>, Response)> {
        let tx = self.invite_stx.clone()?;
        let mut resp = tx.request().gen_response(scode, reason);
        if (101..300).contains(&scode) {
            resp.append_header(SipHeader::Contact(self.contact()));
        }
        for header in extra_headers {
            resp.append_header(header.clone());
        }
        resp.set_body(body);
        Some((tx, resp))
    }

    /// Answer the INVITE being processed
    pub fn answer_invite(
        &mut self,
        scode: u16,
        reason: &str,
        body: Option<MsgBody>,
        extra_headers: &[SipHeader],
    ) {
        let Some((tx, resp)) = self.invite_response(scode, reason, body, extra_headers) else {
            warn!(call_id = %self.dialog.call_id, "no INVITE to answer with {}", scode);
            return;
        };
        self.send_response(&tx, resp);
    }

    /// Send the ACK held for a 2xx, with the answer SDP when there is one
    pub fn release_ack(&mut self, body: Option<MsgBody>) {
        let Some(tx) = self.pending_ack.take() else {
            return;
        };
        if let Err(e) = tx.send_ack(body) {
            warn!(call_id = %self.dialog.call_id, "cannot send held ACK: {}", e);
        }
    }

    /// Local SDP to send: the new body if any, else what we sent last
    pub fn update_local_sdp(&mut self, body: Option<&MsgBody>) -> Option<MsgBody> {
        if let Some(body) = body {
            self.local_sdp = Some(body.clone());
        }
        self.local_sdp.clone()
    }

    /// Wire the cancel and no-ACK callbacks of an INVITE server transaction
    /// back into this UA
    pub fn watch_invite(&mut self, tx: &Arc<ServerTransaction>) {
        let weak = self.me.clone();
        tx.set_cancel_callback(Box::new(move |cancel: Request| {
            if let Some(ua) = weak.upgrade() {
                ua.recv_cancel(cancel);
            }
        }));
        let weak = self.me.clone();
        tx.set_noack_callback(Box::new(move || {
            if let Some(ua) = weak.upgrade() {
                ua.on_timer(UaTimer::NoAck);
            }
        }));
        self.invite_stx = Some(tx.clone());
    }

    /// Route the ACK for our final response to this UA
    pub fn expect_ack(&mut self) {
        let Some(tx) = self.invite_stx.clone() else {
            return;
        };
        let weak = self.me.clone();
        tx.set_ack_callback(Box::new(move |ack: Request| {
            if let Some(ua) = weak.upgrade() {
                ua.recv_ack(ack);
            }
        }));
    }

    pub fn mark_connected(&mut self) {
        if self.connect_time.is_none() {
            self.connect_time = Some(self.now());
        }
    }

    pub fn mark_disconnected(&mut self) {
        if self.disconnect_time.is_none() {
            self.disconnect_time = Some(self.now());
        }
    }
}

/// SDP body of `event` that still needs to pass through a hook
fn hookable(event: &CCEvent) -> Option<MsgBody> {
    event
        .body()
        .filter(|body| body.is_sdp() && body.needs_update())
        .cloned()
}

