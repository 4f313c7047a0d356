//! # Call legs
//!
//! A [`Ua`] is one call leg: a UAS answering an incoming INVITE or a UAC
//! placing an outgoing one. It translates between SIP traffic and
//! [`CCEvent`]s exchanged with a [`CallController`]; a B2BUA is two UAs whose
//! controller forwards each leg's events to the other.
//!
//! ## Locking
//!
//! Everything a UA does runs under its session lock, which its server
//! transactions adopt once they are handed to it. Two legs of one call may
//! share a lock. The UA's data sits behind a second, short-lived mutex that
//! is never held while the controller or listeners are called: state
//! handlers queue their side effects and the UA runs them once the data is
//! released, so a controller can call straight back into either leg.
//!
//! ## States
//!
//! ```text
//! UAS: Idle -> Trying -> Ringing[Rel] -> (PreConnect) -> Connected
//! UAC: Idle -> Trying -> Ringing -> Connected
//!                  \________\-> Cancelling -> Dead
//! Connected <-> Updating
//! any -> Disconnected | Failed -> (godead timeout) -> Dead
//! ```

pub mod auth;
pub mod dialog;
pub(crate) mod leg;
mod session;
pub mod state;
mod uac;
mod uas;

use std::fmt;
use std::sync::{Arc, Weak};

use b2bua_infra_common::{MonoTime, SessionLock};
use b2bua_sip_core::{Address, HeaderAccess, HostPort, Method, MsgBody, Request, Response, SipUri};
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::UaConfig;
use crate::errors::DialogResult;
use crate::events::CCEvent;
use crate::media::SdpChangeHook;
use crate::transaction::{
    ClientTransaction, RequestReceiver, ResponseReceiver, ServerTransaction, TransactionManager,
};
use crate::ua::leg::{Effect, UaCore};
use crate::ua::state::{Transition, UaState};

pub use dialog::Dialog;
pub use state::{ListenerCall, UaStateKind, UaTimer};

/// Application side of a call leg
pub trait CallController: Send + Sync {
    /// Event produced by `ua`. Called without any UA data locked, under the
    /// leg's session lock.
    fn recv_event(&self, event: CCEvent, ua: &Arc<Ua>);
}

/// Observer of a leg's progress. All methods default to doing nothing.
pub trait UaListener: Send + Sync {
    fn on_ring(&self, _ua: &Arc<Ua>, _scode: u16) {}
    fn on_connect(&self, _ua: &Arc<Ua>) {}
    /// `origin` names who ended the call
    fn on_disconnect(&self, _ua: &Arc<Ua>, _origin: &str) {}
    fn on_fail(&self, _ua: &Arc<Ua>, _scode: u16) {}
    fn on_dead(&self, _ua: &Arc<Ua>) {}
}

struct UaInner {
    core: UaCore,
    state: Box<dyn UaState>,
}

/// One call leg
pub struct Ua {
    me: Weak<Ua>,
    lock: SessionLock,
    tm: Arc<TransactionManager>,
    inner: Mutex<UaInner>,
    controller: Mutex<Option<Arc<dyn CallController>>>,
    listeners: Mutex<Vec<Arc<dyn UaListener>>>,
}

impl Ua {
    /// UAS leg for a dialog-creating INVITE, typically built by a
    /// [`crate::transaction::CallMap`]. The INVITE itself arrives through
    /// [`RequestReceiver::recv_request`] once the map accepts it.
    pub fn new_uas(
        tm: &Arc<TransactionManager>,
        config: UaConfig,
        controller: Option<Arc<dyn CallController>>,
        invite: &Request,
        lock: SessionLock,
    ) -> DialogResult<Arc<Ua>> {
        let dialog = Dialog::from_invite(invite, config.nat_traversal)?;
        let setup_time = match invite.rtime {
            Some(rtime) => rtime,
            None => MonoTime::now()?,
        };
        Ok(Self::build(tm, config, controller, lock, dialog, "caller", None, setup_time, uas::idle()))
    }

    /// UAC leg sending its INVITE to `destination` once it receives a `Try`
    /// event
    pub fn new_uac(
        tm: &Arc<TransactionManager>,
        config: UaConfig,
        controller: Option<Arc<dyn CallController>>,
        destination: HostPort,
        lock: SessionLock,
    ) -> DialogResult<Arc<Ua>> {
        let setup_time = MonoTime::now()?;
        let call_id = Uuid::new_v4().to_string();
        let placeholder = Address::new(SipUri::from_host_port(None, &destination));
        let dialog = Dialog::new_uac(&call_id, placeholder.clone(), placeholder);
        Ok(Self::build(
            tm,
            config,
            controller,
            lock,
            dialog,
            "callee",
            Some(destination),
            setup_time,
            uac::idle(),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        tm: &Arc<TransactionManager>,
        config: UaConfig,
        controller: Option<Arc<dyn CallController>>,
        lock: SessionLock,
        dialog: Dialog,
        origin: &'static str,
        destination: Option<HostPort>,
        setup_time: MonoTime,
        state: Box<dyn UaState>,
    ) -> Arc<Ua> {
        Arc::new_cyclic(|me: &Weak<Ua>| Ua {
            me: me.clone(),
            lock: lock.clone(),
            tm: tm.clone(),
            inner: Mutex::new(UaInner {
                core: UaCore::new(
                    me.clone(),
                    tm.clone(),
                    config,
                    lock,
                    dialog,
                    origin,
                    destination,
                    setup_time,
                ),
                state,
            }),
            controller: Mutex::new(controller),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn set_controller(&self, controller: Arc<dyn CallController>) {
        *self.controller.lock() = Some(controller);
    }

    pub fn add_listener(&self, listener: Arc<dyn UaListener>) {
        self.listeners.lock().push(listener);
    }

    /// Run SDP bodies through `hook` from now on
    pub fn set_sdp_hook(&self, hook: Arc<dyn SdpChangeHook>) {
        self.inner.lock().core.hook = Some(hook);
    }

    pub fn session_lock(&self) -> SessionLock {
        self.lock.clone()
    }

    pub fn call_id(&self) -> String {
        self.inner.lock().core.dialog.call_id.clone()
    }

    pub fn state(&self) -> UaStateKind {
        self.inner.lock().state.kind()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().state.is_connected()
    }

    /// Snapshot of the dialog identity
    pub fn dialog(&self) -> Dialog {
        self.inner.lock().core.dialog.clone()
    }

    /// SDP hook runs still in flight
    pub fn pending_sdp_answers(&self) -> usize {
        self.inner.lock().core.pending_sdp
    }

    pub fn local_sdp(&self) -> Option<MsgBody> {
        self.inner.lock().core.local_sdp.clone()
    }

    pub fn remote_sdp(&self) -> Option<MsgBody> {
        self.inner.lock().core.remote_sdp.clone()
    }

    pub fn setup_time(&self) -> MonoTime {
        self.inner.lock().core.setup_time
    }

    pub fn connect_time(&self) -> Option<MonoTime> {
        self.inner.lock().core.connect_time
    }

    pub fn disconnect_time(&self) -> Option<MonoTime> {
        self.inner.lock().core.disconnect_time
    }

    /// Feed an event from the controller
    pub fn recv_event(&self, event: CCEvent) {
        let _guard = self.lock.lock();
        let event = match self.inner.lock().core.intercept_local(event) {
            Some(event) => event,
            None => return,
        };
        debug!(call_id = %self.call_id(), "received {}", event);
        self.dispatch(|state, core| state.recv_event(core, event));
        self.flush();
    }

    /// Queue an event for the controller as if this leg produced it. Events
    /// older than the last one delivered are dropped.
    pub fn emit_event(&self, event: CCEvent) {
        let _guard = self.lock.lock();
        self.inner.lock().core.emit(event);
        self.flush();
    }

    pub(crate) fn recv_cancel(&self, cancel: Request) {
        let _guard = self.lock.lock();
        self.dispatch(|state, core| state.recv_cancel(core, cancel));
        self.flush();
    }

    pub(crate) fn recv_ack(&self, ack: Request) {
        let _guard = self.lock.lock();
        self.dispatch(|state, core| state.recv_ack(core, ack));
        self.flush();
    }

    pub(crate) fn on_timer(&self, timer: UaTimer) {
        let _guard = self.lock.lock();
        self.dispatch(|state, core| {
            core.timer_fired(timer);
            debug!(call_id = %core.dialog.call_id, state = %state.kind(), "{:?} timer fired", timer);
            state.on_timer(core, timer)
        });
        self.flush();
    }

    pub(crate) fn remote_sdp_ready(&self, mut event: CCEvent, result: DialogResult<MsgBody>) {
        let _guard = self.lock.lock();
        {
            let mut inner = self.inner.lock();
            let core = &mut inner.core;
            core.pending_sdp = core.pending_sdp.saturating_sub(1);
            match result {
                Ok(body) => event.set_body(Some(body)),
                Err(e) => warn!(call_id = %core.dialog.call_id, "remote SDP hook failed, passing body as is: {}", e),
            }
            core.emit(event);
        }
        self.flush();
    }

    pub(crate) fn local_sdp_ready(&self, mut event: CCEvent, result: DialogResult<MsgBody>) {
        let _guard = self.lock.lock();
        {
            let mut inner = self.inner.lock();
            let core = &mut inner.core;
            core.pending_sdp = core.pending_sdp.saturating_sub(1);
            match result {
                Ok(body) => event.set_body(Some(body)),
                Err(e) => {
                    warn!(call_id = %core.dialog.call_id, "local SDP hook failed, sending body as is: {}", e);
                    if let Some(Some(body)) = event.body_slot() {
                        body.set_needs_update(false);
                    }
                }
            }
        }
        self.recv_event(event);
    }

    fn dispatch<F>(&self, handler: F)
    where
        F: FnOnce(&mut dyn UaState, &mut UaCore) -> Option<Transition>,
    {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(transition) = handler(inner.state.as_mut(), &mut inner.core) {
            Self::change_state(inner, transition);
        }
    }

    /// Deactivate the old state, queue the listener call, activate the new
    /// state and feed it any replayed events
    fn change_state(inner: &mut UaInner, first: Transition) {
        let mut next = Some(first);
        while let Some(transition) = next.take() {
            let old = inner.state.kind();
            inner.state.on_deactivation(&mut inner.core);
            inner.state = transition.next;
            debug!(call_id = %inner.core.dialog.call_id, "{} -> {}", old, inner.state.kind());
            if let Some(callback) = transition.callback {
                inner.core.notify(callback);
            }
            inner.state.on_activation(&mut inner.core);

            let mut replay = transition.replay.into_iter();
            while let Some(event) = replay.next() {
                if let Some(mut chained) = inner.state.recv_event(&mut inner.core, event) {
                    chained.replay.extend(replay.by_ref());
                    next = Some(chained);
                    break;
                }
            }
        }
    }

    /// Run queued side effects with the UA data unlocked
    fn flush(&self) {
        let effects = std::mem::take(&mut self.inner.lock().core.effects);
        if effects.is_empty() {
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };
        for effect in effects {
            match effect {
                Effect::Event(event) => {
                    let controller = self.controller.lock().clone();
                    match controller {
                        Some(controller) => controller.recv_event(event, &me),
                        None => debug!(call_id = %self.call_id(), "no controller for {}", event),
                    }
                }
                Effect::Listener(call) => {
                    let listeners = self.listeners.lock().clone();
                    for listener in listeners {
                        match &call {
                            ListenerCall::Ring { scode } => listener.on_ring(&me, *scode),
                            ListenerCall::Connect => listener.on_connect(&me),
                            ListenerCall::Disconnect { origin } => listener.on_disconnect(&me, origin),
                            ListenerCall::Fail { scode } => listener.on_fail(&me, *scode),
                        }
                    }
                }
                Effect::Dead => self.release(&me),
            }
        }
    }

    /// Final cleanup once Dead is reached
    fn release(&self, me: &Arc<Ua>) {
        let (call_id, registered) = {
            let mut inner = self.inner.lock();
            let registered = std::mem::replace(&mut inner.core.registered, false);
            (inner.core.dialog.call_id.clone(), registered)
        };
        if registered {
            let receiver: Arc<dyn RequestReceiver> = me.clone();
            self.tm.unreg_consumer(&receiver, &call_id);
        }
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in listeners {
            listener.on_dead(me);
        }
        self.controller.lock().take();
        debug!(call_id = %call_id, "call leg released");
    }
}

impl RequestReceiver for Ua {
    fn recv_request(&self, req: Request, tx: &Arc<ServerTransaction>) {
        let _guard = self.lock.lock();
        self.dispatch(|state, core| {
            let in_dialog = state.kind() != UaStateKind::UasIdle;
            if in_dialog && req.method != Method::Ack {
                if let Ok(cseq) = req.cseq() {
                    if !core.dialog.accept_remote_cseq(cseq.seq) {
                        debug!(call_id = %core.dialog.call_id, "CSeq {} went backwards", cseq.seq);
                        core.respond(tx, &req, 500, "Server Internal Error");
                        return None;
                    }
                }
            }
            match req.method {
                Method::Prack => state.recv_prack(core, req, tx),
                _ => state.recv_request(core, req, tx),
            }
        });
        self.flush();
    }

    fn session_lock(&self) -> SessionLock {
        self.lock.clone()
    }

    fn is_yours(&self, req: &Request) -> bool {
        self.inner.lock().core.dialog.matches(req)
    }
}

impl ResponseReceiver for Ua {
    fn recv_response(&self, resp: Response, tx: &Arc<ClientTransaction>) {
        let _guard = self.lock.lock();
        self.dispatch(|state, core| {
            if resp.is_final() {
                if let Ok(cseq) = tx.request().cseq() {
                    core.outstanding.remove(&cseq.seq);
                }
            }
            state.recv_response(core, resp, tx)
        });
        self.flush();
    }
}

impl fmt::Debug for Ua {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Ua")
            .field("call_id", &inner.core.dialog.call_id)
            .field("state", &inner.state.kind())
            .finish()
    }
}
