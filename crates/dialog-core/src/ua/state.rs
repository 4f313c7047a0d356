//! UA state machine plumbing
//!
//! Each state is its own type implementing [`UaState`]. Handlers get the
//! UA's mutable data ([`UaCore`]) and return a [`Transition`] to move on, or
//! `None` to stay. The UA deactivates the old state, queues the transition's
//! listener notification, then activates the new state.

use std::fmt;
use std::sync::Arc;

use b2bua_sip_core::{Request, Response};
use tracing::debug;

use crate::events::CCEvent;
use crate::transaction::{ClientTransaction, ServerTransaction};
use crate::ua::leg::UaCore;

/// Observable name of the active state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UaStateKind {
    UasIdle,
    UasTrying,
    UasRinging,
    UasRingingRel,
    UasUpdating,
    UasPreConnect,
    UacIdle,
    UacTrying,
    UacRinging,
    UacUpdating,
    UacCancelling,
    Connected,
    Disconnected,
    Failed,
    Dead,
}

impl fmt::Display for UaStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Timers a state can be woken up by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UaTimer {
    NoReply,
    NoProgress,
    Expire,
    Credit,
    Keepalive,
    GoDead,
    /// No PRACK for a reliable provisional response
    PrackWait,
    /// No final response to a cancelled INVITE
    CancelWait,
    /// No ACK for our 2xx
    NoAck,
}

/// Listener notification fired when a transition completes
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerCall {
    Ring { scode: u16 },
    Connect,
    Disconnect { origin: String },
    Fail { scode: u16 },
}

pub(crate) struct Transition {
    pub next: Box<dyn UaState>,
    pub callback: Option<ListenerCall>,
    /// Events to feed to the new state once it is active
    pub replay: Vec<CCEvent>,
}

impl Transition {
    pub fn to(next: impl UaState + 'static) -> Self {
        Transition {
            next: Box::new(next),
            callback: None,
            replay: Vec::new(),
        }
    }

    pub fn with_callback(mut self, callback: ListenerCall) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_replay(mut self, events: Vec<CCEvent>) -> Self {
        self.replay = events;
        self
    }
}

pub(crate) trait UaState: Send {
    fn kind(&self) -> UaStateKind;

    fn recv_request(
        &mut self,
        ua: &mut UaCore,
        req: Request,
        tx: &Arc<ServerTransaction>,
    ) -> Option<Transition> {
        debug!(call_id = %ua.dialog.call_id, state = %self.kind(), "unexpected {} request", req.method);
        ua.respond(tx, &req, 481, "Call Leg/Transaction Does Not Exist");
        None
    }

    fn recv_response(
        &mut self,
        _ua: &mut UaCore,
        _resp: Response,
        _tx: &Arc<ClientTransaction>,
    ) -> Option<Transition> {
        None
    }

    fn recv_event(&mut self, ua: &mut UaCore, event: CCEvent) -> Option<Transition> {
        debug!(call_id = %ua.dialog.call_id, state = %self.kind(), "ignoring event {}", event);
        None
    }

    fn recv_cancel(&mut self, _ua: &mut UaCore, _cancel: Request) -> Option<Transition> {
        None
    }

    fn recv_prack(
        &mut self,
        ua: &mut UaCore,
        req: Request,
        tx: &Arc<ServerTransaction>,
    ) -> Option<Transition> {
        ua.respond(tx, &req, 481, "Call Leg/Transaction Does Not Exist");
        None
    }

    fn recv_ack(&mut self, _ua: &mut UaCore, _ack: Request) -> Option<Transition> {
        None
    }

    fn on_timer(&mut self, _ua: &mut UaCore, _timer: UaTimer) -> Option<Transition> {
        None
    }

    fn on_activation(&mut self, _ua: &mut UaCore) {}

    fn on_deactivation(&mut self, _ua: &mut UaCore) {}

    fn is_connected(&self) -> bool {
        false
    }
}
