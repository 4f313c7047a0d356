//! States shared by both sides of a call: the established call and its
//! teardown

use std::sync::Arc;

use b2bua_sip_core::{HeaderAccess, Method, Reason, Request, Response, SipHeader};
use tracing::{debug, info};

use crate::events::{CCEvent, CCEventKind};
use crate::transaction::{ClientTransaction, ServerTransaction};
use crate::ua::leg::{Effect, UaCore};
use crate::ua::state::{ListenerCall, Transition, UaState, UaStateKind, UaTimer};
use crate::ua::{uac, uas};

/// Peer hung up with BYE: confirm it and tell the controller
pub(crate) fn remote_bye(ua: &mut UaCore, req: &Request, tx: &Arc<ServerTransaction>) -> Transition {
    ua.respond(tx, req, 200, "OK");
    let mut event = ua.event(CCEventKind::Disconnect { redirect_to: None }, req.rtime);
    if let Some(reason) = req.reason() {
        event = event.with_reason(reason.clone());
    }
    ua.emit(event);
    disconnected(ua.origin)
}

/// Transition to Disconnected, blaming `origin`
pub(crate) fn disconnected(origin: &str) -> Transition {
    Transition::to(Disconnected).with_callback(ListenerCall::Disconnect {
        origin: origin.to_string(),
    })
}

/// Hang up from our side and report it to the controller with `reason`
pub(crate) fn local_hangup(ua: &mut UaCore, origin: &str, reason: Reason) -> Transition {
    ua.send_bye(Some(reason.clone()), Vec::new());
    let event = ua
        .event(CCEventKind::Disconnect { redirect_to: None }, None)
        .with_reason(reason);
    ua.emit(event);
    disconnected(origin)
}

/// Call established
pub(crate) struct Connected;

impl Connected {
    fn recv_reinvite(
        &mut self,
        ua: &mut UaCore,
        req: Request,
        tx: &Arc<ServerTransaction>,
    ) -> Option<Transition> {
        if req.body().map(|b| b.is_malformed_sdp()).unwrap_or(false) {
            ua.respond(tx, &req, 488, "Not Acceptable Here");
            return None;
        }
        ua.respond(tx, &req, 100, "Trying");
        ua.watch_invite(tx);
        let body = match req.body() {
            Some(body) => {
                ua.remote_sdp = Some(body.clone());
                Some(body.clone())
            }
            // Offer-less re-INVITE: put the other side on hold
            None => ua.remote_sdp.clone().map(|mut body| {
                if let Some(sdp) = body.sdp_mut() {
                    sdp.hold();
                }
                body
            }),
        };
        let event = ua.event(CCEventKind::Update { body }, req.rtime);
        ua.emit_remote(event);
        Some(Transition::to(uas::UasUpdating))
    }
}

impl UaState for Connected {
    fn kind(&self) -> UaStateKind {
        UaStateKind::Connected
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn on_activation(&mut self, ua: &mut UaCore) {
        ua.mark_connected();
        if let Some(credit) = ua.config.credit_time {
            if !ua.timer_armed(UaTimer::Credit) {
                ua.start_timer(UaTimer::Credit, credit);
            }
        }
        if let Some(interval) = ua.config.keepalive_interval {
            if !ua.timer_armed(UaTimer::Keepalive) {
                ua.start_periodic(UaTimer::Keepalive, interval);
            }
        }
    }

    fn recv_request(
        &mut self,
        ua: &mut UaCore,
        req: Request,
        tx: &Arc<ServerTransaction>,
    ) -> Option<Transition> {
        match req.method {
            Method::Invite => self.recv_reinvite(ua, req, tx),
            Method::Bye => Some(remote_bye(ua, &req, tx)),
            Method::Refer => {
                let Some(target) = req.refer_to().cloned() else {
                    ua.respond(tx, &req, 400, "Bad Request - Refer-To missing");
                    return None;
                };
                ua.respond(tx, &req, 202, "Accepted");
                info!(call_id = %ua.dialog.call_id, "call transferred to {}", target);
                ua.send_bye(Some(Reason::sip(200, "Call Transferred")), Vec::new());
                let event = ua.event(
                    CCEventKind::Disconnect {
                        redirect_to: Some(target),
                    },
                    req.rtime,
                );
                ua.emit(event);
                Some(disconnected(ua.origin))
            }
            Method::Info => {
                ua.respond(tx, &req, 200, "OK");
                let event = ua.event(
                    CCEventKind::Info {
                        body: req.body().cloned(),
                    },
                    req.rtime,
                );
                ua.emit(event);
                None
            }
            Method::Options => {
                ua.respond(tx, &req, 200, "OK");
                None
            }
            _ => {
                ua.respond(tx, &req, 501, "Not Implemented");
                None
            }
        }
    }

    fn recv_response(
        &mut self,
        ua: &mut UaCore,
        resp: Response,
        tx: &Arc<ClientTransaction>,
    ) -> Option<Transition> {
        if *tx.method() != Method::Options || !matches!(resp.scode, 408 | 481) {
            return None;
        }
        info!(call_id = %ua.dialog.call_id, "keepalive got {}, peer is gone", resp.scode);
        let reason = Reason::sip(resp.scode, &resp.reason);
        if resp.scode == 408 {
            ua.send_bye(Some(reason.clone()), Vec::new());
        }
        let event = ua
            .event(CCEventKind::Disconnect { redirect_to: None }, resp.rtime)
            .with_reason(reason);
        ua.emit(event);
        Some(disconnected(ua.origin))
    }

    fn recv_event(&mut self, ua: &mut UaCore, event: CCEvent) -> Option<Transition> {
        let CCEvent {
            kind,
            extra_headers,
            reason,
            origin,
            ..
        } = event;
        match kind {
            CCEventKind::Update { body } => {
                let body = ua.update_local_sdp(body.as_ref());
                match ua.send_request(Method::Invite, body, extra_headers) {
                    Ok(tx) => {
                        ua.invite_ctx = Some(tx);
                        Some(Transition::to(uac::UacUpdating))
                    }
                    Err(e) => {
                        debug!(call_id = %ua.dialog.call_id, "cannot send re-INVITE: {}", e);
                        None
                    }
                }
            }
            CCEventKind::Connect { body, .. } | CCEventKind::PreConnect { body, .. } => {
                // Answer to an offer received in a 2xx
                if ua.pending_ack.is_some() {
                    let body = ua.update_local_sdp(body.as_ref());
                    ua.release_ack(body);
                }
                None
            }
            CCEventKind::Info { body } => {
                ua.send(Method::Info, body, extra_headers);
                None
            }
            CCEventKind::Disconnect {
                redirect_to: Some(target),
            } => {
                let mut headers = vec![SipHeader::ReferTo(target)];
                headers.extend(extra_headers);
                ua.send(Method::Refer, None, headers);
                Some(disconnected(&origin))
            }
            CCEventKind::Disconnect { redirect_to: None }
            | CCEventKind::Fail { .. }
            | CCEventKind::Redirect { .. } => {
                ua.release_ack(None);
                ua.send_bye(reason, extra_headers);
                Some(disconnected(&origin))
            }
            other => {
                debug!(call_id = %ua.dialog.call_id, "{} ignored while connected", other.name());
                None
            }
        }
    }

    fn recv_ack(&mut self, ua: &mut UaCore, ack: Request) -> Option<Transition> {
        debug!(call_id = %ua.dialog.call_id, "ACK for 2xx received");
        if let (Some(body), None) = (ack.body(), ua.remote_sdp.as_ref()) {
            ua.remote_sdp = Some(body.clone());
        }
        None
    }

    fn on_timer(&mut self, ua: &mut UaCore, timer: UaTimer) -> Option<Transition> {
        match timer {
            UaTimer::Credit => {
                info!(call_id = %ua.dialog.call_id, "credit time exhausted");
                let origin = ua.origin;
                Some(local_hangup(ua, origin, Reason::sip(200, "Credit Time Exceeded")))
            }
            UaTimer::Keepalive => {
                ua.send(Method::Options, None, Vec::new());
                None
            }
            UaTimer::NoAck => {
                info!(call_id = %ua.dialog.call_id, "no ACK for 2xx, hanging up");
                let origin = ua.origin;
                Some(local_hangup(ua, origin, Reason::sip(408, "No ACK")))
            }
            _ => None,
        }
    }
}

/// Arm the godead timer and stop everything else
fn start_teardown(ua: &mut UaCore) {
    ua.cancel_timers();
    ua.mark_disconnected();
    ua.invite_ctx = None;
    ua.start_timer(UaTimer::GoDead, ua.config.godead_timeout);
}

fn teardown_request(ua: &mut UaCore, req: &Request, tx: &Arc<ServerTransaction>) {
    match req.method {
        Method::Bye => ua.respond(tx, req, 200, "OK"),
        _ => ua.respond(tx, req, 481, "Call Leg/Transaction Does Not Exist"),
    }
}

/// Call ended normally; lingers to absorb retransmissions
pub(crate) struct Disconnected;

impl UaState for Disconnected {
    fn kind(&self) -> UaStateKind {
        UaStateKind::Disconnected
    }

    fn on_activation(&mut self, ua: &mut UaCore) {
        start_teardown(ua);
    }

    fn recv_request(
        &mut self,
        ua: &mut UaCore,
        req: Request,
        tx: &Arc<ServerTransaction>,
    ) -> Option<Transition> {
        teardown_request(ua, &req, tx);
        None
    }

    fn on_timer(&mut self, _ua: &mut UaCore, timer: UaTimer) -> Option<Transition> {
        (timer == UaTimer::GoDead).then(|| Transition::to(Dead))
    }
}

/// Call never got established
pub(crate) struct Failed;

impl UaState for Failed {
    fn kind(&self) -> UaStateKind {
        UaStateKind::Failed
    }

    fn on_activation(&mut self, ua: &mut UaCore) {
        start_teardown(ua);
    }

    fn recv_request(
        &mut self,
        ua: &mut UaCore,
        req: Request,
        tx: &Arc<ServerTransaction>,
    ) -> Option<Transition> {
        teardown_request(ua, &req, tx);
        None
    }

    fn on_timer(&mut self, _ua: &mut UaCore, timer: UaTimer) -> Option<Transition> {
        (timer == UaTimer::GoDead).then(|| Transition::to(Dead))
    }
}

/// Terminal state: the leg releases its Call-ID and its controller
pub(crate) struct Dead;

impl UaState for Dead {
    fn kind(&self) -> UaStateKind {
        UaStateKind::Dead
    }

    fn on_activation(&mut self, ua: &mut UaCore) {
        ua.cancel_timers();
        ua.mark_disconnected();
        ua.invite_ctx = None;
        ua.invite_stx = None;
        ua.pending_ack = None;
        ua.outstanding.clear();
        ua.effects.push(Effect::Dead);
    }
}
