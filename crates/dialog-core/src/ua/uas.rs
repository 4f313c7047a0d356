//! UAS side: answering an incoming INVITE

use std::sync::Arc;

use b2bua_sip_core::{HeaderAccess, Method, MsgBody, Reason, Request, SipHeader};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::events::{CCEvent, CCEventKind};
use crate::transaction::ServerTransaction;
use crate::ua::leg::UaCore;
use crate::ua::session::{disconnected, local_hangup, remote_bye, Connected, Failed};
use crate::ua::state::{ListenerCall, Transition, UaState, UaStateKind, UaTimer};

pub(crate) fn idle() -> Box<dyn UaState> {
    Box::new(UasIdle)
}

/// Waiting for the INVITE the leg was created for
pub(crate) struct UasIdle;

impl UaState for UasIdle {
    fn kind(&self) -> UaStateKind {
        UaStateKind::UasIdle
    }

    fn recv_request(
        &mut self,
        ua: &mut UaCore,
        req: Request,
        tx: &Arc<ServerTransaction>,
    ) -> Option<Transition> {
        if req.method != Method::Invite {
            ua.respond(tx, &req, 481, "Call Leg/Transaction Does Not Exist");
            return None;
        }
        tx.set_to_tag(&ua.dialog.local_tag);
        ua.register();
        ua.watch_invite(tx);
        if req.body().map(|b| b.is_malformed_sdp()).unwrap_or(false) {
            warn!(call_id = %ua.dialog.call_id, "INVITE with unparseable SDP");
            ua.answer_invite(400, "Malformed SDP", None, &[]);
            return Some(Transition::to(Failed).with_callback(ListenerCall::Fail { scode: 400 }));
        }
        ua.respond(tx, &req, 100, "Trying");

        let from = req.from_addr().ok();
        let cli = from
            .and_then(|a| a.uri.user.clone())
            .unwrap_or_default();
        let caller_name = from.and_then(|a| a.display_name.clone());
        let cld = req
            .uri
            .user
            .clone()
            .or_else(|| req.to_addr().ok().and_then(|a| a.uri.user.clone()))
            .unwrap_or_default();
        ua.remote_sdp = req.body().cloned();
        let event = ua.event(
            CCEventKind::Try {
                call_id: ua.dialog.call_id.clone(),
                cli,
                cld,
                body: req.body().cloned(),
                caller_name,
            },
            req.rtime,
        );
        info!(call_id = %ua.dialog.call_id, "incoming call {}", event);
        ua.emit_remote(event);
        Some(Transition::to(UasTrying { ringing: false }))
    }
}

/// Whether the INVITE can be answered with reliable provisionals
fn wants_reliable(ua: &UaCore) -> bool {
    ua.config.enable_100rel
        && ua
            .invite_stx
            .as_ref()
            .map(|tx| tx.request().supports("100rel") || tx.request().requires("100rel"))
            .unwrap_or(false)
}

/// Final answer or progress for the pending INVITE, shared by the early
/// states. `ringing` tells whether a 18x went out already.
fn early_event(ua: &mut UaCore, event: CCEvent, ringing: bool) -> Option<Transition> {
    let CCEvent {
        kind,
        extra_headers,
        reason,
        origin,
        ..
    } = event;
    match kind {
        CCEventKind::Ring { scode, reason, body } => {
            let scode = if (101..200).contains(&scode) { scode } else { 180 };
            if let Some(body) = &body {
                ua.local_sdp = Some(body.clone());
            }
            if wants_reliable(ua) {
                let rseq = ua
                    .rseq
                    .map(|r| r.wrapping_add(1))
                    .unwrap_or_else(|| rand::thread_rng().gen_range(1..=0x7fff_ffff));
                let mut headers = vec![
                    SipHeader::Require("100rel".to_string()),
                    SipHeader::RSeq(rseq),
                ];
                headers.extend(extra_headers);
                let (tx, resp) = ua.invite_response(scode, &reason, body, &headers)?;
                if let Err(e) = tx.send_reliable_provisional(resp) {
                    warn!(call_id = %ua.dialog.call_id, "cannot send reliable {}: {}", scode, e);
                    return None;
                }
                ua.rseq = Some(rseq);
                return Some(
                    Transition::to(UasRingingRel {
                        rseq,
                        queued: Vec::new(),
                    })
                    .with_callback(ListenerCall::Ring { scode }),
                );
            }
            ua.answer_invite(scode, &reason, body, &extra_headers);
            (!ringing).then(|| {
                Transition::to(UasTrying { ringing: true }).with_callback(ListenerCall::Ring { scode })
            })
        }
        CCEventKind::Connect { scode, reason, body } | CCEventKind::PreConnect { scode, reason, body } => {
            let scode = if (200..300).contains(&scode) { scode } else { 200 };
            let offerless = ua
                .invite_stx
                .as_ref()
                .map(|tx| tx.request().body().is_none())
                .unwrap_or(false);
            let body = ua.update_local_sdp(body.as_ref());
            ua.expect_ack();
            ua.answer_invite(scode, &reason, body, &extra_headers);
            if offerless {
                // Our 200 carries the offer, the answer comes with the ACK
                return Some(Transition::to(UasPreConnect));
            }
            Some(Transition::to(Connected).with_callback(ListenerCall::Connect))
        }
        CCEventKind::Redirect { scode, reason, contacts } => {
            let scode = if (300..400).contains(&scode) { scode } else { 302 };
            let mut headers: Vec<SipHeader> = contacts.into_iter().map(SipHeader::Contact).collect();
            headers.extend(extra_headers);
            ua.answer_invite(scode, &reason, None, &headers);
            Some(Transition::to(Failed).with_callback(ListenerCall::Fail { scode }))
        }
        CCEventKind::Fail {
            scode,
            reason: text,
            challenges,
        } => {
            let scode = if (400..700).contains(&scode) { scode } else { 500 };
            let mut headers = challenges;
            headers.extend(extra_headers);
            headers.extend(reason.map(SipHeader::Reason));
            ua.answer_invite(scode, &text, None, &headers);
            Some(Transition::to(Failed).with_callback(ListenerCall::Fail { scode }))
        }
        CCEventKind::Disconnect { .. } => {
            let mut headers = extra_headers;
            headers.extend(reason.map(SipHeader::Reason));
            ua.answer_invite(487, "Request Terminated", None, &headers);
            Some(disconnected(&origin))
        }
        other => {
            debug!(call_id = %ua.dialog.call_id, "{} ignored before answer", other.name());
            None
        }
    }
}

/// CANCEL for the pending INVITE
fn early_cancel(ua: &mut UaCore, cancel: Request) -> Option<Transition> {
    ua.answer_invite(487, "Request Terminated", None, &[]);
    let mut event = ua.event(CCEventKind::Disconnect { redirect_to: None }, cancel.rtime);
    if let Some(reason) = cancel.reason() {
        event = event.with_reason(reason.clone());
    }
    ua.emit(event);
    Some(disconnected(ua.origin))
}

/// BYE inside the early dialog
fn early_request(ua: &mut UaCore, req: Request, tx: &Arc<ServerTransaction>) -> Option<Transition> {
    match req.method {
        Method::Bye => {
            ua.answer_invite(487, "Request Terminated", None, &[]);
            Some(remote_bye(ua, &req, tx))
        }
        _ => {
            ua.respond(tx, &req, 491, "Request Pending");
            None
        }
    }
}

/// INVITE received, no final answer yet
pub(crate) struct UasTrying {
    pub ringing: bool,
}

impl UaState for UasTrying {
    fn kind(&self) -> UaStateKind {
        if self.ringing {
            UaStateKind::UasRinging
        } else {
            UaStateKind::UasTrying
        }
    }

    fn recv_event(&mut self, ua: &mut UaCore, event: CCEvent) -> Option<Transition> {
        early_event(ua, event, self.ringing)
    }

    fn recv_cancel(&mut self, ua: &mut UaCore, cancel: Request) -> Option<Transition> {
        early_cancel(ua, cancel)
    }

    fn recv_request(
        &mut self,
        ua: &mut UaCore,
        req: Request,
        tx: &Arc<ServerTransaction>,
    ) -> Option<Transition> {
        early_request(ua, req, tx)
    }
}

/// Reliable 18x sent, waiting for its PRACK. Events other than a final
/// rejection are held until then.
pub(crate) struct UasRingingRel {
    rseq: u32,
    queued: Vec<CCEvent>,
}

impl UaState for UasRingingRel {
    fn kind(&self) -> UaStateKind {
        UaStateKind::UasRingingRel
    }

    fn on_activation(&mut self, ua: &mut UaCore) {
        let wait = ua.tm.config().timers.timer_h;
        ua.start_timer(UaTimer::PrackWait, wait);
    }

    fn on_deactivation(&mut self, ua: &mut UaCore) {
        ua.cancel_timer(UaTimer::PrackWait);
    }

    fn recv_event(&mut self, ua: &mut UaCore, event: CCEvent) -> Option<Transition> {
        match event.kind {
            CCEventKind::Fail { .. } | CCEventKind::Redirect { .. } | CCEventKind::Disconnect { .. } => {
                early_event(ua, event, true)
            }
            _ => {
                debug!(call_id = %ua.dialog.call_id, "holding {} until PRACK", event);
                self.queued.push(event);
                None
            }
        }
    }

    fn recv_prack(
        &mut self,
        ua: &mut UaCore,
        req: Request,
        tx: &Arc<ServerTransaction>,
    ) -> Option<Transition> {
        let invite_cseq = ua
            .invite_stx
            .as_ref()
            .and_then(|stx| stx.request().cseq().ok().map(|c| c.seq));
        let matched = req
            .rack()
            .map(|rack| rack.rseq == self.rseq && Some(rack.cseq) == invite_cseq && rack.method == Method::Invite)
            .unwrap_or(false);
        if !matched {
            ua.respond(tx, &req, 481, "Call Leg/Transaction Does Not Exist");
            return None;
        }
        if let Some(stx) = &ua.invite_stx {
            stx.prack_received();
        }
        ua.respond(tx, &req, 200, "OK");
        let queued = std::mem::take(&mut self.queued);
        Some(Transition::to(UasTrying { ringing: true }).with_replay(queued))
    }

    fn recv_cancel(&mut self, ua: &mut UaCore, cancel: Request) -> Option<Transition> {
        early_cancel(ua, cancel)
    }

    fn recv_request(
        &mut self,
        ua: &mut UaCore,
        req: Request,
        tx: &Arc<ServerTransaction>,
    ) -> Option<Transition> {
        early_request(ua, req, tx)
    }

    fn on_timer(&mut self, ua: &mut UaCore, timer: UaTimer) -> Option<Transition> {
        if timer != UaTimer::PrackWait {
            return None;
        }
        info!(call_id = %ua.dialog.call_id, "no PRACK for reliable provisional");
        ua.answer_invite(504, "Server Time-out", None, &[]);
        let event = ua.event(
            CCEventKind::Fail {
                scode: 504,
                reason: "Server Time-out".to_string(),
                challenges: Vec::new(),
            },
            None,
        );
        ua.emit(event);
        Some(Transition::to(Failed).with_callback(ListenerCall::Fail { scode: 504 }))
    }
}

/// 200 with our offer sent for an offer-less INVITE; the ACK brings the
/// answer
pub(crate) struct UasPreConnect;

impl UaState for UasPreConnect {
    fn kind(&self) -> UaStateKind {
        UaStateKind::UasPreConnect
    }

    fn recv_ack(&mut self, ua: &mut UaCore, ack: Request) -> Option<Transition> {
        let Some(body) = ack.body().cloned() else {
            info!(call_id = %ua.dialog.call_id, "ACK without answer SDP, hanging up");
            return Some(hangup(ua, 488, "Not Acceptable Here"));
        };
        ua.remote_sdp = Some(body.clone());
        let event = ua.event(
            CCEventKind::Connect {
                scode: 200,
                reason: "OK".to_string(),
                body: Some(body),
            },
            ack.rtime,
        );
        ua.emit_remote(event);
        Some(Transition::to(Connected).with_callback(ListenerCall::Connect))
    }

    fn recv_request(
        &mut self,
        ua: &mut UaCore,
        req: Request,
        tx: &Arc<ServerTransaction>,
    ) -> Option<Transition> {
        match req.method {
            Method::Bye => Some(remote_bye(ua, &req, tx)),
            _ => {
                ua.respond(tx, &req, 491, "Request Pending");
                None
            }
        }
    }

    fn recv_event(&mut self, ua: &mut UaCore, event: CCEvent) -> Option<Transition> {
        match event.kind {
            CCEventKind::Disconnect { .. } | CCEventKind::Fail { .. } | CCEventKind::Redirect { .. } => {
                ua.send_bye(event.reason, event.extra_headers);
                Some(disconnected(&event.origin))
            }
            _ => None,
        }
    }

    fn on_timer(&mut self, ua: &mut UaCore, timer: UaTimer) -> Option<Transition> {
        (timer == UaTimer::NoAck).then(|| hangup(ua, 408, "No ACK"))
    }
}

fn hangup(ua: &mut UaCore, cause: u16, text: &str) -> Transition {
    let origin = ua.origin;
    local_hangup(ua, origin, Reason::sip(cause, text))
}

/// Re-INVITE received while connected, waiting for the controller's answer
pub(crate) struct UasUpdating;

impl UaState for UasUpdating {
    fn kind(&self) -> UaStateKind {
        UaStateKind::UasUpdating
    }

    fn is_connected(&self) -> bool {
        true
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
            CCEventKind::Ring { scode, reason, body } => {
                let scode = if (101..200).contains(&scode) { scode } else { 180 };
                ua.answer_invite(scode, &reason, body, &extra_headers);
                None
            }
            CCEventKind::Connect { scode, reason, body } | CCEventKind::PreConnect { scode, reason, body } => {
                let scode = if (200..300).contains(&scode) { scode } else { 200 };
                Some(accept_update(ua, scode, &reason, body, &extra_headers))
            }
            CCEventKind::Update { body } => Some(accept_update(ua, 200, "OK", body, &extra_headers)),
            CCEventKind::Fail { scode, reason, .. } | CCEventKind::Redirect { scode, reason, .. } => {
                let scode = if (300..700).contains(&scode) { scode } else { 488 };
                ua.answer_invite(scode, &reason, None, &extra_headers);
                Some(Transition::to(Connected))
            }
            CCEventKind::Disconnect { .. } => {
                ua.answer_invite(487, "Request Terminated", None, &[]);
                ua.send_bye(reason, extra_headers);
                Some(disconnected(&origin))
            }
            other => {
                debug!(call_id = %ua.dialog.call_id, "{} ignored during re-INVITE", other.name());
                None
            }
        }
    }

    fn recv_request(
        &mut self,
        ua: &mut UaCore,
        req: Request,
        tx: &Arc<ServerTransaction>,
    ) -> Option<Transition> {
        early_request(ua, req, tx)
    }

    fn recv_cancel(&mut self, ua: &mut UaCore, _cancel: Request) -> Option<Transition> {
        ua.answer_invite(487, "Request Terminated", None, &[]);
        Some(Transition::to(Connected))
    }

    fn on_timer(&mut self, ua: &mut UaCore, timer: UaTimer) -> Option<Transition> {
        Connected.on_timer(ua, timer)
    }
}

/// 2xx for a re-INVITE
fn accept_update(
    ua: &mut UaCore,
    scode: u16,
    reason: &str,
    body: Option<MsgBody>,
    extra_headers: &[SipHeader],
) -> Transition {
    let body = ua.update_local_sdp(body.as_ref());
    ua.expect_ack();
    ua.answer_invite(scode, reason, body, extra_headers);
    Transition::to(Connected)
}
