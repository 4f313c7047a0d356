//! UAC side: placing an outgoing INVITE

use std::sync::Arc;

use b2bua_sip_core::{
    Address, CSeq, HeaderAccess, HeaderName, Method, RAck, Reason, Request, Response, SipHeader,
    SipUri,
};
use tracing::{debug, info, warn};

use crate::events::{CCEvent, CCEventKind};
use crate::transaction::{ClientState, ClientTransaction, ServerTransaction};
use crate::ua::auth::authorization_header;
use crate::ua::dialog::Dialog;
use crate::ua::leg::UaCore;
use crate::ua::session::{disconnected, remote_bye, Connected, Dead, Disconnected, Failed};
use crate::ua::state::{ListenerCall, Transition, UaState, UaStateKind, UaTimer};

pub(crate) fn idle() -> Box<dyn UaState> {
    Box::new(UacIdle)
}

/// Waiting for the controller's `Try`
pub(crate) struct UacIdle;

impl UacIdle {
    /// Set up the dialog identity of the new call
    fn prepare_dialog(ua: &mut UaCore, call_id: &str, cli: &str, cld: &str, caller_name: Option<String>) {
        let call_id = if call_id.is_empty() {
            ua.dialog.call_id.clone()
        } else {
            call_id.to_string()
        };
        let remote_host = ua.dialog.remote_target.host.clone();
        let remote_port = ua.dialog.remote_target.port;
        let local = match ua.config.local_contact.as_ref() {
            Some(contact) => SipUri::new(Some(cli), contact.host.clone(), contact.port),
            None => {
                let laddress = ua
                    .destination
                    .as_ref()
                    .and_then(|d| ua.tm.binding_for(d).ok())
                    .map(|b| b.laddress);
                match laddress {
                    Some(laddress) => SipUri::from_host_port(Some(cli), &laddress),
                    None => SipUri::new(Some(cli), remote_host.clone(), None),
                }
            }
        };
        let mut local = Address::new(local);
        if let Some(name) = caller_name {
            local = local.with_display_name(name);
        }
        let remote = Address::new(SipUri::new(Some(cld), remote_host, remote_port));
        ua.dialog = Dialog::new_uac(&call_id, local, remote);
    }

    /// Arm the tightest setup timer: no-reply only when it is the shortest
    /// and under Timer B, then no-progress, then expire
    fn start_setup_timers(ua: &mut UaCore) {
        let timer_b = ua.tm.config().timers.timer_b;
        let no_reply = ua.config.no_reply_time;
        let no_progress = ua.config.no_progress_time;
        let expire = ua.config.expire_time;
        if let Some(t) = no_reply {
            let tightest = no_progress.map_or(true, |np| t < np) && expire.map_or(true, |e| t < e);
            if tightest && t < timer_b {
                ua.start_setup_timer(UaTimer::NoReply, t);
                return;
            }
        }
        if let Some(t) = no_progress {
            if expire.map_or(true, |e| t < e) {
                ua.start_setup_timer(UaTimer::NoProgress, t);
                return;
            }
        }
        if let Some(t) = expire {
            ua.start_setup_timer(UaTimer::Expire, t);
        }
    }
}

impl UaState for UacIdle {
    fn kind(&self) -> UaStateKind {
        UaStateKind::UacIdle
    }

    fn recv_event(&mut self, ua: &mut UaCore, event: CCEvent) -> Option<Transition> {
        let CCEvent {
            kind, extra_headers, ..
        } = event;
        let CCEventKind::Try {
            call_id,
            cli,
            cld,
            body,
            caller_name,
        } = kind
        else {
            debug!(call_id = %ua.dialog.call_id, "{} ignored before Try", kind.name());
            return None;
        };
        Self::prepare_dialog(ua, &call_id, &cli, &cld, caller_name);
        ua.register();
        let body = if ua.config.late_media { None } else { body };
        ua.local_sdp = body.clone();
        match ua.send_request(Method::Invite, body, extra_headers) {
            Ok(tx) => {
                info!(call_id = %ua.dialog.call_id, "calling {}", ua.dialog.remote_uri);
                ua.invite_ctx = Some(tx);
                Self::start_setup_timers(ua);
                Some(Transition::to(UacTrying { ringing: false }))
            }
            Err(e) => {
                warn!(call_id = %ua.dialog.call_id, "cannot send INVITE: {}", e);
                let event = ua.event(
                    CCEventKind::Fail {
                        scode: 500,
                        reason: e.to_string(),
                        challenges: Vec::new(),
                    },
                    None,
                );
                ua.emit(event);
                Some(Transition::to(Failed).with_callback(ListenerCall::Fail { scode: 500 }))
            }
        }
    }
}

/// Whether `tx` is the INVITE this leg is waiting on
fn is_current_invite(ua: &UaCore, tx: &Arc<ClientTransaction>) -> bool {
    ua.invite_ctx
        .as_ref()
        .map(|current| Arc::ptr_eq(current, tx))
        .unwrap_or(false)
}

/// INVITE sent, no final answer yet
pub(crate) struct UacTrying {
    pub ringing: bool,
}

impl UacTrying {
    fn recv_provisional(&mut self, ua: &mut UaCore, resp: Response) -> Option<Transition> {
        ua.cancel_timer(UaTimer::NoReply);
        if resp.scode == 100 {
            if let Some(t) = ua.config.no_progress_time {
                ua.start_setup_timer(UaTimer::NoProgress, t);
            } else if let Some(t) = ua.config.expire_time {
                ua.start_setup_timer(UaTimer::Expire, t);
            }
            return None;
        }
        ua.dialog.update_from_response(&resp);

        if resp.requires("100rel") {
            let Some(rseq) = resp.rseq() else {
                debug!(call_id = %ua.dialog.call_id, "reliable {} without RSeq", resp.scode);
                return None;
            };
            if ua.rseq.map(|last| rseq <= last).unwrap_or(false) {
                debug!(call_id = %ua.dialog.call_id, "RSeq {} seen already", rseq);
                return None;
            }
            ua.rseq = Some(rseq);
            let invite_cseq = resp.cseq().map(|c| c.seq).unwrap_or(ua.dialog.local_cseq);
            let rack = RAck {
                rseq,
                cseq: invite_cseq,
                method: Method::Invite,
            };
            ua.send(Method::Prack, None, vec![SipHeader::RAck(rack)]);
        }

        ua.cancel_timer(UaTimer::NoProgress);
        if let Some(t) = ua.config.expire_time {
            ua.start_setup_timer(UaTimer::Expire, t);
        }
        if let Some(body) = resp.body() {
            ua.remote_sdp = Some(body.clone());
        }
        let event = ua.event(
            CCEventKind::Ring {
                scode: resp.scode,
                reason: resp.reason.clone(),
                body: resp.body().cloned(),
            },
            resp.rtime,
        );
        ua.emit_remote(event);
        if self.ringing {
            return None;
        }
        Some(Transition::to(UacTrying { ringing: true }).with_callback(ListenerCall::Ring { scode: resp.scode }))
    }

    /// Re-send the INVITE with credentials for the challenge in `resp`
    fn retry_with_auth(ua: &mut UaCore, resp: &Response, tx: &Arc<ClientTransaction>) -> bool {
        if ua.auth_attempted {
            return false;
        }
        let Some(credentials) = ua.config.credentials.clone() else {
            return false;
        };
        let Some((proxy, challenge)) = resp.challenges().first().map(|(p, c)| (*p, (*c).clone())) else {
            return false;
        };
        let mut req = tx.request().clone();
        let uri = req.uri.to_string();
        let header = match authorization_header(&challenge, proxy, &credentials, Method::Invite.as_str(), &uri) {
            Ok(header) => header,
            Err(e) => {
                info!(call_id = %ua.dialog.call_id, "cannot answer challenge: {}", e);
                return false;
            }
        };
        ua.auth_attempted = true;
        req.remove_headers(&HeaderName::Via);
        req.set_header(SipHeader::CSeq(CSeq::new(ua.dialog.next_cseq(), Method::Invite)));
        req.append_header(header);
        let uack = req.body().is_none();
        match ua.start_client_transaction(req, tx.destination().clone(), uack) {
            Ok(new_tx) => {
                debug!(call_id = %ua.dialog.call_id, "INVITE re-sent with credentials");
                ua.invite_ctx = Some(new_tx);
                true
            }
            Err(e) => {
                warn!(call_id = %ua.dialog.call_id, "cannot re-send INVITE: {}", e);
                false
            }
        }
    }

    fn recv_final(&mut self, ua: &mut UaCore, resp: Response, tx: &Arc<ClientTransaction>) -> Option<Transition> {
        ua.cancel_timer(UaTimer::NoReply);
        ua.cancel_timer(UaTimer::NoProgress);
        ua.cancel_timer(UaTimer::Expire);

        if resp.is_success() {
            ua.dialog.update_from_response(&resp);
            ua.invite_ctx = None;
            if tx.state() == ClientState::Uack {
                ua.pending_ack = Some(tx.clone());
            }
            if let Some(body) = resp.body() {
                ua.remote_sdp = Some(body.clone());
            }
            let event = ua.event(
                CCEventKind::Connect {
                    scode: resp.scode,
                    reason: resp.reason.clone(),
                    body: resp.body().cloned(),
                },
                resp.rtime,
            );
            info!(call_id = %ua.dialog.call_id, "call answered");
            ua.emit_remote(event);
            return Some(Transition::to(Connected).with_callback(ListenerCall::Connect));
        }

        // The early dialog, if any, is gone
        ua.dialog.remote_tag = None;
        ua.dialog.route_set.clear();
        ua.dialog.remote_target = ua.dialog.remote_uri.uri.clone();

        if matches!(resp.scode, 401 | 407) && Self::retry_with_auth(ua, &resp, tx) {
            return None;
        }
        ua.invite_ctx = None;
        let kind = if (300..400).contains(&resp.scode) {
            CCEventKind::Redirect {
                scode: resp.scode,
                reason: resp.reason.clone(),
                contacts: resp.contacts().into_iter().cloned().collect(),
            }
        } else {
            let challenges = resp
                .headers()
                .iter()
                .filter(|h| matches!(h, SipHeader::WwwAuthenticate(_) | SipHeader::ProxyAuthenticate(_)))
                .cloned()
                .collect();
            CCEventKind::Fail {
                scode: resp.scode,
                reason: resp.reason.clone(),
                challenges,
            }
        };
        let mut event = ua.event(kind, resp.rtime);
        if let Some(reason) = resp.reason() {
            event = event.with_reason(reason.clone());
        }
        info!(call_id = %ua.dialog.call_id, "call failed with {}", resp.scode);
        ua.emit(event);
        Some(Transition::to(Failed).with_callback(ListenerCall::Fail { scode: resp.scode }))
    }

    /// Give up the call: CANCEL the INVITE and wait for its final answer
    fn cancel(ua: &mut UaCore, reason: Option<Reason>, extra_headers: Vec<SipHeader>) -> Transition {
        ua.cancel_timer(UaTimer::NoReply);
        ua.cancel_timer(UaTimer::NoProgress);
        ua.cancel_timer(UaTimer::Expire);
        let mut headers: Vec<SipHeader> = reason.into_iter().map(SipHeader::Reason).collect();
        headers.extend(extra_headers);
        if let Some(tx) = &ua.invite_ctx {
            tx.cancel(headers);
        }
        Transition::to(UacCancelling)
    }
}

impl UaState for UacTrying {
    fn kind(&self) -> UaStateKind {
        if self.ringing {
            UaStateKind::UacRinging
        } else {
            UaStateKind::UacTrying
        }
    }

    fn recv_response(
        &mut self,
        ua: &mut UaCore,
        resp: Response,
        tx: &Arc<ClientTransaction>,
    ) -> Option<Transition> {
        if !is_current_invite(ua, tx) {
            return None;
        }
        if resp.is_provisional() {
            self.recv_provisional(ua, resp)
        } else {
            self.recv_final(ua, resp, tx)
        }
    }

    fn recv_event(&mut self, ua: &mut UaCore, event: CCEvent) -> Option<Transition> {
        match event.kind {
            CCEventKind::Disconnect { .. } | CCEventKind::Fail { .. } | CCEventKind::Redirect { .. } => {
                info!(call_id = %ua.dialog.call_id, "cancelling call on {}", event);
                let origin = event.origin.clone();
                Some(Self::cancel(ua, event.reason, event.extra_headers).with_callback(ListenerCall::Disconnect { origin }))
            }
            _ => {
                debug!(call_id = %ua.dialog.call_id, "{} ignored while calling", event);
                None
            }
        }
    }

    fn on_timer(&mut self, ua: &mut UaCore, timer: UaTimer) -> Option<Transition> {
        let reason = match timer {
            UaTimer::NoReply => "No Reply",
            UaTimer::NoProgress => "No Progress",
            UaTimer::Expire => "Call Expired",
            _ => return None,
        };
        info!(call_id = %ua.dialog.call_id, "{}, giving up", reason);
        let event = ua.event(
            CCEventKind::Fail {
                scode: 408,
                reason: "Request Timeout".to_string(),
                challenges: Vec::new(),
            },
            None,
        );
        ua.emit(event);
        Some(Self::cancel(ua, Some(Reason::sip(408, reason)), Vec::new()).with_callback(ListenerCall::Fail { scode: 408 }))
    }
}

/// CANCEL sent, waiting for the INVITE's final answer
pub(crate) struct UacCancelling;

impl UaState for UacCancelling {
    fn kind(&self) -> UaStateKind {
        UaStateKind::UacCancelling
    }

    fn on_activation(&mut self, ua: &mut UaCore) {
        let wait = ua.tm.config().timers.timer_b;
        ua.start_timer(UaTimer::CancelWait, wait);
    }

    fn on_deactivation(&mut self, ua: &mut UaCore) {
        ua.cancel_timer(UaTimer::CancelWait);
    }

    fn recv_response(
        &mut self,
        ua: &mut UaCore,
        resp: Response,
        tx: &Arc<ClientTransaction>,
    ) -> Option<Transition> {
        if !is_current_invite(ua, tx) || resp.is_provisional() {
            return None;
        }
        ua.invite_ctx = None;
        if !resp.is_success() {
            return Some(Transition::to(Dead));
        }
        // Answered anyway: confirm and hang up right away
        info!(call_id = %ua.dialog.call_id, "{} after CANCEL, sending BYE", resp.scode);
        ua.dialog.update_from_response(&resp);
        if tx.state() == ClientState::Uack {
            if let Err(e) = tx.send_ack(None) {
                warn!(call_id = %ua.dialog.call_id, "cannot ACK: {}", e);
            }
        }
        ua.send_bye(Some(Reason::sip(487, "Request Terminated")), Vec::new());
        Some(Transition::to(Disconnected))
    }

    fn on_timer(&mut self, _ua: &mut UaCore, timer: UaTimer) -> Option<Transition> {
        (timer == UaTimer::CancelWait).then(|| Transition::to(Dead))
    }
}

/// Re-INVITE sent while connected
pub(crate) struct UacUpdating;

impl UaState for UacUpdating {
    fn kind(&self) -> UaStateKind {
        UaStateKind::UacUpdating
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn recv_response(
        &mut self,
        ua: &mut UaCore,
        resp: Response,
        tx: &Arc<ClientTransaction>,
    ) -> Option<Transition> {
        if !is_current_invite(ua, tx) {
            return Connected.recv_response(ua, resp, tx);
        }
        if resp.is_provisional() {
            return None;
        }
        ua.invite_ctx = None;
        if resp.is_success() {
            ua.dialog.update_from_response(&resp);
            if tx.state() == ClientState::Uack {
                ua.pending_ack = Some(tx.clone());
            }
            if let Some(body) = resp.body() {
                ua.remote_sdp = Some(body.clone());
            }
            let event = ua.event(
                CCEventKind::Connect {
                    scode: resp.scode,
                    reason: resp.reason.clone(),
                    body: resp.body().cloned(),
                },
                resp.rtime,
            );
            ua.emit_remote(event);
            return Some(Transition::to(Connected));
        }
        if matches!(resp.scode, 408 | 481) {
            info!(call_id = %ua.dialog.call_id, "re-INVITE got {}, call is gone", resp.scode);
            let reason = Reason::sip(resp.scode, &resp.reason);
            if resp.scode == 408 {
                ua.send_bye(Some(reason.clone()), Vec::new());
            }
            let event = ua
                .event(CCEventKind::Disconnect { redirect_to: None }, resp.rtime)
                .with_reason(reason);
            ua.emit(event);
            return Some(disconnected(ua.origin));
        }
        let event = ua.event(
            CCEventKind::Fail {
                scode: resp.scode,
                reason: resp.reason.clone(),
                challenges: Vec::new(),
            },
            resp.rtime,
        );
        ua.emit(event);
        Some(Transition::to(Connected))
    }

    fn recv_request(
        &mut self,
        ua: &mut UaCore,
        req: Request,
        tx: &Arc<ServerTransaction>,
    ) -> Option<Transition> {
        match req.method {
            Method::Bye => Some(remote_bye(ua, &req, tx)),
            Method::Invite => {
                // Glare (RFC 3261 §14.2)
                ua.respond(tx, &req, 491, "Request Pending");
                None
            }
            _ => Connected.recv_request(ua, req, tx),
        }
    }

    fn recv_event(&mut self, ua: &mut UaCore, event: CCEvent) -> Option<Transition> {
        match event.kind {
            CCEventKind::Disconnect { .. } | CCEventKind::Fail { .. } | CCEventKind::Redirect { .. } => {
                if let Some(tx) = ua.invite_ctx.take() {
                    tx.cancel(Vec::new());
                }
                ua.send_bye(event.reason, event.extra_headers);
                Some(disconnected(&event.origin))
            }
            _ => {
                debug!(call_id = %ua.dialog.call_id, "{} ignored during re-INVITE", event);
                None
            }
        }
    }

    fn on_timer(&mut self, ua: &mut UaCore, timer: UaTimer) -> Option<Transition> {
        Connected.on_timer(ua, timer)
    }
}
