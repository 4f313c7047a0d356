//! Media relay sessions
//!
//! A [`RelaySession`] anchors the media of one B2BUA call on an RTP relay
//! speaking the rtpproxy command protocol. Each call leg is a [`RelaySide`];
//! every SDP body a leg sends is registered with the relay (`U` for an offer,
//! `L` for the answer to the other side's offer) and rewritten to point at the
//! relay before it is forwarded to the other leg.
//!
//! The relay session is released with `D`, either explicitly through
//! [`RelaySession::delete`] or, failing that, when the session is dropped.

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use b2bua_sip_core::MsgBody;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::errors::{DialogError, DialogResult};
use crate::media::hook::SdpChangeHook;
use crate::media::side::{OriginTracker, SdpSide};

/// Control channel to a media relay
#[async_trait]
pub trait RtpRelayClient: Send + Sync {
    /// Send one command and wait for its reply line
    async fn send_command(&self, command: &str) -> DialogResult<String>;

    /// Whether the relay answered its last heartbeat
    fn is_online(&self) -> bool;

    /// Address to advertise when a reply carries only a port
    fn advertised_address(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelaySide {
    Caller,
    Callee,
}

impl RelaySide {
    pub fn other(self) -> RelaySide {
        match self {
            RelaySide::Caller => RelaySide::Callee,
            RelaySide::Callee => RelaySide::Caller,
        }
    }
}

impl fmt::Display for RelaySide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelaySide::Caller => write!(f, "caller"),
            RelaySide::Callee => write!(f, "callee"),
        }
    }
}

#[derive(Default)]
struct RelayState {
    caller: SdpSide,
    callee: SdpSide,
    /// Origin of bodies forwarded to the caller and to the callee
    to_caller: OriginTracker,
    to_callee: OriginTracker,
    to_tag: Option<String>,
    /// Side whose offer still waits for an answer
    pending_offer: Option<RelaySide>,
    deleted: bool,
}

impl RelayState {
    fn side_mut(&mut self, side: RelaySide) -> &mut SdpSide {
        match side {
            RelaySide::Caller => &mut self.caller,
            RelaySide::Callee => &mut self.callee,
        }
    }

    /// Tracker for bodies travelling away from `side`
    fn tracker_from(&mut self, side: RelaySide) -> &mut OriginTracker {
        match side {
            RelaySide::Caller => &mut self.to_callee,
            RelaySide::Callee => &mut self.to_caller,
        }
    }
}

/// One call's media anchored on a relay
pub struct RelaySession {
    me: Weak<RelaySession>,
    client: Arc<dyn RtpRelayClient>,
    call_id: String,
    from_tag: String,
    state: Mutex<RelayState>,
}

impl RelaySession {
    pub fn new(client: Arc<dyn RtpRelayClient>, call_id: &str, from_tag: &str) -> Arc<Self> {
        Arc::new_cyclic(|me| RelaySession {
            me: me.clone(),
            client,
            call_id: call_id.to_string(),
            from_tag: from_tag.to_string(),
            state: Mutex::new(RelayState::default()),
        })
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// To tag of the callee leg, needed before the callee side can be updated
    pub fn set_to_tag(&self, to_tag: &str) {
        self.state.lock().to_tag = Some(to_tag.to_string());
    }

    pub fn side(&self, side: RelaySide) -> SdpSide {
        self.state.lock().side_mut(side).clone()
    }

    pub fn is_deleted(&self) -> bool {
        self.state.lock().deleted
    }

    /// SDP hook feeding bodies received on the `side` leg through the relay
    pub fn hook(&self, side: RelaySide) -> Option<Arc<dyn SdpChangeHook>> {
        let session = self.me.upgrade()?;
        Some(Arc::new(RelayHook { session, side }))
    }

    fn tags(&self, side: RelaySide, to_tag: Option<&str>) -> DialogResult<String> {
        match (side, to_tag) {
            (RelaySide::Caller, None) => Ok(self.from_tag.clone()),
            (RelaySide::Caller, Some(to_tag)) => Ok(format!("{} {}", self.from_tag, to_tag)),
            (RelaySide::Callee, Some(to_tag)) => Ok(format!("{} {}", to_tag, self.from_tag)),
            (RelaySide::Callee, None) => Err(DialogError::relay(format!(
                "callee side of {} updated before its To tag is known",
                self.call_id
            ))),
        }
    }

    /// Register the body `side` sent with the relay and return it rewritten
    /// for the other leg
    pub async fn update(&self, side: RelaySide, mut body: MsgBody) -> DialogResult<MsgBody> {
        if !self.client.is_online() {
            return Err(DialogError::relay("media relay is offline"));
        }
        let command = {
            let sdp = body
                .sdp()
                .ok_or_else(|| DialogError::relay("body is not SDP"))?;
            let mut state = self.state.lock();
            if state.deleted {
                return Err(DialogError::relay("relay session already deleted"));
            }
            let tags = self.tags(side, state.to_tag.as_deref())?;
            let learned = state.side_mut(side).update_from(sdp);
            let remote = state.side_mut(side).clone();
            let (Some(address), true) = (remote.address.clone(), learned) else {
                return Err(DialogError::relay("SDP without media address"));
            };
            let verb = match state.pending_offer {
                Some(offerer) if offerer != side => {
                    state.pending_offer = None;
                    'L'
                }
                _ => {
                    state.pending_offer = Some(side);
                    'U'
                }
            };
            let modifiers = if remote.codecs.is_empty() {
                String::new()
            } else {
                format!("c{}", remote.codec_list())
            };
            format!("{}{} {} {} {} {}", verb, modifiers, self.call_id, address, remote.port, tags)
        };
        debug!(call_id = %self.call_id, %side, "relay command: {}", command);
        let reply = self.client.send_command(&command).await?;
        let (port, address) = parse_reply(&reply, || self.client.advertised_address())?;

        let mut state = self.state.lock();
        if let Some(sdp) = body.sdp_mut() {
            SdpSide::rewrite(sdp, &address, port);
            state.tracker_from(side).fix_origin(sdp);
        }
        Ok(body)
    }

    fn delete_command(&self) -> Option<String> {
        let mut state = self.state.lock();
        if state.deleted {
            return None;
        }
        state.deleted = true;
        let mut command = format!("D {} {}", self.call_id, self.from_tag);
        if let Some(to_tag) = &state.to_tag {
            command.push(' ');
            command.push_str(to_tag);
        }
        Some(command)
    }

    /// Release the relay session
    pub async fn delete(&self) -> DialogResult<()> {
        let Some(command) = self.delete_command() else {
            return Ok(());
        };
        let reply = self.client.send_command(&command).await?;
        if reply.starts_with('E') {
            return Err(DialogError::relay(format!("delete refused: {}", reply.trim())));
        }
        Ok(())
    }
}

impl Drop for RelaySession {
    fn drop(&mut self) {
        let Some(command) = self.delete_command() else {
            return;
        };
        let Ok(handle) = Handle::try_current() else {
            warn!(call_id = %self.call_id, "relay session dropped outside a runtime, not deleted");
            return;
        };
        let client = self.client.clone();
        let call_id = self.call_id.clone();
        handle.spawn(async move {
            if let Err(e) = client.send_command(&command).await {
                warn!(call_id = %call_id, "cannot delete relay session: {}", e);
            }
        });
    }
}

impl fmt::Debug for RelaySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySession")
            .field("call_id", &self.call_id)
            .field("from_tag", &self.from_tag)
            .finish()
    }
}

/// `<port> [<address>]`, or `E<code>` on error
fn parse_reply(reply: &str, default_address: impl FnOnce() -> String) -> DialogResult<(u16, String)> {
    let reply = reply.trim();
    if reply.starts_with('E') {
        return Err(DialogError::relay(format!("relay error {}", reply)));
    }
    let mut fields = reply.split_whitespace();
    let port = fields
        .next()
        .and_then(|p| p.parse::<u16>().ok())
        .filter(|p| *p != 0)
        .ok_or_else(|| DialogError::relay(format!("bad relay reply '{}'", reply)))?;
    let address = fields.next().map(str::to_string).unwrap_or_else(default_address);
    Ok((port, address))
}

struct RelayHook {
    session: Arc<RelaySession>,
    side: RelaySide,
}

#[async_trait]
impl SdpChangeHook for RelayHook {
    async fn on_remote_sdp_change(&self, body: MsgBody) -> DialogResult<MsgBody> {
        self.session.update(self.side, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use b2bua_sip_core::SDP_CONTENT_TYPE;

    #[derive(Default)]
    struct ScriptedRelay {
        commands: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RtpRelayClient for ScriptedRelay {
        async fn send_command(&self, command: &str) -> DialogResult<String> {
            self.commands.lock().push(command.to_string());
            Ok(if command.starts_with('D') {
                "0".to_string()
            } else {
                "35000 203.0.113.5".to_string()
            })
        }

        fn is_online(&self) -> bool {
            true
        }

        fn advertised_address(&self) -> String {
            "203.0.113.1".to_string()
        }
    }

    fn sdp(address: &str, port: u16) -> MsgBody {
        MsgBody::new(
            SDP_CONTENT_TYPE,
            format!(
                "v=0\r\no=- 1 1 IN IP4 {a}\r\ns=-\r\nc=IN IP4 {a}\r\nt=0 0\r\nm=audio {p} RTP/AVP 0 8\r\n",
                a = address,
                p = port
            ),
        )
    }

    #[test]
    fn test_parse_reply() {
        assert_eq!(parse_reply("35000 10.0.0.1\n", || "x".into()).unwrap(), (35000, "10.0.0.1".into()));
        assert_eq!(parse_reply("35000", || "10.9.9.9".into()).unwrap(), (35000, "10.9.9.9".into()));
        assert!(parse_reply("E8", || "x".into()).is_err());
        assert!(parse_reply("0", || "x".into()).is_err());
    }

    #[tokio::test]
    async fn test_offer_answer_and_delete() {
        let relay = Arc::new(ScriptedRelay::default());
        let session = RelaySession::new(relay.clone(), "call-1", "ftag");

        let offer = session.update(RelaySide::Caller, sdp("192.0.2.1", 4000)).await.unwrap();
        let rewritten = offer.sdp().unwrap();
        let audio = rewritten.first_section("audio").unwrap();
        assert_eq!(audio.port(), 35000);
        assert_eq!(rewritten.effective_connection(audio).unwrap().address, "203.0.113.5");

        // Answer before the To tag is known is refused
        assert!(session.update(RelaySide::Callee, sdp("192.0.2.2", 5000)).await.is_err());
        session.set_to_tag("ttag");
        session.update(RelaySide::Callee, sdp("192.0.2.2", 5000)).await.unwrap();
        assert_eq!(session.side(RelaySide::Callee).port, 5000);

        session.delete().await.unwrap();
        assert!(session.is_deleted());
        let commands = relay.commands.lock().clone();
        assert_eq!(commands[0], "Uc0,8 call-1 192.0.2.1 4000 ftag");
        assert_eq!(commands[1], "Lc0,8 call-1 192.0.2.2 5000 ttag ftag");
        assert_eq!(commands[2], "D call-1 ftag ttag");
    }

    #[tokio::test]
    async fn test_drop_deletes_session() {
        let relay = Arc::new(ScriptedRelay::default());
        {
            let session = RelaySession::new(relay.clone(), "call-2", "ftag");
            let _hook = session.hook(RelaySide::Caller).unwrap();
        }
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(relay.commands.lock().clone(), vec!["D call-2 ftag".to_string()]);
    }
}
