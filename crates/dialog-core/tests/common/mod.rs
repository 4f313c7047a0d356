//! Shared fixtures: a transport that records instead of sending, a call map
//! building UAS legs, and recording controllers and listeners

#![allow(dead_code)]

use std::sync::Arc;

use b2bua_dialog_core::config::{TransactionConfig, UaConfig};
use b2bua_dialog_core::{
    CCEvent, CallController, CallMap, NewDialog, RequestReceiver, ServerTransaction,
    TransactionManager, Ua, UaListener,
};
use b2bua_infra_common::logging::{setup_logging, LoggingConfig};
use b2bua_infra_common::{new_session_lock, MonoTime};
use b2bua_sip_core::{
    Address, HeaderAccess, HostPort, Message, Method, MsgBody, Request, Response, SipHeader,
    SipUri,
};
use b2bua_sip_transport::{Datagram, LocalForRemote, Transport};
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::Level;

pub const SDP_OFFER: &str = "v=0\r\n\
o=alice 2890844526 2890844526 IN IP4 192.0.2.20\r\n\
s=-\r\n\
c=IN IP4 192.0.2.20\r\n\
t=0 0\r\n\
m=audio 49170 RTP/AVP 0\r\n\
a=rtpmap:0 PCMU/8000\r\n";

pub const SDP_ANSWER: &str = "v=0\r\n\
o=bob 2808844564 2808844564 IN IP4 192.0.2.30\r\n\
s=-\r\n\
c=IN IP4 192.0.2.30\r\n\
t=0 0\r\n\
m=audio 3456 RTP/AVP 0\r\n\
a=rtpmap:0 PCMU/8000\r\n";

pub fn local_addr() -> HostPort {
    HostPort::new("192.0.2.1", 5060)
}

/// The remote SIP endpoint the tests play
pub fn peer() -> HostPort {
    HostPort::new("192.0.2.20", 5060)
}

pub fn sdp(raw: &str) -> MsgBody {
    MsgBody::new("application/sdp", raw)
}

#[derive(Debug, Clone)]
pub struct Sent {
    pub data: Bytes,
    pub destination: HostPort,
    pub at: tokio::time::Instant,
}

impl Sent {
    pub fn message(&self) -> Message {
        Message::parse(&self.data).expect("sent data parses")
    }
}

/// Transport keeping everything it is asked to send
#[derive(Debug)]
pub struct RecordingTransport {
    laddr: HostPort,
    sent: Mutex<Vec<Sent>>,
}

impl RecordingTransport {
    pub fn new(laddr: HostPort) -> Arc<Self> {
        Arc::new(RecordingTransport {
            laddr,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    pub fn requests(&self) -> Vec<Request> {
        self.sent()
            .iter()
            .filter_map(|s| match s.message() {
                Message::Request(req) => Some(req),
                Message::Response(_) => None,
            })
            .collect()
    }

    pub fn requests_of(&self, method: Method) -> Vec<Request> {
        self.requests().into_iter().filter(|r| r.method == method).collect()
    }

    pub fn responses(&self) -> Vec<Response> {
        self.sent()
            .iter()
            .filter_map(|s| match s.message() {
                Message::Response(resp) => Some(resp),
                Message::Request(_) => None,
            })
            .collect()
    }

    pub fn response_codes(&self) -> Vec<u16> {
        self.responses().iter().map(|r| r.scode).collect()
    }

    /// Methods of the requests sent, in order
    pub fn methods(&self) -> Vec<Method> {
        self.requests().into_iter().map(|r| r.method).collect()
    }
}

impl Transport for RecordingTransport {
    fn send_to(&self, data: Bytes, destination: &HostPort) -> b2bua_sip_transport::Result<()> {
        self.sent.lock().push(Sent {
            data,
            destination: destination.clone(),
            at: tokio::time::Instant::now(),
        });
        Ok(())
    }

    fn local_addr(&self) -> HostPort {
        self.laddr.clone()
    }

    fn shutdown(&self) {}

    fn is_closed(&self) -> bool {
        false
    }
}

/// Controller keeping the events it is given
#[derive(Default)]
pub struct RecordingController {
    events: Mutex<Vec<CCEvent>>,
}

impl RecordingController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<CCEvent> {
        self.events.lock().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.name()).collect()
    }

    pub fn last(&self) -> Option<CCEvent> {
        self.events.lock().last().cloned()
    }
}

impl CallController for RecordingController {
    fn recv_event(&self, event: CCEvent, _ua: &Arc<Ua>) {
        self.events.lock().push(event);
    }
}

/// Listener turning every callback into a short string
#[derive(Default)]
pub struct RecordingListener {
    calls: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl UaListener for RecordingListener {
    fn on_ring(&self, _ua: &Arc<Ua>, scode: u16) {
        self.calls.lock().push(format!("ring:{}", scode));
    }

    fn on_connect(&self, _ua: &Arc<Ua>) {
        self.calls.lock().push("connect".to_string());
    }

    fn on_disconnect(&self, _ua: &Arc<Ua>, origin: &str) {
        self.calls.lock().push(format!("disconnect:{}", origin));
    }

    fn on_fail(&self, _ua: &Arc<Ua>, scode: u16) {
        self.calls.lock().push(format!("fail:{}", scode));
    }

    fn on_dead(&self, _ua: &Arc<Ua>) {
        self.calls.lock().push("dead".to_string());
    }
}

/// Call map answering every new INVITE with a UAS leg
pub struct TestCallMap {
    pub config: UaConfig,
    pub controller: Arc<RecordingController>,
    pub listener: Arc<RecordingListener>,
    legs: Mutex<Vec<Arc<Ua>>>,
}

impl TestCallMap {
    pub fn new(config: UaConfig) -> Arc<Self> {
        Arc::new(TestCallMap {
            config,
            controller: RecordingController::new(),
            listener: RecordingListener::new(),
            legs: Mutex::new(Vec::new()),
        })
    }

    pub fn legs(&self) -> Vec<Arc<Ua>> {
        self.legs.lock().clone()
    }

    pub fn leg(&self) -> Arc<Ua> {
        self.legs.lock().first().cloned().expect("a UAS leg was created")
    }
}

impl CallMap for TestCallMap {
    fn on_new_dialog(
        &self,
        tm: &Arc<TransactionManager>,
        req: &Request,
        _tx: &Arc<ServerTransaction>,
    ) -> NewDialog {
        if req.method != Method::Invite {
            return NewDialog::Reject(req.gen_response(481, "Call Leg/Transaction Does Not Exist"));
        }
        let controller: Arc<dyn CallController> = self.controller.clone();
        match Ua::new_uas(tm, self.config.clone(), Some(controller), req, new_session_lock()) {
            Ok(ua) => {
                ua.add_listener(self.listener.clone());
                self.legs.lock().push(ua.clone());
                let receiver: Arc<dyn RequestReceiver> = ua;
                NewDialog::Accept(receiver)
            }
            Err(_) => NewDialog::Reject(req.gen_response(400, "Bad Request")),
        }
    }
}

/// Route tracing output to the test harness, `RUST_LOG` overriding the
/// default of warnings only
pub fn init_logging() {
    // Already installed by an earlier test of this binary
    let _ = setup_logging(LoggingConfig::new(Level::WARN).for_tests());
}

/// Transaction manager wired to a recording transport
pub struct Harness {
    pub tm: Arc<TransactionManager>,
    pub transport: Arc<RecordingTransport>,
    pub call_map: Arc<TestCallMap>,
}

impl Harness {
    pub fn new(ua_config: UaConfig) -> Self {
        Self::with_config(TransactionConfig::default(), ua_config)
    }

    pub fn with_config(config: TransactionConfig, ua_config: UaConfig) -> Self {
        init_logging();
        let call_map = TestCallMap::new(ua_config);
        let tm = TransactionManager::new(config, call_map.clone());
        let transport = RecordingTransport::new(local_addr());
        let fixed: Arc<dyn Transport> = transport.clone();
        tm.attach(LocalForRemote::fixed(fixed)).expect("fresh manager");
        Harness {
            tm,
            transport,
            call_map,
        }
    }

    pub fn deliver(&self, data: impl Into<Bytes>, source: &HostPort) {
        let transport: Arc<dyn Transport> = self.transport.clone();
        self.tm.handle_incoming(Datagram {
            data: data.into(),
            source: source.clone(),
            transport,
            rtime: MonoTime::now().expect("clock"),
        });
    }

    pub fn deliver_request(&self, req: &Request) {
        self.deliver(req.to_bytes(), &peer());
    }

    pub fn deliver_response(&self, resp: &Response) {
        self.deliver(resp.to_bytes(), &peer());
    }
}

/// Text of a dialog-creating INVITE from alice at the peer to bob
pub fn invite_text(call_id: &str, branch: &str, body: Option<&str>) -> String {
    invite_text_with(call_id, branch, body, "")
}

/// [`invite_text`] with extra header lines (each ending in CRLF)
pub fn invite_text_with(call_id: &str, branch: &str, body: Option<&str>, extra: &str) -> String {
    let body = body.unwrap_or("");
    let content_type = if body.is_empty() {
        String::new()
    } else {
        "Content-Type: application/sdp\r\n".to_string()
    };
    format!(
        "INVITE sip:bob@192.0.2.1:5060 SIP/2.0\r\n\
Via: SIP/2.0/UDP 192.0.2.20:5060;branch={branch}\r\n\
Max-Forwards: 70\r\n\
From: \"Alice\" <sip:alice@192.0.2.20>;tag=alice-tag\r\n\
To: <sip:bob@192.0.2.1>\r\n\
Call-ID: {call_id}\r\n\
CSeq: 1 INVITE\r\n\
Contact: <sip:alice@192.0.2.20:5060>\r\n\
{extra}{content_type}Content-Length: {len}\r\n\r\n{body}",
        len = body.len(),
    )
}

pub fn invite(call_id: &str, branch: &str, body: Option<&str>) -> Request {
    Request::parse(invite_text(call_id, branch, body).as_bytes()).expect("valid INVITE")
}

/// Request sent by the peer inside the dialog it has with `ua`
pub fn in_dialog(ua: &Ua, method: Method, cseq: u32, branch: &str) -> Request {
    let dialog = ua.dialog();
    let remote_tag = dialog.remote_tag.clone().unwrap_or_default();
    let (from_user, to_user) = if dialog.is_initiator {
        ("bob", "alice")
    } else {
        ("alice", "bob")
    };
    let text = format!(
        "{method} sip:{to_user}@192.0.2.1:5060 SIP/2.0\r\n\
Via: SIP/2.0/UDP 192.0.2.20:5060;branch={branch}\r\n\
Max-Forwards: 70\r\n\
From: <sip:{from_user}@192.0.2.20>;tag={remote_tag}\r\n\
To: <sip:{to_user}@192.0.2.1>;tag={local_tag}\r\n\
Call-ID: {call_id}\r\n\
CSeq: {cseq} {method}\r\n\
Content-Length: 0\r\n\r\n",
        method = method.as_str(),
        local_tag = dialog.local_tag,
        call_id = dialog.call_id,
    );
    Request::parse(text.as_bytes()).expect("valid in-dialog request")
}

/// ACK for the 2xx `ua` sent to an INVITE from the peer
pub fn ack_for(ua: &Ua, cseq: u32, body: Option<&str>) -> Request {
    let mut ack = in_dialog(ua, Method::Ack, cseq, "z9hG4bK-ack");
    if let Some(body) = body {
        ack.set_body(Some(sdp(body)));
    }
    ack
}

/// Response of the peer to a request it received, with its To tag
pub fn reply(req: &Request, scode: u16, reason: &str, to_tag: Option<&str>) -> Response {
    let mut resp = req.gen_response(scode, reason);
    if let Some(tag) = to_tag {
        if let Ok(to) = resp.to_addr_mut() {
            to.set_tag(tag);
        }
    }
    if (101..300).contains(&scode) && req.method == Method::Invite {
        resp.append_header(SipHeader::Contact(Address::new(SipUri::new(
            Some("bob"),
            "192.0.2.20",
            Some(5060),
        ))));
    }
    resp
}

/// Let spawned tasks and due timers run
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
