//! Transaction layer tests: retransmission timing, ACK routing, CANCEL and
//! duplicate handling, all against a recording transport

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use b2bua_dialog_core::config::{TimerSettings, TransactionConfig, UaConfig};
use b2bua_dialog_core::{
    CallMap, ClientTransaction, ClientTransactionOptions, NewDialog, RequestReceiver,
    ResponseReceiver, ServerTransaction, TransactionManager,
};
use b2bua_infra_common::{new_session_lock, SessionLock};
use b2bua_sip_core::{
    Address, HeaderAccess, HostPort, Method, Request, Response, SipHeader, SipUri, Via,
};
use b2bua_sip_transport::{LocalForRemote, Transport};
use parking_lot::Mutex;

use common::{invite_text, peer, reply, Harness};

/// Response receiver remembering status codes
#[derive(Default)]
struct ResponseLog {
    codes: Mutex<Vec<u16>>,
}

impl ResponseLog {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn codes(&self) -> Vec<u16> {
        self.codes.lock().clone()
    }
}

impl ResponseReceiver for ResponseLog {
    fn recv_response(&self, resp: Response, _tx: &Arc<ClientTransaction>) {
        self.codes.lock().push(resp.scode);
    }
}

fn outgoing(method: Method, branch: &str) -> Request {
    let text = format!(
        "{method} sip:bob@192.0.2.20:5060 SIP/2.0\r\n\
Via: SIP/2.0/UDP 192.0.2.1:5060;branch={branch}\r\n\
Max-Forwards: 70\r\n\
From: <sip:alice@192.0.2.1>;tag=alice-1\r\n\
To: <sip:bob@192.0.2.20>\r\n\
Call-ID: tx-{branch}\r\n\
CSeq: 1 {method}\r\n\
Contact: <sip:alice@192.0.2.1:5060>\r\n\
Content-Length: 0\r\n\r\n",
        method = method.as_str(),
    );
    Request::parse(text.as_bytes()).unwrap()
}

fn start(h: &Harness, req: Request, log: &Arc<ResponseLog>) -> Arc<ClientTransaction> {
    let receiver: Arc<dyn ResponseReceiver> = log.clone();
    let weak: Weak<dyn ResponseReceiver> = Arc::downgrade(&receiver);
    let options = ClientTransactionOptions::new(new_session_lock()).with_receiver(weak);
    h.tm.new_client_transaction(req, options).unwrap()
}

fn offsets_ms(h: &Harness, since: tokio::time::Instant) -> Vec<u128> {
    h.transport
        .sent()
        .iter()
        .map(|s| s.at.duration_since(since).as_millis())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_invite_retransmits_with_doubling_interval_until_timer_b() {
    let h = Harness::new(UaConfig::default());
    let log = ResponseLog::new();
    let started = tokio::time::Instant::now();
    let _tx = start(&h, outgoing(Method::Invite, "z9hG4bK-inv1"), &log);

    tokio::time::sleep(Duration::from_secs(40)).await;

    assert_eq!(offsets_ms(&h, started), [0, 500, 1500, 3500, 7500, 15500, 31500]);
    assert!(h.transport.sent().iter().all(|s| s.destination == peer()));
    // Exactly one synthetic timeout
    assert_eq!(log.codes(), [408]);
}

#[tokio::test(start_paused = true)]
async fn test_non_invite_retransmit_interval_is_capped_at_t2() {
    let h = Harness::new(UaConfig::default());
    let log = ResponseLog::new();
    let started = tokio::time::Instant::now();
    let _tx = start(&h, outgoing(Method::Options, "z9hG4bK-opt1"), &log);

    tokio::time::sleep(Duration::from_secs(40)).await;

    assert_eq!(
        offsets_ms(&h, started),
        [0, 500, 1500, 3500, 7500, 11500, 15500, 19500, 23500, 27500, 31500]
    );
    assert_eq!(log.codes(), [408]);
}

#[tokio::test(start_paused = true)]
async fn test_provisional_response_stops_invite_retransmissions() {
    let h = Harness::new(UaConfig::default());
    let log = ResponseLog::new();
    let tx = start(&h, outgoing(Method::Invite, "z9hG4bK-inv2"), &log);

    h.deliver_response(&reply(tx.request(), 100, "Trying", None));
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(h.transport.requests_of(Method::Invite).len(), 1);
    assert_eq!(log.codes(), [100]);
}

#[tokio::test]
async fn test_2xx_ack_follows_record_route_and_contact() {
    let h = Harness::new(UaConfig::default());
    let log = ResponseLog::new();
    let tx = start(&h, outgoing(Method::Invite, "z9hG4bK-inv3"), &log);

    let mut ok = tx.request().gen_response(200, "OK");
    ok.to_addr_mut().unwrap().set_tag("bob-1");
    for proxy in ["192.0.2.31", "192.0.2.32"] {
        let uri = SipUri::new(None, proxy, None).with_param("lr", None);
        ok.append_header(SipHeader::RecordRoute(Address::new(uri)));
    }
    ok.append_header(SipHeader::Contact(Address::new(SipUri::new(
        Some("bob"),
        "192.0.2.40",
        Some(5070),
    ))));
    h.deliver_response(&ok);

    let acks = h.transport.requests_of(Method::Ack);
    assert_eq!(acks.len(), 1);
    let ack = &acks[0];
    assert_eq!(ack.uri.host, "192.0.2.40");
    assert_eq!(ack.uri.port, Some(5070));
    let routes: Vec<&str> = ack.routes().iter().map(|r| r.uri.host.as_str()).collect();
    assert_eq!(routes, ["192.0.2.32", "192.0.2.31"]);
    assert_eq!(ack.cseq().unwrap().seq, 1);
    assert_eq!(ack.to_addr().unwrap().tag(), Some("bob-1"));
    // New branch: the 2xx ACK is a transaction of its own
    assert_ne!(
        ack.top_via().unwrap().branch(),
        tx.request().top_via().unwrap().branch()
    );
    let sent = h.transport.sent();
    assert_eq!(sent.last().unwrap().destination, HostPort::new("192.0.2.32", 5060));

    // A retransmitted 2xx is ACKed again but not passed up
    h.deliver_response(&ok);
    assert_eq!(h.transport.requests_of(Method::Ack).len(), 2);
    assert_eq!(log.codes(), [200]);
}

#[tokio::test]
async fn test_uack_holds_2xx_ack_until_released() {
    let h = Harness::new(UaConfig::default());
    let log = ResponseLog::new();
    let receiver: Arc<dyn ResponseReceiver> = log.clone();
    let options = ClientTransactionOptions::new(new_session_lock())
        .with_receiver(Arc::downgrade(&receiver))
        .with_uack(true);
    let tx = h
        .tm
        .new_client_transaction(outgoing(Method::Invite, "z9hG4bK-inv4"), options)
        .unwrap();

    h.deliver_response(&reply(tx.request(), 200, "OK", Some("bob-2")));
    assert!(h.transport.requests_of(Method::Ack).is_empty());

    tx.send_ack(Some(common::sdp(common::SDP_ANSWER))).unwrap();
    let acks = h.transport.requests_of(Method::Ack);
    assert_eq!(acks.len(), 1);
    assert!(acks[0].body().unwrap().is_sdp());
    // Only once
    assert!(tx.send_ack(None).is_err());
}

#[tokio::test]
async fn test_non_2xx_final_is_acked_by_the_transaction() {
    let h = Harness::new(UaConfig::default());
    let log = ResponseLog::new();
    let tx = start(&h, outgoing(Method::Invite, "z9hG4bK-inv5"), &log);

    h.deliver_response(&reply(tx.request(), 486, "Busy Here", Some("bob-3")));

    let acks = h.transport.requests_of(Method::Ack);
    assert_eq!(acks.len(), 1);
    assert_eq!(
        acks[0].top_via().unwrap().branch(),
        tx.request().top_via().unwrap().branch()
    );
    assert_eq!(acks[0].uri, tx.request().uri);
    assert_eq!(log.codes(), [486]);
}

#[tokio::test]
async fn test_cancel_waits_for_provisional_response() {
    let h = Harness::new(UaConfig::default());
    let log = ResponseLog::new();
    let tx = start(&h, outgoing(Method::Invite, "z9hG4bK-inv6"), &log);

    tx.cancel(Vec::new());
    assert!(h.transport.requests_of(Method::Cancel).is_empty());

    h.deliver_response(&reply(tx.request(), 180, "Ringing", Some("bob-4")));
    let cancels = h.transport.requests_of(Method::Cancel);
    assert_eq!(cancels.len(), 1);
    assert_eq!(
        cancels[0].top_via().unwrap().branch(),
        tx.request().top_via().unwrap().branch()
    );
    assert_eq!(cancels[0].cseq().unwrap().seq, 1);
    assert_eq!(cancels[0].cseq().unwrap().method, Method::Cancel);

    h.deliver_response(&reply(tx.request(), 487, "Request Terminated", Some("bob-4")));
    assert_eq!(log.codes(), [180, 487]);
    assert_eq!(h.transport.requests_of(Method::Ack).len(), 1);
}

#[tokio::test]
async fn test_cancel_dropped_when_final_comes_first() {
    let h = Harness::new(UaConfig::default());
    let log = ResponseLog::new();
    let tx = start(&h, outgoing(Method::Invite, "z9hG4bK-inv7"), &log);

    tx.cancel(Vec::new());
    h.deliver_response(&reply(tx.request(), 603, "Decline", Some("bob-5")));

    assert!(h.transport.requests_of(Method::Cancel).is_empty());
    assert_eq!(log.codes(), [603]);
}

/// Call map answering everything with 200 and counting how often it is asked
#[derive(Default)]
struct CountingMap {
    asked: AtomicUsize,
}

impl CallMap for CountingMap {
    fn on_new_dialog(
        &self,
        _tm: &Arc<TransactionManager>,
        req: &Request,
        _tx: &Arc<ServerTransaction>,
    ) -> NewDialog {
        self.asked.fetch_add(1, Ordering::SeqCst);
        NewDialog::Reject(req.gen_response(200, "OK"))
    }
}

/// Harness whose manager offers new dialogs to `map`
fn harness_with_map(config: TransactionConfig, map: Arc<dyn CallMap>) -> Harness {
    let h = Harness::with_config(config.clone(), UaConfig::default());
    let tm = TransactionManager::new(config, map);
    let transport: Arc<dyn Transport> = h.transport.clone();
    tm.attach(LocalForRemote::fixed(transport)).unwrap();
    Harness { tm, ..h }
}

fn counting_harness(config: TransactionConfig) -> (Harness, Arc<CountingMap>) {
    let map = Arc::new(CountingMap::default());
    (harness_with_map(config, map.clone()), map)
}

fn bye_text(branch: &str) -> String {
    format!(
        "BYE sip:bob@192.0.2.1:5060 SIP/2.0\r\n\
Via: SIP/2.0/UDP 192.0.2.20:5060;branch={branch}\r\n\
Max-Forwards: 70\r\n\
From: <sip:alice@192.0.2.20>;tag=alice-9\r\n\
To: <sip:bob@192.0.2.1>;tag=bob-9\r\n\
Call-ID: dup-{branch}\r\n\
CSeq: 2 BYE\r\n\
Content-Length: 0\r\n\r\n"
    )
}

#[tokio::test]
async fn test_duplicate_request_answered_from_cache() {
    let (h, map) = counting_harness(TransactionConfig::default());
    let bye = bye_text("z9hG4bK-bye1");

    h.deliver(bye.clone().into_bytes(), &peer());
    h.deliver(bye.into_bytes(), &peer());

    assert_eq!(map.asked.load(Ordering::SeqCst), 1);
    assert_eq!(h.transport.response_codes(), [200, 200]);
}

#[tokio::test]
async fn test_loss_emulation_drops_first_transmission() {
    let (h, map) = counting_harness(TransactionConfig::default().with_loss_emulation(1));
    let bye = bye_text("z9hG4bK-bye2");

    h.deliver(bye.clone().into_bytes(), &peer());
    assert!(h.transport.response_codes().is_empty());
    h.deliver(bye.into_bytes(), &peer());

    assert_eq!(map.asked.load(Ordering::SeqCst), 1);
    assert_eq!(h.transport.response_codes(), [200]);
}

#[tokio::test]
async fn test_stray_cancel_gets_481() {
    let (h, _map) = counting_harness(TransactionConfig::default());
    let cancel = bye_text("z9hG4bK-can1")
        .replace("BYE sip", "CANCEL sip")
        .replace("2 BYE", "1 CANCEL");

    h.deliver(cancel.into_bytes(), &peer());

    assert_eq!(h.transport.response_codes(), [481]);
}

#[tokio::test]
async fn test_own_request_looped_back_gets_482() {
    let h = Harness::new(UaConfig::default());
    let log = ResponseLog::new();
    let _tx = start(&h, outgoing(Method::Invite, "z9hG4bK-loop"), &log);
    let sent = h.transport.sent()[0].data.clone();

    h.deliver(sent, &peer());

    assert_eq!(h.transport.response_codes(), [482]);
}

#[tokio::test]
async fn test_garbage_request_gets_400_when_salvageable() {
    let (h, map) = counting_harness(TransactionConfig::default());
    let broken = bye_text("z9hG4bK-bad1").replace("CSeq: 2 BYE", "CSeq: two BYE");

    h.deliver(broken.into_bytes(), &peer());

    assert_eq!(map.asked.load(Ordering::SeqCst), 0);
    // The answer echoes the broken CSeq, so look at the raw bytes
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].data.starts_with(b"SIP/2.0 400 "));
    assert_eq!(sent[0].destination, peer());
}

#[tokio::test]
async fn test_response_without_transaction_is_refused() {
    let h = Harness::new(UaConfig::default());
    let bye = Request::parse(bye_text("z9hG4bK-nobody").as_bytes()).unwrap();

    let result = h.tm.send_response(bye.gen_response(200, "OK"), false);

    assert!(result.is_err());
    assert!(h.transport.sent().is_empty());
}

#[tokio::test]
async fn test_own_request_looped_through_proxy_gets_482() {
    let (h, map) = counting_harness(TransactionConfig::default());
    let log = ResponseLog::new();
    let tx = start(&h, outgoing(Method::Invite, "z9hG4bK-loop2"), &log);

    let proxy = HostPort::new("192.0.2.99", 5060);
    let mut proxy_via = Via::new_udp(&proxy);
    proxy_via.set_branch("z9hG4bK-proxy");
    let mut looped = tx.request().clone();
    looped.headers_mut().insert(0, SipHeader::Via(proxy_via));
    h.deliver(looped.to_bytes(), &proxy);

    assert_eq!(h.transport.response_codes(), [482]);
    assert_eq!(h.transport.sent().last().unwrap().destination, proxy);
    assert_eq!(map.asked.load(Ordering::SeqCst), 0);
}

fn stray_ok(vias: &str) -> String {
    format!(
        "SIP/2.0 200 OK\r\n\
{vias}\
From: <sip:alice@192.0.2.1>;tag=alice-7\r\n\
To: <sip:bob@192.0.2.20>;tag=bob-7\r\n\
Call-ID: stray-1\r\n\
CSeq: 1 OPTIONS\r\n\
Content-Length: 0\r\n\r\n"
    )
}

#[tokio::test]
async fn test_stray_response_forwarded_to_its_top_via() {
    let h = Harness::new(UaConfig::default());
    let text = stray_ok(
        "Via: SIP/2.0/UDP 192.0.2.1:5070;branch=z9hG4bK-elsewhere\r\n\
Via: SIP/2.0/UDP 198.51.100.7:5060;branch=z9hG4bK-upstream\r\n",
    );

    h.deliver(text.clone(), &peer());

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].destination, HostPort::new("192.0.2.1", 5070));
    // Passed on as received, both Vias intact
    assert_eq!(&sent[0].data[..], text.as_bytes());

    // A retransmission is absorbed by the cache
    h.deliver(text, &peer());
    assert_eq!(h.transport.sent().len(), 1);
}

#[tokio::test]
async fn test_stray_response_with_single_via_is_dropped() {
    let h = Harness::new(UaConfig::default());

    h.deliver(
        stray_ok("Via: SIP/2.0/UDP 192.0.2.1:5070;branch=z9hG4bK-lonely\r\n"),
        &peer(),
    );

    assert!(h.transport.sent().is_empty());
}

/// Dialog owner claiming requests by To tag
struct Leg {
    to_tag: String,
    lock: SessionLock,
    seen: Mutex<Vec<(Request, Arc<ServerTransaction>)>>,
}

impl Leg {
    fn new(to_tag: &str) -> Arc<Self> {
        Arc::new(Leg {
            to_tag: to_tag.to_string(),
            lock: new_session_lock(),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> usize {
        self.seen.lock().len()
    }

    fn last(&self) -> (Request, Arc<ServerTransaction>) {
        self.seen.lock().last().cloned().expect("a request reached the leg")
    }
}

impl RequestReceiver for Leg {
    fn recv_request(&self, req: Request, tx: &Arc<ServerTransaction>) {
        self.seen.lock().push((req, tx.clone()));
    }

    fn session_lock(&self) -> SessionLock {
        self.lock.clone()
    }

    fn is_yours(&self, req: &Request) -> bool {
        req.to_addr().ok().and_then(Address::tag) == Some(self.to_tag.as_str())
    }
}

fn forked_request(to_tag: &str, branch: &str, cseq: u32) -> String {
    format!(
        "INFO sip:alice@192.0.2.1:5060 SIP/2.0\r\n\
Via: SIP/2.0/UDP 192.0.2.20:5060;branch={branch}\r\n\
Max-Forwards: 70\r\n\
From: <sip:bob@192.0.2.20>;tag=bob-f\r\n\
To: <sip:alice@192.0.2.1>;tag={to_tag}\r\n\
Call-ID: fork-1\r\n\
CSeq: {cseq} INFO\r\n\
Content-Length: 0\r\n\r\n"
    )
}

#[tokio::test]
async fn test_forked_legs_share_a_call_id() {
    let (h, map) = counting_harness(TransactionConfig::default());
    let first = Leg::new("fork-a");
    let second = Leg::new("fork-b");
    let first_rx: Arc<dyn RequestReceiver> = first.clone();
    let second_rx: Arc<dyn RequestReceiver> = second.clone();
    h.tm.reg_consumer(first_rx.clone(), "fork-1");
    h.tm.reg_consumer(second_rx.clone(), "fork-1");
    assert_eq!(h.tm.consumer_count("fork-1"), 2);

    h.deliver(forked_request("fork-b", "z9hG4bK-f1", 2), &peer());
    assert_eq!((first.count(), second.count()), (0, 1));

    h.tm.unreg_consumer(&first_rx, "fork-1");
    assert_eq!(h.tm.consumer_count("fork-1"), 1);

    h.deliver(forked_request("fork-b", "z9hG4bK-f2", 3), &peer());
    assert_eq!(second.count(), 2);
    // The released leg no longer claims anything
    h.deliver(forked_request("fork-a", "z9hG4bK-f3", 4), &peer());
    assert_eq!(first.count(), 0);
    assert_eq!(map.asked.load(Ordering::SeqCst), 1);

    h.tm.unreg_consumer(&second_rx, "fork-1");
    assert_eq!(h.tm.consumer_count("fork-1"), 0);
}

/// Call map handing every new dialog to one leg
struct AcceptingMap {
    leg: Arc<Leg>,
}

impl CallMap for AcceptingMap {
    fn on_new_dialog(
        &self,
        _tm: &Arc<TransactionManager>,
        _req: &Request,
        _tx: &Arc<ServerTransaction>,
    ) -> NewDialog {
        let leg: Arc<dyn RequestReceiver> = self.leg.clone();
        NewDialog::Accept(leg)
    }
}

#[tokio::test(start_paused = true)]
async fn test_provisional_response_repeated_until_final() {
    let leg = Leg::new("bob-p");
    let config = TransactionConfig::default().with_provisional_retransmit(Duration::from_secs(1));
    let h = harness_with_map(config, Arc::new(AcceptingMap { leg: leg.clone() }));
    h.deliver(invite_text("prov-1", "z9hG4bK-prov1", None), &peer());
    let (invite, tx) = leg.last();

    tx.send_response(reply(&invite, 180, "Ringing", Some("bob-p")), false).unwrap();
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(h.transport.response_codes(), [180, 180, 180, 180]);

    tx.send_response(reply(&invite, 200, "OK", Some("bob-p")), false).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    let codes = h.transport.response_codes();
    assert_eq!(codes.iter().filter(|c| **c == 180).count(), 4);
    assert_eq!(codes[4], 200);
}

#[tokio::test(start_paused = true)]
async fn test_held_ack_never_released_ends_transaction() {
    let timers = TimerSettings {
        uack_wait: Duration::from_secs(4),
        ..TimerSettings::default()
    };
    let h = Harness::with_config(
        TransactionConfig::default().with_timers(timers),
        UaConfig::default(),
    );
    let log = ResponseLog::new();
    let receiver: Arc<dyn ResponseReceiver> = log.clone();
    let options = ClientTransactionOptions::new(new_session_lock())
        .with_receiver(Arc::downgrade(&receiver))
        .with_uack(true);
    let tx = h
        .tm
        .new_client_transaction(outgoing(Method::Invite, "z9hG4bK-inv8"), options)
        .unwrap();

    h.deliver_response(&reply(tx.request(), 200, "OK", Some("bob-8")));
    assert_eq!(log.codes(), [200]);
    assert_eq!(h.tm.client_count(), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;

    // Timer D (32 s) has not run; the safety timer ended it
    assert_eq!(h.tm.client_count(), 0);
    assert!(tx.send_ack(None).is_err());
    assert!(h.transport.requests_of(Method::Ack).is_empty());
}
