use b2bua_sip_core::{
    salvage_error_response, Address, CSeq, HeaderAccess, HeaderName, HostPort, Message, Method, MsgBody,
    Request, Response, SipHeader, SipUri, Via, SDP_CONTENT_TYPE,
};

const SDP: &str = "v=0\r\n\
o=alice 2890844526 2890844526 IN IP4 10.0.0.1\r\n\
s=-\r\n\
c=IN IP4 10.0.0.1\r\n\
t=0 0\r\n\
m=audio 49170 RTP/AVP 0\r\n";

fn invite_bytes() -> Vec<u8> {
    format!(
        "INVITE sip:bob@biloxi.com SIP/2.0\r\n\
Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds;rport\r\n\
Via: SIP/2.0/UDP bigbox3.site3.atlanta.com;branch=z9hG4bK77ef4c2312983.1\r\n\
Max-Forwards: 70\r\n\
To: Bob <sip:bob@biloxi.com>\r\n\
From: \"Alice\" <sip:alice@atlanta.com>;tag=1928301774\r\n\
Call-ID: a84b4c76e66710@pc33.atlanta.com\r\n\
CSeq: 314159 INVITE\r\n\
Contact: <sip:alice@pc33.atlanta.com>\r\n\
Route: <sip:p1.example.com;lr>, <sip:p2.example.com;lr>\r\n\
Supported: timer, 100rel\r\n\
Subject: folded\r\n\
\x20subject line\r\n\
Content-Type: application/sdp\r\n\
Content-Length: {}\r\n\r\n{}",
        SDP.len(),
        SDP
    )
    .into_bytes()
}

#[test]
fn test_parse_invite() {
    let req = Request::parse(&invite_bytes()).unwrap();
    assert_eq!(req.method, Method::Invite);
    assert_eq!(req.uri.user.as_deref(), Some("bob"));
    assert_eq!(req.vias().len(), 2);
    assert_eq!(req.top_via().unwrap().branch(), Some("z9hG4bK776asdhds"));
    assert_eq!(req.from_addr().unwrap().tag(), Some("1928301774"));
    assert!(req.to_addr().unwrap().tag().is_none());
    assert_eq!(req.cseq().unwrap(), &CSeq::new(314159, Method::Invite));
    assert_eq!(req.routes().len(), 2);
    assert!(req.supports("100rel"));
    assert!(!req.requires("100rel"));
    assert_eq!(req.header_value("Subject").as_deref(), Some("folded subject line"));

    let body = req.body.as_ref().unwrap();
    assert!(body.is_sdp());
    assert_eq!(body.sdp().unwrap().sections[0].port(), 49170);
}

#[test]
fn test_serialize_then_parse_keeps_dialog_identity() {
    let req = Request::parse(&invite_bytes()).unwrap();
    let wire = req.to_bytes();
    let text = std::str::from_utf8(&wire).unwrap();
    assert!(text.starts_with("INVITE sip:bob@biloxi.com SIP/2.0\r\n"));
    assert!(text.contains(&format!("Content-Length: {}\r\n", SDP.len())));
    assert!(text.ends_with(SDP));

    let again = Request::parse(&wire).unwrap();
    assert_eq!(again.call_id().unwrap(), req.call_id().unwrap());
    assert_eq!(again.routes(), req.routes());
    assert_eq!(again.body.unwrap().to_string(), SDP);
}

#[test]
fn test_content_length_bounds_body() {
    let data = b"OPTIONS sip:a@b SIP/2.0\r\n\
Via: SIP/2.0/UDP h;branch=z9hG4bK1\r\n\
From: <sip:x@y>;tag=1\r\n\
To: <sip:a@b>\r\n\
Call-ID: c1\r\n\
CSeq: 1 OPTIONS\r\n\
Content-Type: text/plain\r\n\
Content-Length: 5\r\n\r\nhello trailing";
    let req = Request::parse(data).unwrap();
    assert_eq!(req.body.unwrap().to_string(), "hello");

    let short = b"OPTIONS sip:a@b SIP/2.0\r\n\
Via: SIP/2.0/UDP h;branch=z9hG4bK1\r\n\
From: <sip:x@y>;tag=1\r\n\
To: <sip:a@b>\r\n\
Call-ID: c1\r\n\
CSeq: 1 OPTIONS\r\n\
Content-Length: 50\r\n\r\nhello";
    assert!(Request::parse(short).is_err());
}

#[test]
fn test_missing_mandatory_header_is_rejected() {
    let data = b"BYE sip:a@b SIP/2.0\r\n\
Via: SIP/2.0/UDP h;branch=z9hG4bK1\r\n\
From: <sip:x@y>;tag=1\r\n\
To: <sip:a@b>;tag=2\r\n\
CSeq: 2 BYE\r\n\r\n";
    assert!(Message::parse(data).is_err());
}

#[test]
fn test_cseq_method_mismatch_is_rejected() {
    let data = b"BYE sip:a@b SIP/2.0\r\n\
Via: SIP/2.0/UDP h;branch=z9hG4bK1\r\n\
From: <sip:x@y>;tag=1\r\n\
To: <sip:a@b>;tag=2\r\n\
Call-ID: c1\r\n\
CSeq: 2 INVITE\r\n\r\n";
    assert!(Request::parse(data).is_err());
}

#[test]
fn test_parse_response() {
    let data = b"SIP/2.0 180 Ringing\r\n\
Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds\r\n\
To: Bob <sip:bob@biloxi.com>;tag=a6c85cf\r\n\
From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
Call-ID: a84b4c76e66710@pc33.atlanta.com\r\n\
CSeq: 314159 INVITE\r\n\
Require: 100rel\r\n\
RSeq: 988789\r\n\
Record-Route: <sip:p2.example.com;lr>\r\n\
Record-Route: <sip:p1.example.com>\r\n\
Content-Length: 0\r\n\r\n";
    assert!(Message::is_response_data(data));
    let resp = Response::parse(data).unwrap();
    assert_eq!(resp.scode, 180);
    assert_eq!(resp.reason, "Ringing");
    assert!(resp.is_provisional());
    assert!(resp.requires("100rel"));
    assert_eq!(resp.rseq(), Some(988789));
    let rr = resp.record_routes();
    assert_eq!(rr.len(), 2);
    assert!(rr[0].uri.lr());
    assert!(!rr[1].uri.lr());
}

#[test]
fn test_gen_ack_and_cancel() {
    let invite = Request::parse(&invite_bytes()).unwrap();
    let mut busy = invite.gen_response(486, "Busy Here");
    busy.to_addr_mut().unwrap().set_tag("xyz");

    let ack = invite.gen_ack(&busy).unwrap();
    assert_eq!(ack.method, Method::Ack);
    assert_eq!(ack.uri, invite.uri);
    assert_eq!(ack.vias().len(), 1);
    assert_eq!(ack.top_via().unwrap(), invite.top_via().unwrap());
    assert_eq!(ack.to_addr().unwrap().tag(), Some("xyz"));
    assert_eq!(ack.cseq().unwrap(), &CSeq::new(314159, Method::Ack));
    assert_eq!(ack.routes().len(), 2);
    assert!(ack.body.is_none());

    let cancel = invite.gen_cancel().unwrap();
    assert_eq!(cancel.method, Method::Cancel);
    assert_eq!(cancel.top_via().unwrap().branch(), Some("z9hG4bK776asdhds"));
    assert!(cancel.to_addr().unwrap().tag().is_none());
    assert_eq!(cancel.cseq().unwrap().method, Method::Cancel);
}

#[test]
fn test_build_request_from_scratch() {
    let local = HostPort::new("192.0.2.10", 5070);
    let req = Request::new(Method::Options, SipUri::new(Some("bob"), "biloxi.com", None))
        .with_header(SipHeader::Via(Via::new_udp(&local)))
        .with_header(SipHeader::From(
            Address::new(SipUri::from_host_port(Some("alice"), &local)).with_tag(&Address::gen_tag()),
        ))
        .with_header(SipHeader::To(Address::new(SipUri::new(Some("bob"), "biloxi.com", None))))
        .with_header(SipHeader::CallId("opt-1@192.0.2.10".to_string()))
        .with_header(SipHeader::CSeq(CSeq::new(1, Method::Options)))
        .with_body(MsgBody::new(SDP_CONTENT_TYPE, SDP));
    req.validate().unwrap();

    let parsed = Request::parse(&req.to_bytes()).unwrap();
    assert_eq!(parsed.top_via().unwrap().sent_by(), local);
    assert!(parsed.top_via().unwrap().rport().is_some());
    assert!(parsed.has_header(&HeaderName::CallId));
    assert!(parsed.body.unwrap().sdp().is_some());
}

#[test]
fn test_salvage_error_response() {
    let broken = b"INVITE sip:bob@biloxi.com SIP/2.0\r\n\
Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds\r\n\
To: <sip:bob@biloxi.com>\r\n\
From: <sip:alice@atlanta.com>;tag=1\r\n\
Call-ID: abc\r\n\
CSeq: 1 INVITE\r\n\
Max-Forwards: lots\r\n\r\n";
    assert!(Request::parse(broken).is_err());

    let resp = salvage_error_response(broken, 400, "Bad Request").unwrap();
    let wire = String::from_utf8(resp.to_bytes().to_vec()).unwrap();
    assert!(wire.starts_with("SIP/2.0 400 Bad Request\r\n"));
    assert!(wire.contains("Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds\r\n"));
    assert!(wire.contains("Call-ID: abc\r\n"));
    assert!(!wire.contains("Max-Forwards"));

    let ack = b"ACK sip:bob@biloxi.com SIP/2.0\r\nVia: x\r\n\r\n";
    assert!(salvage_error_response(ack, 400, "Bad Request").is_none());
    let no_callid = b"BYE sip:a@b SIP/2.0\r\nVia: SIP/2.0/UDP h\r\nFrom: <sip:a@b>\r\nTo: <sip:a@b>\r\nCSeq: 1 BYE\r\n\r\n";
    assert!(salvage_error_response(no_callid, 400, "Bad Request").is_none());
}
