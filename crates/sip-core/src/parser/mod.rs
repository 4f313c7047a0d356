//! Wire-format parsing.
//!
//! Framing follows RFC 3261 §7: a start line, header lines (folded
//! continuation lines are unfolded), an empty line, then the body, bounded by
//! Content-Length when present. Start lines are parsed with `nom`; header
//! values are handed to the typed header parsers.

use std::str;

use bytes::Bytes;
use nom::bytes::complete::{tag_no_case, take_till, take_till1, take_while_m_n};
use nom::character::complete::space1;
use nom::combinator::{map_res, opt, rest};
use nom::sequence::{preceded, tuple};
use nom::IResult;

use crate::error::{Error, Result};
use crate::message::{Message, Request, Response};
use crate::types::body::MsgBody;
use crate::types::headers::{HeaderName, SipHeader};

/// Prefix that marks a datagram as a response
pub const RESPONSE_PREFIX: &[u8] = b"SIP/2.0 ";

/// `Method SP Request-URI SP SIP-Version`
pub fn parse_request_line(input: &str) -> IResult<&str, (&str, &str)> {
    let (input, (method, _, uri, _, _)) = tuple((
        take_till1(|c: char| c == ' '),
        space1,
        take_till1(|c: char| c == ' '),
        space1,
        tag_no_case("SIP/2.0"),
    ))(input)?;
    Ok((input, (method, uri)))
}

/// `SIP-Version SP Status-Code SP Reason-Phrase`
pub fn parse_status_line(input: &str) -> IResult<&str, (u16, &str)> {
    let (input, (_, _, code, reason)) = tuple((
        tag_no_case("SIP/2.0"),
        space1,
        map_res(take_while_m_n(3, 3, |c: char| c.is_ascii_digit()), |s: &str| {
            s.parse::<u16>()
        }),
        opt(preceded(space1, rest)),
    ))(input)?;
    Ok((input, (code, reason.unwrap_or(""))))
}

fn header_line(input: &str) -> IResult<&str, &str> {
    let (value, (name, _)) = tuple((take_till(|c: char| c == ':'), nom::character::complete::char(':')))(input)?;
    Ok((value, name))
}

struct Framed<'a> {
    start_line: &'a str,
    headers: Vec<(String, String)>,
    body: &'a str,
}

fn frame(text: &str) -> Result<Framed<'_>> {
    let (head, body) = match text.find("\r\n\r\n") {
        Some(idx) => (&text[..idx], &text[idx + 4..]),
        None => match text.find("\n\n") {
            Some(idx) => (&text[..idx], &text[idx + 2..]),
            None => (text.trim_end_matches(['\r', '\n']), ""),
        },
    };

    let mut lines = head.split('\n').map(|l| l.trim_end_matches('\r'));
    let start_line = lines
        .next()
        .filter(|l| !l.trim().is_empty())
        .ok_or_else(|| Error::Parse("empty message".to_string()))?;

    let mut headers: Vec<(String, String)> = Vec::new();
    for line in lines {
        if line.starts_with(' ') || line.starts_with('\t') {
            let (_, value) = headers
                .last_mut()
                .ok_or_else(|| Error::Parse("continuation line before any header".to_string()))?;
            value.push(' ');
            value.push_str(line.trim());
            continue;
        }
        if line.is_empty() {
            continue;
        }
        let (value, name) =
            header_line(line).map_err(|_| Error::Parse(format!("malformed header line '{}'", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(Framed {
        start_line,
        headers,
        body,
    })
}

/// Parse a datagram into a request or response
pub fn parse_message(data: &[u8]) -> Result<Message> {
    let text = str::from_utf8(data).map_err(|e| Error::Parse(format!("message is not UTF-8: {}", e)))?;
    let framed = frame(text)?;

    let mut headers = Vec::with_capacity(framed.headers.len());
    let mut content_type = None;
    let mut content_length = None;
    for (name, value) in &framed.headers {
        match name.parse::<HeaderName>()? {
            HeaderName::ContentType => content_type = Some(value.clone()),
            HeaderName::ContentLength => {
                content_length = Some(value.parse::<usize>().map_err(|_| {
                    Error::InvalidHeader {
                        name: "Content-Length".to_string(),
                        reason: format!("not a number: '{}'", value),
                    }
                })?)
            }
            _ => headers.extend(SipHeader::parse(name, value)?),
        }
    }

    let mut body_text = framed.body;
    if let Some(len) = content_length {
        if len > body_text.len() {
            return Err(Error::Parse(format!(
                "Content-Length {} exceeds {} body bytes",
                len,
                body_text.len()
            )));
        }
        body_text = body_text
            .get(..len)
            .ok_or_else(|| Error::Parse("Content-Length splits a character".to_string()))?;
    }
    let body = if body_text.is_empty() {
        None
    } else {
        Some(MsgBody::new(
            content_type.unwrap_or_else(|| "application/octet-stream".to_string()),
            body_text,
        ))
    };

    let message = if framed.start_line.as_bytes().starts_with(RESPONSE_PREFIX) {
        let (_, (scode, reason)) = parse_status_line(framed.start_line)
            .map_err(|e| Error::Parse(format!("bad status line '{}': {}", framed.start_line, e)))?;
        Message::Response(Response::from_parts(scode, reason.to_string(), headers, body))
    } else {
        let (remaining, (method, uri)) = parse_request_line(framed.start_line)
            .map_err(|e| Error::Parse(format!("bad request line '{}': {}", framed.start_line, e)))?;
        if !remaining.trim().is_empty() {
            return Err(Error::Parse(format!("trailing data in request line '{}'", framed.start_line)));
        }
        Message::Request(Request::from_parts(method.parse()?, uri.parse()?, headers, body))
    };
    message.validate()?;
    Ok(message)
}

/// Build a `scode` response from a request too broken to parse, copying the
/// headers a response must echo verbatim. Returns `None` for responses, ACKs
/// and data lacking any of those headers.
pub fn salvage_error_response(data: &[u8], scode: u16, reason: &str) -> Option<Response> {
    if data.starts_with(RESPONSE_PREFIX) {
        return None;
    }
    let text = str::from_utf8(data).ok()?;
    let framed = frame(text).ok()?;
    if framed.start_line.starts_with("ACK ") {
        return None;
    }
    let mut response = Response::new(scode, reason);
    let mut seen = [false; 5];
    for (name, value) in &framed.headers {
        let Ok(header_name) = name.parse::<HeaderName>() else {
            continue;
        };
        let slot = match header_name {
            HeaderName::Via => 0,
            HeaderName::From => 1,
            HeaderName::To => 2,
            HeaderName::CallId => 3,
            HeaderName::CSeq => 4,
            _ => continue,
        };
        seen[slot] = true;
        response
            .headers
            .push(SipHeader::other(header_name.as_str(), value.as_str()));
    }
    seen.iter().all(|s| *s).then_some(response)
}

/// Serialize the shared part of a message: start line, headers, body
pub(crate) fn serialize(start_line: &str, headers: &[SipHeader], body: Option<&MsgBody>) -> Bytes {
    let body_text = body.map(|b| b.to_string()).unwrap_or_default();
    let mut out = String::with_capacity(256 + body_text.len());
    out.push_str(start_line);
    out.push_str("\r\n");
    for header in headers {
        out.push_str(&header.to_string());
        out.push_str("\r\n");
    }
    if let Some(body) = body {
        out.push_str("Content-Type: ");
        out.push_str(body.content_type());
        out.push_str("\r\n");
    }
    out.push_str(&format!("Content-Length: {}\r\n\r\n", body_text.len()));
    out.push_str(&body_text);
    Bytes::from(out)
}
