//! Call-control events
//!
//! A [`CCEvent`] is what a user agent and the application controlling it
//! exchange: the UA turns SIP traffic into events for its controller, and the
//! controller drives the UA (and, in a B2BUA, the other leg) with events of
//! its own.
//!
//! Every event gets a sequence number from one process-wide counter when it
//! is created. A UA delivers events to its controller in strictly increasing
//! sequence order and drops any that would go backwards, which can happen when
//! SDP processing completes out of order.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use b2bua_infra_common::MonoTime;
use b2bua_sip_core::{Address, MsgBody, Reason, SipHeader};

static EVENT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Next process-wide event sequence number; the first one is 1
pub fn next_event_seq() -> u64 {
    EVENT_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// What happened, with the data that goes with it
#[derive(Debug, Clone, PartialEq)]
pub enum CCEventKind {
    /// New call: an INVITE received by a UAS, or a request to a UAC to place one
    Try {
        call_id: String,
        /// Calling party user part
        cli: String,
        /// Called party user part
        cld: String,
        body: Option<MsgBody>,
        caller_name: Option<String>,
    },
    /// Call progress (18x)
    Ring {
        scode: u16,
        reason: String,
        body: Option<MsgBody>,
    },
    /// Answered
    Connect {
        scode: u16,
        reason: String,
        body: Option<MsgBody>,
    },
    /// Answered, but the answer SDP is still to come with the ACK
    PreConnect {
        scode: u16,
        reason: String,
        body: Option<MsgBody>,
    },
    /// Session modification inside an established call
    Update { body: Option<MsgBody> },
    /// Mid-call information
    Info { body: Option<MsgBody> },
    /// 3xx final answer
    Redirect {
        scode: u16,
        reason: String,
        contacts: Vec<Address>,
    },
    /// 4xx-6xx final answer
    Fail {
        scode: u16,
        reason: String,
        /// `WWW-Authenticate` / `Proxy-Authenticate` headers of an
        /// unanswered challenge
        challenges: Vec<SipHeader>,
    },
    /// Call over. `redirect_to` carries a transfer target.
    Disconnect { redirect_to: Option<Address> },
}

impl CCEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            CCEventKind::Try { .. } => "Try",
            CCEventKind::Ring { .. } => "Ring",
            CCEventKind::Connect { .. } => "Connect",
            CCEventKind::PreConnect { .. } => "PreConnect",
            CCEventKind::Update { .. } => "Update",
            CCEventKind::Info { .. } => "Info",
            CCEventKind::Redirect { .. } => "Redirect",
            CCEventKind::Fail { .. } => "Fail",
            CCEventKind::Disconnect { .. } => "Disconnect",
        }
    }
}

/// Call-control event
#[derive(Debug, Clone, PartialEq)]
pub struct CCEvent {
    pub kind: CCEventKind,
    pub seq: u64,
    pub rtime: MonoTime,
    /// Who produced the event, e.g. `caller` or `callee`
    pub origin: String,
    /// Headers to copy into the SIP message the event turns into
    pub extra_headers: Vec<SipHeader>,
    pub reason: Option<Reason>,
}

impl CCEvent {
    pub fn new(kind: CCEventKind, rtime: MonoTime, origin: impl Into<String>) -> Self {
        CCEvent {
            kind,
            seq: next_event_seq(),
            rtime,
            origin: origin.into(),
            extra_headers: Vec::new(),
            reason: None,
        }
    }

    /// Override the sequence number
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub fn with_reason(mut self, reason: Reason) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn with_extra_header(mut self, header: SipHeader) -> Self {
        self.extra_headers.push(header);
        self
    }

    /// The only mutation an event allows after construction
    pub fn append_extra_header(&mut self, header: SipHeader) {
        self.extra_headers.push(header);
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn body(&self) -> Option<&MsgBody> {
        match &self.kind {
            CCEventKind::Try { body, .. }
            | CCEventKind::Ring { body, .. }
            | CCEventKind::Connect { body, .. }
            | CCEventKind::PreConnect { body, .. }
            | CCEventKind::Update { body }
            | CCEventKind::Info { body } => body.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn body_slot(&mut self) -> Option<&mut Option<MsgBody>> {
        match &mut self.kind {
            CCEventKind::Try { body, .. }
            | CCEventKind::Ring { body, .. }
            | CCEventKind::Connect { body, .. }
            | CCEventKind::PreConnect { body, .. }
            | CCEventKind::Update { body }
            | CCEventKind::Info { body } => Some(body),
            _ => None,
        }
    }

    pub(crate) fn take_body(&mut self) -> Option<MsgBody> {
        self.body_slot().and_then(Option::take)
    }

    pub(crate) fn set_body(&mut self, new_body: Option<MsgBody>) {
        if let Some(slot) = self.body_slot() {
            *slot = new_body;
        }
    }

    /// Status code carried by the event, if any
    pub fn scode(&self) -> Option<u16> {
        match &self.kind {
            CCEventKind::Ring { scode, .. }
            | CCEventKind::Connect { scode, .. }
            | CCEventKind::PreConnect { scode, .. }
            | CCEventKind::Redirect { scode, .. }
            | CCEventKind::Fail { scode, .. } => Some(*scode),
            _ => None,
        }
    }
}

impl fmt::Display for CCEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} from {}", self.name(), self.seq, self.origin)?;
        if let Some(scode) = self.scode() {
            write!(f, " ({})", scode)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use b2bua_sip_core::SDP_CONTENT_TYPE;

    fn ring() -> CCEvent {
        CCEvent::new(
            CCEventKind::Ring {
                scode: 180,
                reason: "Ringing".into(),
                body: None,
            },
            MonoTime::now().unwrap(),
            "callee",
        )
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let a = ring();
        let b = ring();
        assert!(a.seq >= 1);
        assert!(b.seq > a.seq);
        assert_eq!(ring().with_seq(5).seq, 5);
    }

    #[test]
    fn test_body_access() {
        let mut ev = ring();
        assert!(ev.body().is_none());
        ev.set_body(Some(MsgBody::new(SDP_CONTENT_TYPE, "v=0\r\n")));
        assert!(ev.body().is_some());
        assert!(ev.take_body().is_some());
        assert!(ev.body().is_none());

        let mut disc = CCEvent::new(
            CCEventKind::Disconnect { redirect_to: None },
            MonoTime::now().unwrap(),
            "caller",
        );
        disc.set_body(Some(MsgBody::new("text/plain", "x")));
        assert!(disc.body().is_none());
        assert_eq!(disc.scode(), None);
    }

    #[test]
    fn test_extra_headers_append() {
        let mut ev = ring().with_extra_header(SipHeader::other("X-Leg", "a"));
        ev.append_extra_header(SipHeader::other("X-Leg", "b"));
        assert_eq!(ev.extra_headers.len(), 2);
        assert_eq!(ev.to_string(), format!("Ring#{} from callee (180)", ev.seq));
    }
}
