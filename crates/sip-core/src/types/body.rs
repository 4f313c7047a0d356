use std::fmt;

use crate::error::{Error, Result};
use crate::sdp::SdpBody;

pub const SDP_CONTENT_TYPE: &str = "application/sdp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyContent {
    Raw(String),
    Sdp(SdpBody),
}

/// Message body with its content type.
///
/// `application/sdp` bodies are parsed when the message is parsed; one that
/// fails to parse stays `Raw`, which callers detect with
/// [`MsgBody::is_malformed_sdp`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgBody {
    content_type: String,
    content: BodyContent,
    needs_update: bool,
}

impl MsgBody {
    /// Body of any type, parsed as SDP when the type says so
    pub fn new(content_type: impl Into<String>, raw: impl Into<String>) -> Self {
        let content_type = content_type.into();
        let raw = raw.into();
        let content = if is_sdp_type(&content_type) {
            match raw.parse::<SdpBody>() {
                Ok(sdp) => BodyContent::Sdp(sdp),
                Err(_) => BodyContent::Raw(raw),
            }
        } else {
            BodyContent::Raw(raw)
        };
        MsgBody {
            content_type,
            content,
            needs_update: true,
        }
    }

    pub fn from_sdp(sdp: SdpBody) -> Self {
        MsgBody {
            content_type: SDP_CONTENT_TYPE.to_string(),
            content: BodyContent::Sdp(sdp),
            needs_update: true,
        }
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn content(&self) -> &BodyContent {
        &self.content
    }

    pub fn is_sdp(&self) -> bool {
        is_sdp_type(&self.content_type)
    }

    pub fn is_malformed_sdp(&self) -> bool {
        self.is_sdp() && matches!(self.content, BodyContent::Raw(_))
    }

    pub fn sdp(&self) -> Option<&SdpBody> {
        match &self.content {
            BodyContent::Sdp(sdp) => Some(sdp),
            BodyContent::Raw(_) => None,
        }
    }

    pub fn sdp_mut(&mut self) -> Option<&mut SdpBody> {
        match &mut self.content {
            BodyContent::Sdp(sdp) => Some(sdp),
            BodyContent::Raw(_) => None,
        }
    }

    /// The SDP, or an error describing why there is none
    pub fn require_sdp(&self) -> Result<&SdpBody> {
        self.sdp()
            .ok_or_else(|| Error::Sdp(format!("no parsable SDP in {} body", self.content_type)))
    }

    /// Whether the body still has to pass through the local SDP change hook
    pub fn needs_update(&self) -> bool {
        self.needs_update
    }

    pub fn set_needs_update(&mut self, needs_update: bool) {
        self.needs_update = needs_update;
    }

    pub fn is_empty(&self) -> bool {
        match &self.content {
            BodyContent::Raw(raw) => raw.is_empty(),
            BodyContent::Sdp(_) => false,
        }
    }
}

fn is_sdp_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(|t| t.trim().eq_ignore_ascii_case(SDP_CONTENT_TYPE))
        .unwrap_or(false)
}

impl fmt::Display for MsgBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.content {
            BodyContent::Raw(raw) => f.write_str(raw),
            BodyContent::Sdp(sdp) => write!(f, "{}", sdp),
        }
    }
}
