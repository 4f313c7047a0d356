//! Per-leg SDP bookkeeping
//!
//! A [`SdpSide`] remembers what one party last described (codecs, media
//! address and port of the first relevant section) and rewrites descriptions
//! sent towards it once the relay's or the peer's address is known.
//! [`OriginTracker`] keeps the `o=` line of descriptions we forward consistent
//! over a call.

use b2bua_sip_core::{SdpBody, SdpOrigin};

/// Media type the side follows
const PRIMARY_MEDIA: &str = "audio";

/// What one party last offered or answered
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdpSide {
    pub codecs: Vec<String>,
    pub address: Option<String>,
    pub port: u16,
}

impl SdpSide {
    pub fn new() -> Self {
        Self::default()
    }

    /// Learn codecs and address from the first audio section, or the first
    /// section when there is no audio. Returns `false` if `body` has no media.
    pub fn update_from(&mut self, body: &SdpBody) -> bool {
        let Some(section) = body
            .first_section(PRIMARY_MEDIA)
            .or_else(|| body.sections.first())
        else {
            return false;
        };
        self.codecs = section.codecs().to_vec();
        self.address = body
            .effective_connection(section)
            .map(|c| c.address.clone());
        self.port = section.port();
        true
    }

    pub fn is_known(&self) -> bool {
        self.address.is_some()
    }

    /// Point every media section of `body` at `address:port`. Sections with
    /// port 0 are disabled and stay that way.
    pub fn rewrite(body: &mut SdpBody, address: &str, port: u16) {
        body.set_connection_address(address);
        for section in &mut body.sections {
            if section.port() != 0 {
                section.set_port(port);
            }
        }
    }

    /// Codec list in the comma separated form media relays take
    pub fn codec_list(&self) -> String {
        self.codecs.join(",")
    }
}

/// Keeps one stable `o=` line for the descriptions we send on a leg.
///
/// The version is bumped whenever the origin of the description being
/// forwarded changed since the last one (RFC 4566 §5.2). This is an
/// approximation: a description that changed without a new remote origin
/// keeps our version.
#[derive(Debug, Clone, Default)]
pub struct OriginTracker {
    local: Option<SdpOrigin>,
    last_remote: Option<(String, u64)>,
}

impl OriginTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the origin of `body` with ours, bumping our version if the
    /// incoming origin moved on
    pub fn fix_origin(&mut self, body: &mut SdpBody) {
        let Some(remote) = body.origin().cloned() else {
            return;
        };
        let seen = (remote.session_id.clone(), remote.version);
        let local = match self.local.as_mut() {
            Some(local) => {
                if self.last_remote.as_ref() != Some(&seen) {
                    local.version += 1;
                }
                local.clone()
            }
            None => {
                let local = SdpOrigin::new(&remote.username, &remote.address);
                self.local = Some(local.clone());
                local
            }
        };
        self.last_remote = Some(seen);
        body.set_origin(local);
    }

    pub fn local(&self) -> Option<&SdpOrigin> {
        self.local.as_ref()
    }
}
