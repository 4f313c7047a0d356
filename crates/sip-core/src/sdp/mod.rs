//! # SDP bodies
//!
//! A deliberately small model of RFC 4566 session descriptions: enough to
//! find and rewrite connection addresses, media ports, origin versions and
//! attributes while leaving every other line untouched.
//!
//! ```rust
//! use b2bua_sip_core::sdp::SdpBody;
//!
//! let mut sdp: SdpBody = "v=0\r\no=- 1 1 IN IP4 10.0.0.1\r\ns=-\r\nc=IN IP4 10.0.0.1\r\nt=0 0\r\nm=audio 4000 RTP/AVP 0 8\r\n"
//!     .parse()
//!     .unwrap();
//! sdp.set_connection_address("192.0.2.1");
//! sdp.sections[0].set_port(5004);
//! assert!(sdp.to_string().contains("c=IN IP4 192.0.2.1\r\n"));
//! assert!(sdp.to_string().contains("m=audio 5004 RTP/AVP 0 8\r\n"));
//! ```

pub mod media;
pub mod session;

pub use media::{SdpMedia, SdpMediaSection};
pub use session::{SdpBody, SdpConnection, SdpLine, SdpOrigin};

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
o=alice 2890844526 2890844526 IN IP4 10.0.0.1\r\n\
s=-\r\n\
c=IN IP4 10.0.0.1\r\n\
t=0 0\r\n\
m=audio 49170 RTP/AVP 0 8 101\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:101 telephone-event/8000\r\n\
a=sendrecv\r\n\
m=video 51372 RTP/AVP 31\r\n\
c=IN IP4 10.0.0.2\r\n";

    #[test]
    fn test_parse_and_reserialize_unchanged() {
        let sdp: SdpBody = OFFER.parse().unwrap();
        assert_eq!(sdp.to_string(), OFFER);
        assert_eq!(sdp.sections.len(), 2);
        assert_eq!(sdp.origin().unwrap().version, 2890844526);
    }

    #[test]
    fn test_section_accessors() {
        let sdp: SdpBody = OFFER.parse().unwrap();
        let audio = sdp.first_section("audio").unwrap();
        assert_eq!(audio.port(), 49170);
        assert_eq!(audio.codecs(), ["0", "8", "101"]);
        assert_eq!(audio.attribute("rtpmap"), Some("0 PCMU/8000"));
        assert_eq!(audio.attribute("sendrecv"), Some(""));
        assert_eq!(sdp.effective_connection(audio).unwrap().address, "10.0.0.1");
        let video = sdp.first_section("video").unwrap();
        assert_eq!(sdp.effective_connection(video).unwrap().address, "10.0.0.2");
    }

    #[test]
    fn test_hold_zeroes_every_connection() {
        let mut sdp: SdpBody = OFFER.parse().unwrap();
        assert!(!sdp.is_on_hold());
        sdp.hold();
        assert!(sdp.is_on_hold());
        assert_eq!(sdp.connection().unwrap().address, "0.0.0.0");
        assert_eq!(sdp.sections[1].connection().unwrap().address, "0.0.0.0");
        // Audio inherits the session-level line, no section c= is added
        assert!(sdp.sections[0].connection().is_none());
    }

    #[test]
    fn test_attribute_edit() {
        let mut sdp: SdpBody = OFFER.parse().unwrap();
        let audio = &mut sdp.sections[0];
        audio.remove_attributes("sendrecv");
        audio.add_attribute("sendonly");
        assert_eq!(audio.attribute("sendonly"), Some(""));
        assert!(audio.attribute("sendrecv").is_none());
    }

    #[test]
    fn test_rejects_malformed() {
        assert!("o=x\r\n".parse::<SdpBody>().is_err());
        assert!("v=0\r\nm=audio notaport RTP/AVP 0\r\n".parse::<SdpBody>().is_err());
        assert!("v=0\r\nthis is not sdp\r\n".parse::<SdpBody>().is_err());
    }
}
