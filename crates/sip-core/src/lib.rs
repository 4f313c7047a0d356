//! # SIP message model
//!
//! Typed SIP requests and responses, a compact RFC 3261 parser and
//! serializer, and an order-preserving SDP body model.
//!
//! The parser covers what a transaction and dialog layer needs: request and
//! status lines, the dialog-identity and routing headers, compact header
//! forms, comma-separated lists, folded lines and Content-Length framing.
//! Headers it does not interpret are carried through unchanged.
//!
//! ```rust
//! use b2bua_sip_core::{HeaderAccess, Message};
//!
//! let data = b"BYE sip:alice@10.0.0.1 SIP/2.0\r\n\
//! v: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bK74bf9\r\n\
//! f: <sip:bob@biloxi.com>;tag=8321234356\r\n\
//! t: <sip:alice@atlanta.com>;tag=9fxced76sl\r\n\
//! i: 3848276298220188511@atlanta.com\r\n\
//! CSeq: 231 BYE\r\n\
//! l: 0\r\n\r\n";
//!
//! let Message::Request(bye) = Message::parse(data).unwrap() else {
//!     panic!("expected a request");
//! };
//! assert_eq!(bye.cseq().unwrap().seq, 231);
//! assert_eq!(bye.from_addr().unwrap().tag(), Some("8321234356"));
//! ```

pub mod error;
pub mod message;
pub mod parser;
pub mod sdp;
pub mod types;

pub use error::{Error, Result};
pub use message::{HeaderAccess, Message, Request, Response, DEFAULT_MAX_FORWARDS};
pub use parser::{parse_message, salvage_error_response};
pub use sdp::{SdpBody, SdpConnection, SdpMediaSection, SdpOrigin};
pub use types::address::Address;
pub use types::auth::Challenge;
pub use types::body::{BodyContent, MsgBody, SDP_CONTENT_TYPE};
pub use types::cseq::CSeq;
pub use types::headers::{HeaderName, SipHeader};
pub use types::host::{HostPort, DEFAULT_SIP_PORT};
pub use types::method::Method;
pub use types::param::Params;
pub use types::rack::RAck;
pub use types::reason::Reason;
pub use types::uri::SipUri;
pub use types::via::{Via, BRANCH_MAGIC_COOKIE};
