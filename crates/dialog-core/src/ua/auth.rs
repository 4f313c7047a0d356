//! Digest authentication for outgoing requests (RFC 2617 / RFC 3261 §22)
//!
//! MD5 only. `qop=auth` is used when the challenge offers it; `auth-int` is
//! not supported and such challenges fall back to the RFC 2069 form when
//! `qop` is absent, or are refused otherwise.

use b2bua_sip_core::{Challenge, SipHeader};
use md5::{Digest, Md5};
use rand::Rng;

use crate::config::Credentials;
use crate::errors::{DialogError, DialogResult};

fn md5_hex(input: &str) -> String {
    Md5::digest(input.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Client nonce for `qop=auth`
pub fn gen_cnonce() -> String {
    format!("{:016x}", rand::thread_rng().r#gen::<u64>())
}

/// `response=` value of a Digest authorization
pub fn digest_response(
    credentials: &Credentials,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<(&str, &str)>,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", credentials.username, realm, credentials.password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));
    match qop {
        Some((nc, cnonce)) => md5_hex(&format!("{}:{}:{}:{}:auth:{}", ha1, nonce, nc, cnonce, ha2)),
        None => md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2)),
    }
}

fn offers_auth_qop(challenge: &Challenge) -> Option<bool> {
    let qop = challenge.param("qop")?;
    Some(qop.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")))
}

/// Authorization header value answering `challenge`
pub fn authorization_value(
    challenge: &Challenge,
    credentials: &Credentials,
    method: &str,
    uri: &str,
    cnonce: &str,
) -> DialogResult<String> {
    if !challenge.is_digest() {
        return Err(DialogError::protocol_error(format!(
            "unsupported authentication scheme {}",
            challenge.scheme
        )));
    }
    if let Some(algorithm) = challenge.param("algorithm") {
        if !algorithm.eq_ignore_ascii_case("MD5") {
            return Err(DialogError::protocol_error(format!(
                "unsupported digest algorithm {}",
                algorithm
            )));
        }
    }
    let realm = challenge
        .realm()
        .ok_or_else(|| DialogError::protocol_error("digest challenge without realm"))?;
    let nonce = challenge
        .nonce()
        .ok_or_else(|| DialogError::protocol_error("digest challenge without nonce"))?;

    let qop = match offers_auth_qop(challenge) {
        None => None,
        Some(true) => Some(("00000001", cnonce)),
        Some(false) => return Err(DialogError::protocol_error("challenge requires qop=auth-int")),
    };
    let response = digest_response(credentials, realm, nonce, method, uri, qop);

    let mut value = format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
        credentials.username, realm, nonce, uri, response
    );
    if let Some(opaque) = challenge.param("opaque") {
        value.push_str(&format!(", opaque=\"{}\"", opaque));
    }
    if let Some((nc, cnonce)) = qop {
        value.push_str(&format!(", qop=auth, nc={}, cnonce=\"{}\"", nc, cnonce));
    }
    Ok(value)
}

/// Header answering a challenge taken from a 401 (`proxy == false`) or 407
pub fn authorization_header(
    challenge: &Challenge,
    proxy: bool,
    credentials: &Credentials,
    method: &str,
    uri: &str,
) -> DialogResult<SipHeader> {
    let value = authorization_value(challenge, credentials, method, uri, &gen_cnonce())?;
    Ok(if proxy {
        SipHeader::ProxyAuthorization(value)
    } else {
        SipHeader::Authorization(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mufasa() -> Credentials {
        Credentials::new("Mufasa", "Circle Of Life")
    }

    #[test]
    fn test_rfc2617_example() {
        let challenge: Challenge = "Digest realm=\"testrealm@host.com\", qop=\"auth,auth-int\", \
nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\", opaque=\"5ccc069c403ebaf9f0171e9517f40e41\""
            .parse()
            .unwrap();
        let value =
            authorization_value(&challenge, &mufasa(), "GET", "/dir/index.html", "0a4f113b").unwrap();
        assert!(value.contains("response=\"6629fae49393a05397450978507c4ef1\""));
        assert!(value.contains("qop=auth, nc=00000001, cnonce=\"0a4f113b\""));
        assert!(value.contains("opaque=\"5ccc069c403ebaf9f0171e9517f40e41\""));
    }

    #[test]
    fn test_without_qop() {
        let challenge: Challenge = "Digest realm=\"atlanta.com\", nonce=\"84a4cc6f\"".parse().unwrap();
        let value =
            authorization_value(&challenge, &mufasa(), "INVITE", "sip:bob@biloxi.com", "x").unwrap();
        let expected = digest_response(&mufasa(), "atlanta.com", "84a4cc6f", "INVITE", "sip:bob@biloxi.com", None);
        assert!(value.contains(&format!("response=\"{}\"", expected)));
        assert!(!value.contains("qop"));
    }

    #[test]
    fn test_rejects_unsupported() {
        let basic: Challenge = "Basic realm=\"x\"".parse().unwrap();
        assert!(authorization_value(&basic, &mufasa(), "INVITE", "sip:x", "c").is_err());
        let sha: Challenge = "Digest realm=\"x\", nonce=\"n\", algorithm=SHA-256".parse().unwrap();
        assert!(authorization_value(&sha, &mufasa(), "INVITE", "sip:x", "c").is_err());
        let int_only: Challenge = "Digest realm=\"x\", nonce=\"n\", qop=\"auth-int\"".parse().unwrap();
        assert!(authorization_value(&int_only, &mufasa(), "INVITE", "sip:x", "c").is_err());
    }

    #[test]
    fn test_header_kind_follows_challenge() {
        let challenge: Challenge = "Digest realm=\"x\", nonce=\"n\"".parse().unwrap();
        let www = authorization_header(&challenge, false, &mufasa(), "INVITE", "sip:x").unwrap();
        assert!(matches!(www, SipHeader::Authorization(_)));
        let proxy = authorization_header(&challenge, true, &mufasa(), "INVITE", "sip:x").unwrap();
        assert!(matches!(proxy, SipHeader::ProxyAuthorization(_)));
    }
}
