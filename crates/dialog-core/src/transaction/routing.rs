//! Request routing inside a dialog (RFC 3261 §12.2.1.1)
//!
//! Given the dialog's route set and remote target, work out the Request-URI,
//! the Route headers and the next hop. A loose-routing first hop (`;lr`) keeps
//! the remote target in the Request-URI; a strict-routing one is consumed and
//! its URI becomes the Request-URI. An outbound proxy is always the first
//! Route and the next hop.

use b2bua_sip_core::{Address, HeaderAccess, HostPort, Response, SipUri};

/// Where and how to send an in-dialog request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub request_uri: SipUri,
    pub routes: Vec<Address>,
    pub destination: HostPort,
}

/// Route set as seen by the UAC: the response's Record-Route in reverse
pub fn uac_route_set(resp: &Response) -> Vec<Address> {
    resp.record_routes().into_iter().rev().cloned().collect()
}

/// Remote target learnt from a response's Contact, falling back to `default`
pub fn remote_target(resp: &Response, default: &SipUri) -> SipUri {
    resp.contact()
        .map(|c| c.uri.clone())
        .unwrap_or_else(|| default.clone())
}

pub fn compute_route(
    route_set: &[Address],
    remote_target: &SipUri,
    outbound_proxy: Option<&HostPort>,
) -> RouteDecision {
    let (request_uri, mut routes, mut destination) = match route_set.split_first() {
        None => (remote_target.clone(), Vec::new(), remote_target.host_port()),
        Some((first, _)) if first.uri.lr() => (
            remote_target.clone(),
            route_set.to_vec(),
            first.uri.host_port(),
        ),
        Some((first, rest)) => (first.uri.clone(), rest.to_vec(), first.uri.host_port()),
    };
    if let Some(proxy) = outbound_proxy {
        let uri = SipUri::from_host_port(None, proxy).with_param("lr", None);
        routes.insert(0, Address::new(uri));
        destination = proxy.clone();
    }
    RouteDecision {
        request_uri,
        routes,
        destination,
    }
}
