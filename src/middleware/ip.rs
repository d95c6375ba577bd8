use axum::{
    extract::{connect_info::ConnectInfo, FromRequestParts},
    http::{request::Parts, Extensions, HeaderMap},
};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};

use crate::state::AppState;

const LOOPBACK: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

/// Client address used for rate limiting and the audit trail.
///
/// `x-forwarded-for` / `x-real-ip` are only honoured when the peer itself is one
/// of `trusted_proxies`; otherwise the transport address wins. Without transport
/// metadata (tests, custom services) the peer counts as loopback.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>, trusted_proxies: &[IpAddr]) -> IpAddr {
    let peer = peer.unwrap_or(LOOPBACK);
    if !trusted_proxies.contains(&peer) {
        return peer;
    }

    if let Some(h) = headers.get("x-forwarded-for").and_then(|hv| hv.to_str().ok()) {
        let hops: Vec<IpAddr> = h.split(',').filter_map(|hop| hop.trim().parse().ok()).collect();
        // Proxies append, so the nearest untrusted hop from the right is the client
        if let Some(ip) = hops.iter().rev().find(|ip| !trusted_proxies.contains(ip)) {
            return *ip;
        }
        if let Some(first) = hops.first() {
            return *first;
        }
    }
    if let Some(h) = headers.get("x-real-ip").and_then(|hv| hv.to_str().ok()) {
        if let Ok(ip) = h.trim().parse::<IpAddr>() {
            return ip;
        }
    }
    peer
}

/// Transport address of the request, when the server was started with connect info.
pub fn peer_ip(extensions: &Extensions) -> Option<IpAddr> {
    extensions.get::<ConnectInfo<SocketAddr>>().map(|ci| ci.0.ip())
}

/// Client address as seen through trusted proxies. Never rejects.
#[derive(Clone, Copy, Debug)]
pub struct ClientIp(pub IpAddr);

impl FromRequestParts<AppState> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let peer = peer_ip(&parts.extensions);
        Ok(ClientIp(client_ip(&parts.headers, peer, &state.config.server.trusted_proxies)))
    }
}
