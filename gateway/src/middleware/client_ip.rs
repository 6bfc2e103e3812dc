//! Client address resolution behind trusted reverse proxies
//!
//! The TCP peer is the client unless it sits inside one of the configured
//! trusted proxy networks. In that case `X-Forwarded-For` is walked from the
//! right and the first address that is not itself a trusted proxy wins, with
//! `X-Real-IP` as a fallback. Headers from untrusted peers are ignored.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tower_governor::{GovernorError, key_extractor::KeyExtractor};

use crate::state::AppState;
use crate::utils::IpNetwork;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Resolved client address, inserted into request extensions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

fn is_trusted(ip: IpAddr, trusted: &[IpNetwork]) -> bool {
    trusted.iter().any(|net| net.contains(ip))
}

fn from_forwarded_for(value: &str, trusted: &[IpNetwork]) -> Option<IpAddr> {
    let hops: Vec<&str> = value.split(',').map(str::trim).collect();

    for (idx, hop) in hops.iter().enumerate().rev() {
        let ip: IpAddr = hop.parse().ok()?;
        if idx == 0 || !is_trusted(ip, trusted) {
            return Some(ip);
        }
    }
    None
}

/// Resolve the client address for a request from `peer`.
pub fn resolve_client_ip(peer: IpAddr, headers: &HeaderMap, trusted: &[IpNetwork]) -> IpAddr {
    if !is_trusted(peer, trusted) {
        return peer;
    }

    let forwarded = headers
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| from_forwarded_for(v, trusted));
    if let Some(ip) = forwarded {
        return ip;
    }

    headers
        .get(X_REAL_IP)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(peer)
}

/// Middleware that inserts [`ClientIp`] for downstream layers and handlers.
pub async fn client_ip_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut request: Request,
    next: Next,
) -> Response {
    let ip = resolve_client_ip(addr.ip(), request.headers(), &state.config.trusted_proxies);
    if ip != addr.ip() {
        tracing::debug!(peer = %addr.ip(), client = %ip, "Client address taken from proxy headers");
    }
    request.extensions_mut().insert(ClientIp(ip));
    next.run(request).await
}

/// Rate limiter key taken from the [`ClientIp`] extension.
///
/// Forwarding headers only count when the peer is a trusted proxy, so a
/// direct client cannot rotate `X-Forwarded-For` to get fresh buckets.
/// Requires [`client_ip_middleware`] to run first.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClientIpKeyExtractor;

impl KeyExtractor for ClientIpKeyExtractor {
    type Key = IpAddr;

    fn extract<T>(&self, req: &http::Request<T>) -> Result<Self::Key, GovernorError> {
        req.extensions()
            .get::<ClientIp>()
            .map(|ClientIp(ip)| *ip)
            .ok_or(GovernorError::UnableToExtractKey)
    }
}
