//! Client allow-list enforced in front of every route.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use geoip_extensions::IpSet;
use tracing::warn;

use crate::GatewayState;

/// Header set by a trusted edge proxy carrying the original client address.
pub const TRUE_CLIENT_IP_HEADER: &str = "true-client-ip";

/// `True-Client-IP` when present and parsable, else the socket peer.
pub fn whitelist_client_address(request: &Request) -> Option<IpAddr> {
    let forwarded = request
        .headers()
        .get(TRUE_CLIENT_IP_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if let Some(forwarded) = forwarded {
        return forwarded.parse().ok();
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(peer)| peer.ip())
}

pub fn is_client_allowed(whitelist: &IpSet, client: Option<IpAddr>) -> bool {
    match client {
        Some(ip) if ip.is_loopback() => true,
        Some(ip) => whitelist.contains(&ip.to_string()),
        None => false,
    }
}

pub(crate) async fn enforce_whitelist(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(whitelist) = state.config.whitelist.as_ref() else {
        return next.run(request).await;
    };
    let client = whitelist_client_address(&request);
    if is_client_allowed(whitelist, client) {
        return next.run(request).await;
    }
    warn!(
        client = %client.map(|ip| ip.to_string()).unwrap_or_default(),
        path = %request.uri().path(),
        "rejecting request from client outside the whitelist"
    );
    StatusCode::BAD_REQUEST.into_response()
}

#[cfg(test)]
mod tests {
    use super::is_client_allowed;
    use geoip_extensions::IpSet;

    #[test]
    fn unit_is_client_allowed_matches_addresses_and_ranges() {
        let whitelist = IpSet::from_entries(["203.0.113.7", "10.0.0.0/8"]).expect("whitelist");
        assert!(is_client_allowed(&whitelist, Some("203.0.113.7".parse().expect("ip"))));
        assert!(is_client_allowed(&whitelist, Some("10.20.30.40".parse().expect("ip"))));
        assert!(is_client_allowed(&whitelist, Some("::1".parse().expect("ip"))));
        assert!(!is_client_allowed(&whitelist, Some("198.51.100.1".parse().expect("ip"))));
        assert!(!is_client_allowed(&whitelist, None));
    }
}
