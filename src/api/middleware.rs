//! Request middleware: API version, caller address and authentication

use std::net::{IpAddr, SocketAddr};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, info, warn};

use super::{ApiError, AppState};
use crate::config::parse_cidr;

/// Header carrying the API version, on requests and responses
pub const VERSION_HEADER: &str = "draupnir-version";

/// Version this server speaks
pub const API_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Split `major.minor.patch`
fn parse_semver(version: &str) -> Option<(u64, u64, u64)> {
    let mut parts = version.split('.');
    let mut component = || -> Option<u64> {
        parts
            .next()
            .filter(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))?
            .parse()
            .ok()
    };
    let parsed = (component()?, component()?, component()?);
    parts.next().is_none().then_some(parsed)
}

/// A client may talk to a server with the same major version and at least
/// its minor version. An unparseable server version accepts everyone.
fn is_compatible(server: &str, requested: &str) -> bool {
    let Some((major, minor, _)) = parse_semver(server) else {
        return true;
    };
    parse_semver(requested).is_some_and(|(req_major, req_minor, _)| req_major == major && req_minor <= minor)
}

/// Reject requests without a compatible `Draupnir-Version` header
pub async fn check_api_version(request: Request<Body>, next: Next) -> Response {
    let rejection = match request.headers().get(VERSION_HEADER) {
        None => Some(ApiError::bad_request(
            "No API version specified in Draupnir-Version header",
        )),
        Some(value) => {
            let requested = value.to_str().unwrap_or_default();
            (!is_compatible(API_VERSION, requested)).then(|| {
                ApiError::bad_request(format!(
                    "Specified API version ({requested}) does not match server version ({API_VERSION})"
                ))
            })
        }
    };

    match rejection {
        Some(err) => {
            debug!(path = %request.uri().path(), "Rejected request with incompatible API version");
            err.into_response()
        }
        None => next.run(request).await,
    }
}

/// Stamp the server's API version on the response
pub async fn with_version(request: Request<Body>, next: Next) -> Response {
    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(VERSION_HEADER, HeaderValue::from_static(API_VERSION));
    response
}

/// Caller address, as used for whitelisting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

/// Works out which address a request came from
#[derive(Debug, Clone, Default)]
pub struct ClientIpResolver {
    use_x_forwarded_for: bool,
    trusted_proxies: Vec<(IpAddr, u8)>,
}

impl ClientIpResolver {
    /// Create a resolver. Unparseable CIDRs are skipped with a warning.
    pub fn new(use_x_forwarded_for: bool, trusted_proxy_cidrs: &[String]) -> Self {
        let trusted_proxies = trusted_proxy_cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = parse_cidr(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Ignoring invalid trusted proxy CIDR");
                }
                parsed
            })
            .collect();

        Self {
            use_x_forwarded_for,
            trusted_proxies,
        }
    }

    /// Right-most untrusted `X-Forwarded-For` entry when enabled, otherwise
    /// the socket peer
    pub fn resolve(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
        if self.use_x_forwarded_for {
            if let Some(ip) = self.from_forwarded_for(headers) {
                return Some(ip);
            }
        }
        peer.map(|addr| addr.ip())
    }

    fn from_forwarded_for(&self, headers: &HeaderMap) -> Option<IpAddr> {
        let xff = headers.get("x-forwarded-for")?.to_str().ok()?.trim();
        if xff.is_empty() {
            return None;
        }

        xff.split(',')
            .map(str::trim)
            .filter_map(|entry| match entry.parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    warn!(entry = %entry, header = %xff, "Invalid IP address in X-Forwarded-For header");
                    None
                }
            })
            .filter(|ip| !self.is_trusted(*ip))
            .last()
    }

    fn is_trusted(&self, ip: IpAddr) -> bool {
        self.trusted_proxies
            .iter()
            .any(|(network, prefix)| cidr_contains(*network, *prefix, ip))
    }
}

/// Whether `ip` lies within `network/prefix`
fn cidr_contains(network: IpAddr, prefix: u8, ip: IpAddr) -> bool {
    match (network, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
            u32::from(net) & mask == u32::from(ip) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
            u128::from(net) & mask == u128::from(ip) & mask
        }
        _ => false,
    }
}

/// Resolve the caller's address and attach it as [`ClientIp`]
pub async fn record_client_ip(State(state): State<AppState>, mut request: Request<Body>, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let Some(ip) = state.client_ip.resolve(request.headers(), peer) else {
        return ApiError::internal("failed to determine IP address", &"no peer address or usable X-Forwarded-For")
            .into_response();
    };

    request.extensions_mut().insert(ClientIp(ip));
    next.run(request).await
}

/// Authenticate the request and attach the [`AuthenticatedUser`](crate::auth::AuthenticatedUser)
pub async fn authenticate(State(state): State<AppState>, mut request: Request<Body>, next: Next) -> Response {
    match state.authenticator.authenticate_request(request.headers()).await {
        Ok(user) => {
            debug!(user_email = %user.email, path = %request.uri().path(), "Authenticated request");
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(e) => {
            info!(path = %request.uri().path(), error = %e, "Rejected request");
            ApiError::unauthorized().into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn xff(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_str(value).unwrap());
        headers
    }

    fn peer() -> Option<SocketAddr> {
        Some("10.1.1.1:40000".parse().unwrap())
    }

    #[test]
    fn uses_peer_when_forwarded_for_disabled() {
        let resolver = ClientIpResolver::new(false, &[]);
        assert_eq!(
            resolver.resolve(&xff("1.2.3.4"), peer()),
            Some("10.1.1.1".parse().unwrap())
        );
    }

    #[test]
    fn takes_right_most_untrusted_entry() {
        let resolver = ClientIpResolver::new(true, &["10.0.0.0/8".to_string()]);
        assert_eq!(
            resolver.resolve(&xff("1.1.1.1, 2.2.2.2,10.0.0.5"), peer()),
            Some("2.2.2.2".parse().unwrap())
        );
    }

    #[test]
    fn skips_invalid_entries() {
        let resolver = ClientIpResolver::new(true, &[]);
        assert_eq!(
            resolver.resolve(&xff("3.3.3.3, garbage"), peer()),
            Some("3.3.3.3".parse().unwrap())
        );
    }

    #[test]
    fn falls_back_to_peer_when_all_entries_trusted() {
        let resolver = ClientIpResolver::new(true, &["10.0.0.0/8".to_string()]);
        assert_eq!(
            resolver.resolve(&xff("10.0.0.1, 10.0.0.2"), peer()),
            Some("10.1.1.1".parse().unwrap())
        );
        assert_eq!(resolver.resolve(&HeaderMap::new(), None), None);
    }

    #[test]
    fn semver_parsing() {
        assert_eq!(parse_semver("5.0.12"), Some((5, 0, 12)));
        assert_eq!(parse_semver("5.0"), None);
        assert_eq!(parse_semver("5.0.1.2"), None);
        assert_eq!(parse_semver("v5.0.1"), None);
        assert_eq!(parse_semver("5..1"), None);
    }

    #[test]
    fn version_compatibility() {
        assert!(is_compatible("5.2.0", "5.2.9"));
        assert!(is_compatible("5.2.0", "5.1.0"));
        assert!(!is_compatible("5.2.0", "5.3.0"));
        assert!(!is_compatible("5.2.0", "4.2.0"));
        assert!(!is_compatible("5.2.0", "latest"));
        assert!(is_compatible("dev", "anything"));
    }

    #[test]
    fn cidr_matching() {
        let net: IpAddr = "192.168.0.0".parse().unwrap();
        assert!(cidr_contains(net, 16, "192.168.20.1".parse().unwrap()));
        assert!(!cidr_contains(net, 16, "192.169.0.1".parse().unwrap()));
        assert!(cidr_contains(net, 0, "8.8.8.8".parse().unwrap()));
        assert!(!cidr_contains(net, 16, "::1".parse().unwrap()));

        let v6: IpAddr = "fd00::".parse().unwrap();
        assert!(cidr_contains(v6, 8, "fd12::1".parse().unwrap()));
    }
}
