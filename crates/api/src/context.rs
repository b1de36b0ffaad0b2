//! Per-request context derived from the HTTP request.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::async_trait;
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::HeaderMap;
use axum::http::header::USER_AGENT;
use axum::http::request::Parts;

use snipstash_auth::{ClientMetadata, RequestContext};

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Extracts a [`RequestContext`] carrying the caller's client metadata.
///
/// The client ip is the first `X-Forwarded-For` hop when present, otherwise
/// the socket peer (only known when served with connect info).
#[derive(Debug, Clone)]
pub struct ApiContext(pub RequestContext);

#[async_trait]
impl<S> FromRequestParts<S> for ApiContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let metadata = client_metadata(&parts.headers, peer);
        Ok(Self(RequestContext::new().with_metadata(metadata)))
    }
}

pub fn client_metadata(headers: &HeaderMap, peer: Option<SocketAddr>) -> ClientMetadata {
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let forwarded = headers
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let client_ip = match (forwarded, peer) {
        (Some(ip), _) => ip.to_string(),
        (None, Some(addr)) => addr.ip().to_string(),
        (None, None) => String::new(),
    };

    ClientMetadata {
        user_agent,
        client_ip,
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn forwarded_for_wins_over_peer() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("curl/8.0"));
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.7, 10.0.0.1"));

        let meta = client_metadata(&headers, Some("127.0.0.1:5000".parse().unwrap()));
        assert_eq!(meta.user_agent, "curl/8.0");
        assert_eq!(meta.client_ip, "203.0.113.7");
    }

    #[test]
    fn peer_address_is_the_fallback() {
        let meta = client_metadata(&HeaderMap::new(), Some("192.0.2.1:443".parse().unwrap()));
        assert_eq!(meta.user_agent, "");
        assert_eq!(meta.client_ip, "192.0.2.1");
    }

    #[test]
    fn nothing_known_yields_empty_metadata() {
        assert_eq!(client_metadata(&HeaderMap::new(), None), ClientMetadata::default());
    }
}
