use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{clock::DefaultClock, state::keyed::DefaultKeyedStateStore, Quota, RateLimiter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::warn;

use teamserver_core::TeamError;

use crate::api::ApiError;

type KeyedLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

/// Per-client-IP request budget for the public and session-authenticated
/// surface.
#[derive(Clone)]
pub struct ClientRateLimiter {
    limiter: Option<Arc<KeyedLimiter>>,
    trust_forwarded_for: bool,
}

impl ClientRateLimiter {
    /// `per_minute == 0` disables limiting.
    pub fn new(per_minute: u32, trust_forwarded_for: bool) -> Self {
        let limiter = NonZeroU32::new(per_minute)
            .map(|n| Arc::new(RateLimiter::keyed(Quota::per_minute(n))));
        Self {
            limiter,
            trust_forwarded_for,
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, false)
    }

    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }

    pub fn check(&self, ip: IpAddr) -> Result<(), TeamError> {
        match &self.limiter {
            Some(limiter) => limiter.check_key(&ip).map_err(|_| TeamError::RateLimited),
            None => Ok(()),
        }
    }

    pub fn client_ip(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
        client_ip(headers, peer, self.trust_forwarded_for)
    }

    /// Forgets clients whose budget has fully refilled and returns how many
    /// addresses are still tracked.
    pub fn retain_recent(&self) -> usize {
        match &self.limiter {
            Some(limiter) => {
                limiter.retain_recent();
                limiter.shrink_to_fit();
                limiter.len()
            }
            None => 0,
        }
    }
}

/// Resolves the caller's address: the first `X-Forwarded-For` hop when the
/// proxy is trusted, otherwise the socket peer.
pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded_for: bool,
) -> Option<IpAddr> {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.split(',').next())
            .and_then(|s| s.trim().parse::<IpAddr>().ok());
        if forwarded.is_some() {
            return forwarded;
        }
    }
    peer.map(|addr| addr.ip())
}

/// Runs ahead of authentication on `/api/join` and every session route.
pub async fn rate_limit_middleware(
    State(limiter): State<ClientRateLimiter>,
    request: Request,
    next: Next,
) -> Response {
    if !limiter.is_enabled() {
        return next.run(request).await;
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    // Callers without a resolvable address share one bucket
    let ip = limiter
        .client_ip(request.headers(), peer)
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    match limiter.check(ip) {
        Ok(()) => next.run(request).await,
        Err(e) => {
            warn!(%ip, path = %request.uri().path(), "rate limit exceeded");
            ApiError::from(e).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_limit_applies_per_ip() {
        let limiter = ClientRateLimiter::new(3, false);
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        for _ in 0..3 {
            assert!(limiter.check(a).is_ok());
        }
        assert!(matches!(limiter.check(a), Err(TeamError::RateLimited)));
        assert!(limiter.check(b).is_ok());
    }

    #[test]
    fn test_retain_recent_keeps_throttled_clients() {
        let limiter = ClientRateLimiter::new(1, false);
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(limiter.check(a).is_ok());
        assert!(limiter.check(b).is_ok());

        // Both budgets are still draining, so neither is forgotten
        assert_eq!(limiter.retain_recent(), 2);
        assert!(matches!(limiter.check(a), Err(TeamError::RateLimited)));

        assert_eq!(ClientRateLimiter::disabled().retain_recent(), 0);
    }

    #[test]
    fn test_zero_disables() {
        let limiter = ClientRateLimiter::new(0, false);
        assert!(!limiter.is_enabled());
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        for _ in 0..1000 {
            assert!(limiter.check(ip).is_ok());
        }
    }

    #[test]
    fn test_forwarded_for_only_when_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        let peer: SocketAddr = "192.0.2.1:5000".parse().unwrap();

        assert_eq!(
            client_ip(&headers, Some(peer), true),
            Some("203.0.113.9".parse().unwrap())
        );
        assert_eq!(
            client_ip(&headers, Some(peer), false),
            Some("192.0.2.1".parse().unwrap())
        );
        assert_eq!(client_ip(&HeaderMap::new(), None, true), None);
    }
}
