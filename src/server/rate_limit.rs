use super::response::too_many_requests;
use crate::config::RateLimitSettings;
use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{
    clock::{Clock, DefaultClock},
    DefaultKeyedRateLimiter, Quota, RateLimiter,
};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    num::NonZeroU32,
    sync::Arc,
    time::Duration,
};
use tracing::{debug, warn};

/// Per client IP limit on sandbox operations.
///
/// A client may burst up to `max_requests` and then regains one request every
/// `window / max_requests`.
#[derive(Clone)]
pub struct CreationLimiter {
    limiter: Arc<DefaultKeyedRateLimiter<IpAddr>>,
    clock: DefaultClock,
}

impl CreationLimiter {
    pub fn new(settings: &RateLimitSettings) -> Self {
        let burst = NonZeroU32::new(settings.max_requests).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(settings.window / burst.get())
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst);

        debug!(
            max_requests = burst.get(),
            window_secs = settings.window.as_secs(),
            "Created sandbox rate limiter"
        );

        Self {
            limiter: Arc::new(RateLimiter::keyed(quota)),
            clock: DefaultClock::default(),
        }
    }

    /// `Err` carries how long the client has to wait
    pub fn check(&self, ip: IpAddr) -> Result<(), Duration> {
        self.limiter
            .check_key(&ip)
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }
}

pub async fn enforce<B>(
    State(limiter): State<CreationLimiter>,
    request: Request<B>,
    next: Next<B>,
) -> Response {
    let ip = client_ip(&request);

    match limiter.check(ip) {
        Ok(()) => next.run(request).await,
        Err(wait) => {
            warn!(client_ip = %ip, retry_after_secs = wait.as_secs(), "Rate limit exceeded");
            let mut response = too_many_requests().into_response();
            if let Ok(value) = HeaderValue::from_str(&wait.as_secs().max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
    }
}

/// Peer address of the connection; requests without one share a bucket
fn client_ip<B>(request: &Request<B>) -> IpAddr {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}
