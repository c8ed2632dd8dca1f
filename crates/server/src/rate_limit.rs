//! Rate limiting middleware for HTTP requests.

use std::{
    fmt::Display,
    future::Future,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use axum::{
    body::Body,
    extract::{ConnectInfo, MatchedPath},
};
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode, header::CONTENT_TYPE, request::Parts};
use rate_limit::{Admission, ClientIp, LimitingState, RateLimitManager};
use tower::Layer;

/// Applies admission and settlement around every request of the wrapped router.
#[derive(Clone)]
pub struct RateLimitLayer(Arc<RateLimitManager>);

impl RateLimitLayer {
    /// Creates the layer from a ready manager.
    pub fn new(manager: Arc<RateLimitManager>) -> Self {
        Self(manager)
    }
}

impl<Service> Layer<Service> for RateLimitLayer
where
    Service: Send + Clone,
{
    type Service = RateLimitService<Service>;

    fn layer(&self, next: Service) -> Self::Service {
        RateLimitService {
            next,
            manager: self.0.clone(),
        }
    }
}

/// The service produced by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimitService<Service> {
    next: Service,
    manager: Arc<RateLimitManager>,
}

impl<Service, ReqBody> tower::Service<Request<ReqBody>> for RateLimitService<Service>
where
    Service: tower::Service<Request<ReqBody>, Response = Response<Body>> + Send + Clone + 'static,
    Service::Future: Send,
    Service::Error: Display + 'static,
    ReqBody: http_body::Body + Send + 'static,
{
    type Response = http::Response<Body>;
    type Error = Service::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.next.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let mut next = self.next.clone();
        let manager = self.manager.clone();

        Box::pin(async move {
            if let Some(ip) = extract_client_ip(&req) {
                req.extensions_mut().insert(ClientIp(ip));
            }

            let (mut parts, body) = req.into_parts();

            let route = manager.route(route_path(&parts)).cloned();
            let admission = manager.admit(&mut parts, route.as_ref()).await;

            // The parts move into the handler, settlement runs afterwards.
            let state = parts.extensions.get::<LimitingState>().cloned();

            let mut response = match admission {
                Admission::Limited(rejection) => {
                    log::debug!("Request rejected by bucket '{}'", rejection.bucket);
                    rejected(StatusCode::TOO_MANY_REQUESTS, rejection.headers())
                }
                Admission::Refused { status, error } => {
                    log::debug!("Request refused after a rate limit check timed out: {error}");
                    rejected(status, HeaderMap::new())
                }
                Admission::Skipped | Admission::Passed | Admission::FailedOpen(_) => {
                    next.call(Request::from_parts(parts, body)).await?
                }
            };

            let status = response.status();
            manager.settle(state.as_ref(), status, response.headers_mut()).await;

            Ok(response)
        })
    }
}

/// The configured route key of the request: the matched axum route, or the raw path.
fn route_path(parts: &Parts) -> &str {
    match parts.extensions.get::<MatchedPath>() {
        Some(matched) => matched.as_str(),
        None => parts.uri.path(),
    }
}

fn rejected(status: StatusCode, headers: HeaderMap) -> Response<Body> {
    let message = match status {
        StatusCode::TOO_MANY_REQUESTS => "Rate limit exceeded",
        other => other.canonical_reason().unwrap_or("Service unavailable"),
    };

    let mut response = Response::new(Body::from(message));

    *response.status_mut() = status;
    response.headers_mut().extend(headers);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));

    response
}

/// Extract client IP address from request.
fn extract_client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    // First try to get from ConnectInfo (direct connection)
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return Some(connect_info.0.ip());
    }

    // Try X-Forwarded-For header (for proxied requests)
    if let Some(forwarded_for) = req.headers().get("x-forwarded-for") {
        let value = forwarded_for.to_str().ok()?;

        // Take the first IP in the chain
        let ip_str = value.split(',').next()?;

        return ip_str.trim().parse::<IpAddr>().ok();
    }

    // Try X-Real-IP header
    let ip_str = req.headers().get("x-real-ip")?.to_str().ok()?;

    ip_str.parse::<IpAddr>().ok()
}
