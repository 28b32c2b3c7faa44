//! Admission control as axum middleware.
//!
//! [`enforce`] runs before the route handler. Allowed requests are passed on
//! untouched; rejected ones are answered with `{"error": "..."}` and the
//! status for their rejection class.
//!
//! Install credential-scoped limiters with `Router::route_layer` so the
//! matched route template is known when the key is derived. Without it the
//! raw request path is used instead.

use axum::{
    extract::{ConnectInfo, MatchedPath, Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::instrument;

use crate::ratelimit::{
    Decision, RateLimiter, Rejection, RequestIdentity, API_KEY_HEADER, USERNAME_HEADER,
};

const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Middleware state: the limiter for one route group.
#[derive(Clone)]
pub struct Admission {
    limiter: Arc<RateLimiter>,
    trust_forwarded_for: bool,
}

impl Admission {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            trust_forwarded_for: false,
        }
    }

    /// Take the caller address from the first `X-Forwarded-For` entry when
    /// it parses as an IP address.
    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

/// Error response body.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: String,
}

impl Rejection {
    /// HTTP status for this rejection class.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Rejection::MissingCredential(_) => StatusCode::BAD_REQUEST,
            Rejection::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Rejection::StoreUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Request attributes the key strategies may read, copied out of the
/// request so it can be handed to the next stage afterwards.
#[derive(Debug)]
struct CallerAttributes {
    peer: Option<IpAddr>,
    api_key: Option<String>,
    username: Option<String>,
    method: Method,
    route: String,
}

impl CallerAttributes {
    fn from_request(request: &Request, trust_forwarded_for: bool) -> Self {
        let headers = request.headers();
        let connected = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let peer = if trust_forwarded_for {
            forwarded_for(headers).or(connected)
        } else {
            connected
        };
        let route = request
            .extensions()
            .get::<MatchedPath>()
            .map(|path| path.as_str())
            .unwrap_or_else(|| request.uri().path());

        Self {
            peer,
            api_key: header_str(headers, API_KEY_HEADER),
            username: header_str(headers, USERNAME_HEADER),
            method: request.method().clone(),
            route: trim_trailing_slash(route).to_string(),
        }
    }

    fn identity(&self) -> RequestIdentity<'_> {
        RequestIdentity {
            peer: self.peer,
            api_key: self.api_key.as_deref(),
            username: self.username.as_deref(),
            method: self.method.as_str(),
            route: &self.route,
        }
    }
}

/// `/a/b/` and `/a/b` name the same route; `/` stays as is.
fn trim_trailing_slash(route: &str) -> &str {
    match route.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get(FORWARDED_FOR_HEADER)?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// Admit or reject the request before it reaches the handler.
#[instrument(
    skip_all,
    fields(
        limiter = %admission.limiter.name(),
        method = %request.method(),
        path = %request.uri().path()
    )
)]
pub async fn enforce(State(admission): State<Admission>, request: Request, next: Next) -> Response {
    let caller = CallerAttributes::from_request(&request, admission.trust_forwarded_for);

    match admission.limiter.admit(&caller.identity()).await {
        Decision::Allow { .. } => next.run(request).await,
        Decision::Reject(rejection) => rejection.into_response(),
    }
}
