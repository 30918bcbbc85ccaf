use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{request::Parts, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use tracing::debug;

use crate::error::AppError;
use crate::security::rate_limiter::RateLimitResult;
use crate::state::AppState;

/// Header carrying the user id verified by the upstream auth layer.
pub const USER_ID_HEADER: &str = "x-user-id";

const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Who is making the request, as far as abuse prevention is concerned.
#[derive(Clone, Debug)]
pub struct SecurityContext {
    pub client_ip: String,
    pub user_id: Option<String>,
}

/// Resolve the client address from the socket, or from the first
/// `X-Forwarded-For` hop when running behind a trusted proxy.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = headers
            .get(FORWARDED_FOR_HEADER)
            .and_then(|h| h.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn user_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Per-address limiter in front of every guarded route. Blacklisted
/// addresses stop here before any window bookkeeping.
pub async fn security_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client_ip = client_ip(req.headers(), peer, state.config.trust_forwarded_for);

    match state.ip_limiter.check_and_record(&client_ip) {
        RateLimitResult::Allowed { .. } => {}
        RateLimitResult::Throttled { retry_after } => {
            debug!(%client_ip, "Request throttled by address limiter");
            return AppError::throttled(retry_after).into_response();
        }
        RateLimitResult::Blocked => return AppError::Blocked.into_response(),
    }

    let security_ctx = SecurityContext {
        user_id: user_id(req.headers()),
        client_ip,
    };
    req.extensions_mut().insert(security_ctx);

    next.run(req).await
}

/// Authenticated user id, required by mutating and per-user routes.
#[derive(Clone, Debug)]
pub struct AuthUser(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<SecurityContext>()
            .and_then(|ctx| ctx.user_id.clone())
            .or_else(|| user_id(&parts.headers))
            .map(AuthUser)
            .ok_or(AppError::Unauthorized)
    }
}
