// Host guard and CORS middleware

use axum::{body::Body, extract::State, http::Request, middleware::Next, response::Response};
use tower_http::cors::{Any, CorsLayer};

use crate::config::is_loopback_host;
use crate::error::ApiError;
use crate::routes::AppState;

/// Reject requests whose Host header names anything other than loopback.
/// The listener binds loopback by default; this guard closes the DNS-rebind
/// hole where a hostile page resolves its own name to 127.0.0.1.
pub async fn host_guard(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if state.config.allow_remote {
        return Ok(next.run(request).await);
    }

    let host = request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if host_is_loopback(host) {
        return Ok(next.run(request).await);
    }

    tracing::warn!("Rejected request with non-loopback Host header: {}", host);
    Err(ApiError::Validation(format!(
        "host \"{}\" is not loopback; set ALLOW_REMOTE=true to serve remote clients",
        host
    )))
}

/// Host header values carry an optional port; IPv6 literals are bracketed.
fn host_is_loopback(host: &str) -> bool {
    if host.is_empty() {
        return false;
    }
    let without_port = if let Some(rest) = host.strip_prefix('[') {
        // [::1]:8089
        rest.split(']').next().unwrap_or(rest)
    } else {
        host.rsplit_once(':')
            .map(|(name, _)| name)
            .unwrap_or(host)
    };
    is_loopback_host(without_port)
}

/// CORS layer allowing local tooling to call the gateway from any origin.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_is_loopback() {
        assert!(host_is_loopback("127.0.0.1"));
        assert!(host_is_loopback("127.0.0.1:8089"));
        assert!(host_is_loopback("localhost:8089"));
        assert!(host_is_loopback("[::1]:8089"));
        assert!(!host_is_loopback("evil.example.com"));
        assert!(!host_is_loopback("evil.example.com:8089"));
        assert!(!host_is_loopback("192.168.0.12:8089"));
        assert!(!host_is_loopback(""));
    }
}
