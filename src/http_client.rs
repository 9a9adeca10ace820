// Upstream HTTP client
// Issues generate-content calls across the endpoint pool with retry,
// failover and refresh-on-401 handling

use reqwest::{Client, Response};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::AuthManager;
use crate::config::Config;
use crate::converters::request::build_headers;
use crate::endpoints::{parse_retry_after, EndpointPool};
use crate::error::ApiError;
use crate::models::antigravity::AntigravityRequestBody;

pub struct UpstreamClient {
    client: Client,
    auth: Arc<AuthManager>,
    pool: Arc<EndpointPool>,
    max_retries: u32,
    /// Overrides the pool's hostnames; used by tests to point at a fake
    base_url_override: Option<String>,
}

impl UpstreamClient {
    pub fn new(
        auth: Arc<AuthManager>,
        pool: Arc<EndpointPool>,
        config: &Config,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout))
            .timeout(Duration::from_millis(config.request_deadline_ms))
            .build()
            .map_err(|e| ApiError::Internal(anyhow::anyhow!("failed to build client: {e}")))?;

        Ok(Self {
            client,
            auth,
            pool,
            max_retries: config.upstream_max_retries,
            base_url_override: None,
        })
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url_override = Some(base_url);
        self
    }

    pub fn pool(&self) -> &EndpointPool {
        &self.pool
    }

    fn url_for(&self, picked: &crate::endpoints::PickedEndpoint, streaming: bool) -> String {
        let method = if streaming {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        match &self.base_url_override {
            Some(base) => {
                if streaming {
                    format!("{}/v1internal:{}?alt=sse", base, method)
                } else {
                    format!("{}/v1internal:{}", base, method)
                }
            }
            None => picked.url(method, streaming),
        }
    }

    /// Issue one generate-content call, walking the endpoint pool.
    ///
    /// Policy: 429 marks the endpoint and moves on immediately; 401 marks,
    /// refreshes once and retries; 5xx and transport errors burn one of the
    /// bounded retry attempts with the endpoint's backoff. Returns the
    /// response with its status already verified as success.
    pub async fn call(
        &self,
        body: &AntigravityRequestBody,
        thinking: bool,
        streaming: bool,
    ) -> Result<Response, ApiError> {
        let mut snapshot = self.auth.snapshot().await?;
        let mut server_failures = 0u32;
        let mut refreshed_once = false;
        let mut last_error: Option<ApiError> = None;

        loop {
            let picked = self.pool.pick();
            if !picked.available {
                // Pool exhausted. Surface the last upstream failure when the
                // walk was ended by server errors, a rate limit otherwise.
                return Err(match last_error.take() {
                    Some(err @ ApiError::Upstream { .. }) => err,
                    Some(err @ ApiError::EndpointUnavailable(_)) => err,
                    _ => ApiError::RateLimited {
                        message: "all upstream endpoints are rate limited".to_string(),
                        retry_after: Some(picked.retry_after.as_secs().max(1)),
                    },
                });
            }

            // The snapshot's project id rides in the body; keep them in sync
            let mut body = body.clone();
            body.project = snapshot.project_id.clone();

            let url = self.url_for(&picked, streaming);
            let headers = build_headers(&snapshot.access_token, thinking, streaming);

            tracing::debug!(
                "Upstream call: {} (attempt {}, endpoint {})",
                url,
                server_failures + 1,
                picked.host
            );

            let result = self
                .client
                .post(&url)
                .headers(headers)
                .json(&body)
                .send()
                .await;

            let response = match result {
                Ok(r) => r,
                Err(e) => {
                    self.pool.mark_unavailable(picked.index);
                    last_error = Some(ApiError::EndpointUnavailable(e.to_string()));
                    server_failures += 1;
                    if server_failures > self.max_retries {
                        return Err(last_error.unwrap());
                    }
                    continue;
                }
            };

            let status = response.status();

            if status.is_success() {
                self.pool.mark_success(picked.index);
                let auth = self.auth.clone();
                tokio::spawn(async move { auth.confirm_project_id().await });
                return Ok(response);
            }

            match status.as_u16() {
                429 => {
                    let headers = response.headers().clone();
                    let text = response.text().await.unwrap_or_default();
                    let delay = parse_retry_after(&headers, &text);
                    let applied = self.pool.mark_rate_limited(picked.index, delay);
                    tracing::warn!(
                        "Endpoint {} rate limited for {:?}",
                        picked.host,
                        applied
                    );
                    last_error = Some(ApiError::RateLimited {
                        message: "upstream rate limited".to_string(),
                        retry_after: Some(applied.as_secs().max(1)),
                    });
                    // Next available endpoint is tried immediately; pick()
                    // reports the soonest recovery once all are limited
                    continue;
                }
                401 => {
                    self.pool.mark_auth_failed(picked.index);
                    if refreshed_once {
                        return Err(ApiError::AuthFailed(
                            "upstream rejected credentials after refresh".to_string(),
                        ));
                    }
                    refreshed_once = true;
                    tracing::warn!("Upstream 401, refreshing token and retrying once");
                    snapshot = self
                        .auth
                        .refresh_after_auth_failure(&snapshot.email, &snapshot.access_token)
                        .await?;
                    continue;
                }
                500..=599 => {
                    let text = response.text().await.unwrap_or_default();
                    self.pool.mark_unavailable(picked.index);
                    server_failures += 1;
                    tracing::warn!(
                        "Upstream {} from {} (attempt {}/{})",
                        status,
                        picked.host,
                        server_failures,
                        self.max_retries
                    );
                    last_error = Some(ApiError::Upstream {
                        status: status.as_u16(),
                        message: text,
                    });
                    if server_failures > self.max_retries {
                        return Err(last_error.unwrap());
                    }
                    continue;
                }
                _ => {
                    let text = response.text().await.unwrap_or_default();
                    return Err(ApiError::Upstream {
                        status: status.as_u16(),
                        message: text,
                    });
                }
            }
        }
    }
}
