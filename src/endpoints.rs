//! Upstream endpoint pool with per-endpoint rate-limit state.
//!
//! Endpoints are tried in a fixed order; each tracks when it becomes usable
//! again and why it was last marked. Selection returns the first endpoint
//! whose backoff has elapsed, or the soonest-recovering one so callers can
//! produce a 429 with an accurate Retry-After.

use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Ordered upstream hostnames. Discovery is pinned to the production host
/// regardless of this order because the sandbox hosts return inconsistent
/// project metadata.
pub const ENDPOINTS: [&str; 3] = [
    "daily-cloudcode-pa.sandbox.googleapis.com",
    "autopush-cloudcode-pa.sandbox.googleapis.com",
    "cloudcode-pa.googleapis.com",
];

pub const PRODUCTION_ENDPOINT: &str = "cloudcode-pa.googleapis.com";

const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    Ok,
    RateLimited,
    AuthFailed,
    Unavailable,
}

#[derive(Debug)]
struct EndpointState {
    host: &'static str,
    rate_limited_until: Option<Instant>,
    consecutive_failures: u32,
    last_error: EndpointStatus,
}

impl EndpointState {
    fn new(host: &'static str) -> Self {
        Self {
            host,
            rate_limited_until: None,
            consecutive_failures: 0,
            last_error: EndpointStatus::Ok,
        }
    }

    fn available_at(&self, now: Instant) -> Duration {
        match self.rate_limited_until {
            Some(until) if until > now => until - now,
            _ => Duration::ZERO,
        }
    }
}

/// A selected endpoint. When `available` is false the caller must treat the
/// request as rate limited and surface `retry_after`.
#[derive(Debug, Clone)]
pub struct PickedEndpoint {
    pub index: usize,
    pub host: &'static str,
    pub available: bool,
    pub retry_after: Duration,
}

impl PickedEndpoint {
    pub fn url(&self, method: &str, streaming: bool) -> String {
        if streaming {
            format!("https://{}/v1internal:{}?alt=sse", self.host, method)
        } else {
            format!("https://{}/v1internal:{}", self.host, method)
        }
    }
}

/// Snapshot of one endpoint's state for the status route.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSummary {
    pub host: &'static str,
    pub status: EndpointStatus,
    pub retry_after_secs: u64,
}

pub struct EndpointPool {
    states: Mutex<Vec<EndpointState>>,
}

impl Default for EndpointPool {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointPool {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(ENDPOINTS.iter().map(|h| EndpointState::new(h)).collect()),
        }
    }

    /// First endpoint whose backoff has elapsed, in fixed order. Falls back
    /// to the soonest-recovering endpoint with `available: false`.
    pub fn pick(&self) -> PickedEndpoint {
        let states = self.states.lock().unwrap();
        let now = Instant::now();

        for (index, state) in states.iter().enumerate() {
            if state.available_at(now).is_zero() {
                return PickedEndpoint {
                    index,
                    host: state.host,
                    available: true,
                    retry_after: Duration::ZERO,
                };
            }
        }

        let (index, state) = states
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.available_at(now))
            .expect("endpoint list is never empty");

        PickedEndpoint {
            index,
            host: state.host,
            available: false,
            retry_after: state.available_at(now),
        }
    }

    /// Any endpoint currently usable?
    pub fn available(&self) -> bool {
        let states = self.states.lock().unwrap();
        let now = Instant::now();
        states.iter().any(|s| s.available_at(now).is_zero())
    }

    pub fn mark_success(&self, index: usize) {
        let mut states = self.states.lock().unwrap();
        if let Some(state) = states.get_mut(index) {
            state.rate_limited_until = None;
            state.consecutive_failures = 0;
            state.last_error = EndpointStatus::Ok;
        }
    }

    /// Mark an endpoint rate limited. Uses the given delay when the upstream
    /// provided one, otherwise the endpoint's own exponential backoff.
    /// Returns the applied delay.
    pub fn mark_rate_limited(&self, index: usize, retry_after: Option<Duration>) -> Duration {
        self.mark(index, EndpointStatus::RateLimited, retry_after)
    }

    pub fn mark_auth_failed(&self, index: usize) -> Duration {
        self.mark(index, EndpointStatus::AuthFailed, None)
    }

    pub fn mark_unavailable(&self, index: usize) -> Duration {
        self.mark(index, EndpointStatus::Unavailable, None)
    }

    fn mark(
        &self,
        index: usize,
        status: EndpointStatus,
        retry_after: Option<Duration>,
    ) -> Duration {
        let mut states = self.states.lock().unwrap();
        let Some(state) = states.get_mut(index) else {
            return Duration::ZERO;
        };

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let delay = retry_after.unwrap_or_else(|| backoff_delay(state.consecutive_failures));
        state.rate_limited_until = Some(Instant::now() + delay);
        state.last_error = status;
        delay
    }

    pub fn summary(&self) -> Vec<EndpointSummary> {
        let states = self.states.lock().unwrap();
        let now = Instant::now();
        states
            .iter()
            .map(|s| EndpointSummary {
                host: s.host,
                status: s.last_error,
                retry_after_secs: s.available_at(now).as_secs(),
            })
            .collect()
    }
}

/// Capped exponential backoff: 2s, 4s, 8s ... 60s.
fn backoff_delay(consecutive_failures: u32) -> Duration {
    let exp = consecutive_failures.saturating_sub(1).min(16);
    let delay = BACKOFF_BASE.saturating_mul(2u32.saturating_pow(exp));
    delay.min(BACKOFF_CAP)
}

// ==================================================================================================
// Retry-After extraction
// ==================================================================================================

/// Delay hint priority: Retry-After header, then a retryDelay in the error
/// body. Returns None when the upstream gave no usable hint.
pub fn parse_retry_after(headers: &reqwest::header::HeaderMap, body: &str) -> Option<Duration> {
    if let Some(value) = headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
    {
        if let Ok(secs) = value.trim().parse::<u64>() {
            return Some(Duration::from_secs(secs));
        }
    }

    let parsed: serde_json::Value = serde_json::from_str(body).ok()?;
    find_retry_delay(&parsed)
}

/// Depth-first search for a `retryDelay` value. Google error bodies carry it
/// either as a duration string ("3s", "2.5s") or a `{seconds, nanos}` object.
fn find_retry_delay(value: &serde_json::Value) -> Option<Duration> {
    match value {
        serde_json::Value::Object(map) => {
            if let Some(delay) = map.get("retryDelay") {
                if let Some(parsed) = parse_delay_value(delay) {
                    return Some(parsed);
                }
            }
            map.values().find_map(find_retry_delay)
        }
        serde_json::Value::Array(items) => items.iter().find_map(find_retry_delay),
        _ => None,
    }
}

fn parse_delay_value(value: &serde_json::Value) -> Option<Duration> {
    match value {
        serde_json::Value::String(s) => {
            let trimmed = s.trim().trim_end_matches('s');
            trimmed
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite() && *v >= 0.0)
                .map(Duration::from_secs_f64)
        }
        serde_json::Value::Number(n) => n
            .as_f64()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(Duration::from_secs_f64),
        serde_json::Value::Object(map) => {
            let seconds = map.get("seconds").and_then(|v| {
                v.as_u64()
                    .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
            })?;
            Some(Duration::from_secs(seconds))
        }
        _ => None,
    }
}
