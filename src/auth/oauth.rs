//! Google OAuth 2.0 authorization-code flow with PKCE.
//!
//! Implements login against Google's Cloud Code Assist service: builds the
//! authorization URL, waits for the loopback redirect, exchanges the code
//! plus verifier for tokens, and refreshes access tokens. The account email
//! is read from the `id_token` payload without verifying its signature; it
//! is a display label, not an authorization input.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Google OAuth 2.0 authorization URL.
pub const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
/// Google OAuth 2.0 token exchange URL.
pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// OAuth client credentials for the Antigravity integration. These are
/// public identifiers embedded in the open-source extension, not secrets.
pub const CLIENT_ID: &str =
    "1071006060591-tmhssin2h21lcre235vtolojh4g403ep.apps.googleusercontent.com";
pub const CLIENT_SECRET: &str = "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";

/// Fixed loopback callback port and redirect URI.
pub const CALLBACK_PORT: u16 = 51121;
pub const REDIRECT_URI: &str = "http://localhost:51121/oauth-callback";

/// Scopes requested at login.
pub const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/cloud-platform",
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/userinfo.profile",
    "https://www.googleapis.com/auth/cclog",
    "https://www.googleapis.com/auth/experimentsandconfigs",
];

/// Timeout for waiting on the browser redirect (seconds).
const CALLBACK_TIMEOUT_SECS: u64 = 300;

// ==================================================================================================
// PKCE
// ==================================================================================================

/// PKCE verifier/challenge pair plus the CSRF state value.
#[derive(Debug, Clone)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
    pub state: String,
}

impl Pkce {
    /// 64 random bytes, base64url encoded, form the verifier; the challenge
    /// is its SHA-256 hash, also base64url encoded (S256).
    pub fn generate() -> Self {
        let mut verifier_bytes = [0u8; 64];
        rand::thread_rng().fill_bytes(&mut verifier_bytes);
        let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

        let challenge = Self::compute_challenge(&verifier);

        let mut state_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut state_bytes);
        let state = URL_SAFE_NO_PAD.encode(state_bytes);

        Self {
            verifier,
            challenge,
            state,
        }
    }

    fn compute_challenge(verifier: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }

    #[cfg(test)]
    pub fn verify(verifier: &str, challenge: &str) -> bool {
        Self::compute_challenge(verifier) == challenge
    }
}

/// Build the authorization URL for the browser.
pub fn build_authorize_url(pkce: &Pkce) -> String {
    let mut url = url::Url::parse(AUTH_URL).expect("fixed auth URL is valid");
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", CLIENT_ID)
        .append_pair("redirect_uri", REDIRECT_URI)
        .append_pair("scope", &SCOPES.join(" "))
        .append_pair("code_challenge", &pkce.challenge)
        .append_pair("code_challenge_method", "S256")
        .append_pair("state", &pkce.state)
        .append_pair("access_type", "offline")
        .append_pair("prompt", "consent");
    url.to_string()
}

// ==================================================================================================
// Token responses
// ==================================================================================================

#[derive(Debug, serde::Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub id_token: Option<String>,
}

/// Result of a successful login or refresh.
#[derive(Debug, Clone)]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub email: Option<String>,
}

fn expires_at_from(expires_in: Option<u64>) -> DateTime<Utc> {
    // 60s safety margin against clock skew and in-flight latency
    let secs = expires_in.unwrap_or(3600).saturating_sub(60);
    Utc::now() + Duration::seconds(secs as i64)
}

impl TokenData {
    fn from_response(resp: TokenResponse, fallback_refresh: Option<&str>) -> Self {
        let email = resp.id_token.as_deref().and_then(email_from_id_token);
        Self {
            access_token: resp.access_token,
            refresh_token: resp
                .refresh_token
                .or_else(|| fallback_refresh.map(String::from)),
            expires_at: expires_at_from(resp.expires_in),
            email,
        }
    }
}

// ==================================================================================================
// Code exchange and refresh
// ==================================================================================================

/// Exchange an authorization code plus PKCE verifier for tokens.
pub async fn exchange_code(
    client: &Client,
    token_url: &str,
    code: &str,
    verifier: &str,
) -> Result<TokenData> {
    let form = [
        ("grant_type", "authorization_code"),
        ("client_id", CLIENT_ID),
        ("client_secret", CLIENT_SECRET),
        ("code", code),
        ("redirect_uri", REDIRECT_URI),
        ("code_verifier", verifier),
    ];

    let response = client
        .post(token_url)
        .form(&form)
        .send()
        .await
        .context("failed to send token exchange request")?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("token exchange failed: {} - {}", status, body);
    }

    let parsed: TokenResponse = response
        .json()
        .await
        .context("failed to parse token exchange response")?;

    if parsed.access_token.is_empty() {
        bail!("token exchange response contains no access_token");
    }

    Ok(TokenData::from_response(parsed, None))
}

/// Refresh an access token using a refresh token.
pub async fn refresh_access_token(
    client: &Client,
    token_url: &str,
    refresh_token: &str,
) -> Result<TokenData> {
    let form = [
        ("grant_type", "refresh_token"),
        ("client_id", CLIENT_ID),
        ("client_secret", CLIENT_SECRET),
        ("refresh_token", refresh_token),
    ];

    let response = client
        .post(token_url)
        .form(&form)
        .send()
        .await
        .context("failed to send refresh request")?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("token refresh failed: {} - {}", status, body);
    }

    let parsed: TokenResponse = response
        .json()
        .await
        .context("failed to parse refresh response")?;

    if parsed.access_token.is_empty() {
        bail!("refresh response contains no access_token");
    }

    Ok(TokenData::from_response(parsed, Some(refresh_token)))
}

// ==================================================================================================
// JWT claims (unverified)
// ==================================================================================================

/// Decode the payload JSON from a JWT without validating the signature.
pub fn decode_jwt_claims(jwt: &str) -> Option<serde_json::Value> {
    let payload_b64 = jwt.split('.').nth(1)?;

    // Most JWTs are base64url without padding; tolerate padded ones too
    let bytes = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(payload_b64))
        .ok()?;

    serde_json::from_slice(&bytes).ok()
}

pub fn email_from_id_token(id_token: &str) -> Option<String> {
    decode_jwt_claims(id_token)?
        .get("email")
        .and_then(|v| v.as_str())
        .map(String::from)
}

// ==================================================================================================
// Loopback callback
// ==================================================================================================

#[derive(Debug)]
pub struct CallbackParams {
    pub code: String,
    pub state: Option<String>,
}

/// Bind the fixed callback port and wait for the browser redirect, answering
/// the request with a minimal HTML page.
pub async fn wait_for_callback() -> Result<CallbackParams> {
    let listener = TcpListener::bind(("127.0.0.1", CALLBACK_PORT))
        .await
        .with_context(|| format!("failed to bind callback port {}", CALLBACK_PORT))?;

    let accept = tokio::time::timeout(
        std::time::Duration::from_secs(CALLBACK_TIMEOUT_SECS),
        listener.accept(),
    );

    let (mut socket, _) = accept
        .await
        .context("timed out waiting for OAuth redirect")?
        .context("failed to accept OAuth redirect connection")?;

    let mut buf = vec![0u8; 8192];
    let n = socket
        .read(&mut buf)
        .await
        .context("failed to read OAuth redirect request")?;
    let request = String::from_utf8_lossy(&buf[..n]);

    let params = parse_callback_request(&request)?;

    let body = "<html><body><h3>Login complete.</h3>You can close this tab and return to the terminal.</body></html>";
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = socket.write_all(response.as_bytes()).await;

    Ok(params)
}

/// Pull `code` and `state` out of the redirect request line.
fn parse_callback_request(request: &str) -> Result<CallbackParams> {
    let request_line = request.lines().next().unwrap_or_default();
    let path = request_line
        .split_whitespace()
        .nth(1)
        .context("malformed OAuth redirect request")?;

    let query = path.split_once('?').map(|(_, q)| q).unwrap_or_default();
    let params: HashMap<String, String> =
        url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();

    if let Some(err) = params.get("error") {
        bail!("authorization was denied: {}", err);
    }

    let code = params
        .get("code")
        .filter(|c| !c.is_empty())
        .context("OAuth redirect is missing the authorization code")?
        .clone();

    Ok(CallbackParams {
        code,
        state: params.get("state").cloned(),
    })
}

/// Run the full interactive login flow: print the URL, wait for the
/// redirect, verify the state, and exchange the code for tokens.
pub async fn login(client: &Client) -> Result<TokenData> {
    let pkce = Pkce::generate();
    let auth_url = build_authorize_url(&pkce);

    println!();
    println!("  Open the following URL in your browser to log in:");
    println!();
    println!("  {auth_url}");
    println!();
    println!("  Waiting for authorization...");

    let callback = wait_for_callback().await?;

    match callback.state.as_deref() {
        Some(state) if state == pkce.state => {}
        _ => bail!("OAuth state mismatch; aborting login"),
    }

    exchange_code(client, TOKEN_URL, &callback.code, &pkce.verifier).await
}
