// Account manager
// Owns the token store, serializes refreshes per account, and keeps the
// managed project id current

use anyhow::Context;
use chrono::{Duration, Utc};
use reqwest::Client;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use super::discovery;
use super::oauth;
use super::store::{Account, StoreError, TokenStore};
use crate::error::ApiError;

/// Copy of the fields a request needs from the active account. Readers
/// tolerate one refresh cycle of staleness; a 401 retry path refreshes and
/// takes a new snapshot.
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub email: String,
    pub access_token: String,
    pub expires_at: chrono::DateTime<Utc>,
    pub project_id: String,
}

/// Per-account status for the status route. Never carries token material.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AccountStatus {
    pub email: String,
    pub token_expires_at: String,
    pub project_id: Option<String>,
    pub last_refresh: Option<String>,
}

pub struct AuthManager {
    store: RwLock<TokenStore>,
    client: Client,
    token_url: String,
    discovery_url: String,
    /// Refresh this many seconds before the recorded expiry
    refresh_skew: i64,
    /// Per-email guards so concurrent 401s trigger a single refresh call
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Set once project-id re-discovery has completed after startup
    rediscovery_done: AtomicBool,
    refresh_calls: AtomicU64,
}

impl AuthManager {
    pub fn new(store_path: &Path, client: Client) -> Result<Self, ApiError> {
        let store = TokenStore::load(store_path).map_err(|e| match e {
            StoreError::Corrupt(msg) => ApiError::TokenStoreCorrupt(msg),
            StoreError::Io(err) => ApiError::Internal(err.into()),
        })?;

        Ok(Self::from_store(
            store,
            client,
            oauth::TOKEN_URL.to_string(),
            discovery::discovery_url(),
        ))
    }

    fn from_store(
        store: TokenStore,
        client: Client,
        token_url: String,
        discovery_url: String,
    ) -> Self {
        Self {
            store: RwLock::new(store),
            client,
            token_url,
            discovery_url,
            refresh_skew: 60,
            refresh_locks: Mutex::new(HashMap::new()),
            rediscovery_done: AtomicBool::new(false),
            refresh_calls: AtomicU64::new(0),
        }
    }

    /// Test constructor with an in-memory account and overridable endpoints.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn new_for_testing(
        store: TokenStore,
        token_url: String,
        discovery_url: String,
    ) -> Self {
        Self::from_store(store, Client::new(), token_url, discovery_url)
    }

    pub async fn has_account(&self) -> bool {
        !self.store.read().await.is_empty()
    }

    pub async fn account_count(&self) -> usize {
        self.store.read().await.accounts().len()
    }

    /// Snapshot of the active account, refreshing first when the token is
    /// within the skew window of its expiry.
    pub async fn snapshot(&self) -> Result<AccountSnapshot, ApiError> {
        let (email, stale) = {
            let store = self.store.read().await;
            let account = store.first().ok_or_else(|| {
                ApiError::AuthRequired(
                    "no account is logged in; run with --login first".to_string(),
                )
            })?;
            (account.email.clone(), self.is_stale(account))
        };

        if stale {
            self.refresh_account(&email, None).await?;
        }

        self.snapshot_of(&email).await
    }

    /// Refresh after an upstream 401, regardless of the recorded expiry.
    /// `stale_token` is the token the failed request used; when another task
    /// already refreshed past it, no second network call is made.
    pub async fn refresh_after_auth_failure(
        &self,
        email: &str,
        stale_token: &str,
    ) -> Result<AccountSnapshot, ApiError> {
        self.refresh_account(email, Some(stale_token)).await?;
        self.snapshot_of(email).await
    }

    fn is_stale(&self, account: &Account) -> bool {
        Utc::now() + Duration::seconds(self.refresh_skew) >= account.expires_at
    }

    async fn snapshot_of(&self, email: &str) -> Result<AccountSnapshot, ApiError> {
        let (access_token, expires_at, project_id) = {
            let store = self.store.read().await;
            let account = store
                .get(email)
                .ok_or_else(|| ApiError::AuthRequired(format!("account {} not found", email)))?;
            (
                account.access_token.clone(),
                account.expires_at,
                account.project_id.clone(),
            )
        };

        let project_id = match project_id {
            Some(id) => id,
            None => {
                // Should not happen after login; keep the request usable and
                // let re-discovery replace it
                let transient = discovery::transient_project_id();
                self.update_project_id(email, transient.clone()).await?;
                self.rediscovery_done.store(false, Ordering::SeqCst);
                transient
            }
        };

        Ok(AccountSnapshot {
            email: email.to_string(),
            access_token,
            expires_at,
            project_id,
        })
    }

    /// Serialized refresh. With `skip_if_newer_than` set, the refresh is
    /// skipped when the stored token already differs (someone else won the
    /// race while we waited on the per-account lock).
    async fn refresh_account(
        &self,
        email: &str,
        skip_if_newer_than: Option<&str>,
    ) -> Result<(), ApiError> {
        let lock = {
            let mut locks = self.refresh_locks.lock().await;
            locks
                .entry(email.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        // Re-check under the lock: the winner of a concurrent race already
        // refreshed on our behalf
        let refresh_token = {
            let store = self.store.read().await;
            let account = store
                .get(email)
                .ok_or_else(|| ApiError::AuthRequired(format!("account {} not found", email)))?;

            match skip_if_newer_than {
                Some(stale) if account.access_token != stale => return Ok(()),
                None if !self.is_stale(account) => return Ok(()),
                _ => {}
            }
            account.refresh_token.clone()
        };

        tracing::debug!("Refreshing access token for {}", email);
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);

        let token_data =
            oauth::refresh_access_token(&self.client, &self.token_url, &refresh_token)
                .await
                .map_err(|e| ApiError::AuthFailed(format!("token refresh failed: {e:#}")))?;

        let mut store = self.store.write().await;
        if let Some(account) = store.get(email).cloned() {
            let mut updated = account;
            updated.access_token = token_data.access_token;
            updated.expires_at = token_data.expires_at;
            if let Some(refresh) = token_data.refresh_token {
                updated.refresh_token = refresh;
            }
            updated.last_refresh = Some(Utc::now());
            store.upsert(updated);
            store
                .save()
                .context("failed to persist refreshed tokens")
                .map_err(ApiError::Internal)?;
        }

        Ok(())
    }

    /// Re-run project discovery once after the first successful upstream
    /// call, replacing the stored id with whatever discovery returns.
    pub async fn confirm_project_id(&self) {
        if self.rediscovery_done.swap(true, Ordering::SeqCst) {
            return;
        }

        let snapshot = match self.snapshot().await {
            Ok(s) => s,
            Err(_) => {
                self.rediscovery_done.store(false, Ordering::SeqCst);
                return;
            }
        };

        let hint = if snapshot.project_id.starts_with("transient-") {
            None
        } else {
            Some(snapshot.project_id.as_str())
        };

        match discovery::discover_project_id(
            &self.client,
            &self.discovery_url,
            &snapshot.access_token,
            hint,
        )
        .await
        {
            Ok(Some(discovered)) => {
                if discovered != snapshot.project_id {
                    tracing::info!(
                        "Managed project id updated: {} -> {}",
                        snapshot.project_id,
                        discovered
                    );
                    if let Err(e) = self.update_project_id(&snapshot.email, discovered).await {
                        tracing::warn!("Failed to persist discovered project id: {}", e);
                    }
                }
            }
            Ok(None) => {
                tracing::debug!("Project discovery returned no managed project; keeping current");
            }
            Err(e) => {
                tracing::warn!("Project discovery failed, will retry: {}", e);
                self.rediscovery_done.store(false, Ordering::SeqCst);
            }
        }
    }

    async fn update_project_id(&self, email: &str, project_id: String) -> Result<(), ApiError> {
        let mut store = self.store.write().await;
        if let Some(account) = store.get(email).cloned() {
            let mut updated = account;
            updated.project_id = Some(project_id);
            store.upsert(updated);
            store
                .save()
                .context("failed to persist project id")
                .map_err(ApiError::Internal)?;
        }
        Ok(())
    }

    /// Interactive login: PKCE flow, project discovery, persist the account.
    pub async fn login(&self) -> Result<Account, ApiError> {
        let token_data = oauth::login(&self.client)
            .await
            .map_err(|e| ApiError::AuthFailed(format!("login failed: {e:#}")))?;

        let email = token_data
            .email
            .clone()
            .unwrap_or_else(|| "unknown@antigravity.local".to_string());

        let project_id = match discovery::discover_project_id(
            &self.client,
            &self.discovery_url,
            &token_data.access_token,
            None,
        )
        .await
        {
            Ok(Some(id)) => Some(id),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Project discovery at login failed: {}", e);
                None
            }
        };

        let existing_project = {
            let store = self.store.read().await;
            store.get(&email).and_then(|a| a.project_id.clone())
        };

        let account = Account {
            email: email.clone(),
            access_token: token_data.access_token,
            refresh_token: token_data.refresh_token.ok_or_else(|| {
                ApiError::AuthFailed("login response contained no refresh token".to_string())
            })?,
            expires_at: token_data.expires_at,
            project_id: project_id
                .or(existing_project)
                .or_else(|| Some(discovery::transient_project_id())),
            scopes: oauth::SCOPES.iter().map(|s| s.to_string()).collect(),
            created_at: Utc::now(),
            last_refresh: None,
        };

        let mut store = self.store.write().await;
        store.upsert(account.clone());
        store
            .save()
            .context("failed to persist account after login")
            .map_err(ApiError::Internal)?;

        Ok(account)
    }

    pub async fn accounts_summary(&self) -> Vec<AccountStatus> {
        let store = self.store.read().await;
        store
            .accounts()
            .iter()
            .map(|a| AccountStatus {
                email: a.email.clone(),
                token_expires_at: a.expires_at.to_rfc3339(),
                project_id: a.project_id.clone(),
                last_refresh: a.last_refresh.map(|t| t.to_rfc3339()),
            })
            .collect()
    }

    /// Number of refresh network calls made so far.
    pub fn refresh_call_count(&self) -> u64 {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}
