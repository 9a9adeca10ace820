// Token store
// Persists OAuth accounts as a single JSON document with atomic writes

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// One logged-in Google account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub email: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_refresh: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StoreDocument {
    accounts: Vec<Account>,
}

/// Errors that keep the distinction between "no store yet" and "store broken";
/// the latter is fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("token store corrupt: {0}")]
    Corrupt(String),
    #[error("token store io error: {0}")]
    Io(#[from] std::io::Error),
}

/// In-memory view of the on-disk account list. At most one account per email.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
    accounts: Vec<Account>,
}

impl TokenStore {
    /// Load the store, treating a missing file as empty and an unparseable
    /// file as corrupt.
    pub fn load(path: &Path) -> std::result::Result<Self, StoreError> {
        if !path.exists() {
            return Ok(Self {
                path: path.to_path_buf(),
                accounts: Vec::new(),
            });
        }

        let raw = fs::read_to_string(path)?;
        let doc: StoreDocument = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Corrupt(format!("{}: {}", path.display(), e)))?;

        Ok(Self {
            path: path.to_path_buf(),
            accounts: doc.accounts,
        })
    }

    /// Write the store atomically: temp file in the same directory, fsync,
    /// rename over the canonical path. Owner-only permissions throughout.
    pub fn save(&self) -> Result<()> {
        let parent = self
            .path
            .parent()
            .context("token store path has no parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
        }

        let doc = StoreDocument {
            accounts: self.accounts.clone(),
        };
        let json = serde_json::to_string_pretty(&doc)?;

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut tmp = fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tmp.set_permissions(fs::Permissions::from_mode(0o600))?;
            }
            tmp.write_all(json.as_bytes())?;
            tmp.sync_all()?;
        }

        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;

        Ok(())
    }

    pub fn get(&self, email: &str) -> Option<&Account> {
        self.accounts.iter().find(|a| a.email == email)
    }

    /// Insert or replace the account with the same email.
    pub fn upsert(&mut self, account: Account) {
        if let Some(existing) = self.accounts.iter_mut().find(|a| a.email == account.email) {
            *existing = account;
        } else {
            self.accounts.push(account);
        }
    }

    pub fn remove(&mut self, email: &str) -> bool {
        let before = self.accounts.len();
        self.accounts.retain(|a| a.email != email);
        self.accounts.len() != before
    }

    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// First account in the store; the gateway runs single-account.
    pub fn first(&self) -> Option<&Account> {
        self.accounts.first()
    }
}
