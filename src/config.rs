// Configuration module
// Loads and validates configuration from CLI args, environment variables,
// an optional JSON config file, and defaults

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Antigravity Gateway - local Anthropic-to-Antigravity proxy
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Listen address
    #[arg(short = 'H', long, env = "HOST")]
    pub host: Option<String>,

    /// Listen port
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Run the Google OAuth login flow, persist the account, and exit
    #[arg(long)]
    pub login: bool,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Server settings
    pub host: String,
    pub port: u16,
    pub log_level: String,
    /// Accept requests whose Host header is not loopback
    pub allow_remote: bool,

    // On-disk state
    pub token_store_file: PathBuf,

    // Timeouts (seconds unless noted)
    pub connect_timeout: u64,
    /// Per-read idle timeout while streaming
    pub request_timeout: u64,
    /// Whole-request deadline in milliseconds; thinking models stream slowly
    pub request_deadline_ms: u64,

    // Streaming
    pub max_streaming_retries: u32,
    pub chunk_buffer_limit: usize,
    pub force_disable_streaming: bool,

    // Upstream retry
    pub upstream_max_retries: u32,

    // Model routing targets
    pub haiku_model: String,
    pub sonnet_model: String,
    pub opus_model: String,
    pub token_counter_model: String,

    // Thinking
    /// Explicit thinking budget; None leaves the upstream default in place
    pub thinking_budget: Option<u32>,

    // Heuristic tool-argument repair (alias table + fill-from-text)
    pub tool_repair_enabled: bool,
}

/// Proxy config file written by the setup tooling. All fields optional;
/// environment variables and CLI flags win over file values.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub models: ModelsSection,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProxySection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthSection {
    #[serde(default)]
    pub enabled: bool,
    pub account_email: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ModelsSection {
    pub haiku: Option<ModelTarget>,
    pub sonnet: Option<ModelTarget>,
    pub opus: Option<ModelTarget>,
}

/// A single alias-family mapping entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelTarget {
    #[serde(default)]
    pub pattern: Option<String>,
    pub target: String,
    #[serde(default, rename = "type")]
    pub model_type: Option<String>,
}

const DEFAULT_HAIKU_MODEL: &str = "antigravity-gemini-2.5-flash";
const DEFAULT_SONNET_MODEL: &str = "antigravity-claude-sonnet-4-5";
const DEFAULT_OPUS_MODEL: &str = "antigravity-claude-opus-4-5-thinking";

impl Config {
    /// Build configuration with priority: CLI > ENV > config file > defaults
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let file = load_config_file(&config_file_path())?;

        let config = Config {
            host: args
                .host
                .clone()
                .or_else(|| std::env::var("HOST").ok())
                .or_else(|| file.proxy.host.clone())
                .unwrap_or_else(|| "127.0.0.1".to_string()),

            port: args
                .port
                .or_else(|| std::env::var("PORT").ok().and_then(|s| s.parse().ok()))
                .or(file.proxy.port)
                .unwrap_or(8089),

            log_level: args
                .log_level
                .clone()
                .or_else(|| std::env::var("LOG_LEVEL").ok())
                .or_else(|| file.proxy.log_level.clone())
                .unwrap_or_else(|| "info".to_string()),

            allow_remote: env_flag("ALLOW_REMOTE", false),

            token_store_file: std::env::var("TOKEN_STORE_FILE")
                .map(|s| expand_tilde(&s))
                .unwrap_or_else(|_| default_token_store_path()),

            connect_timeout: env_parse("CONNECT_TIMEOUT", 10),
            request_timeout: env_parse("REQUEST_TIMEOUT", 90),
            request_deadline_ms: env_parse("REQUEST_DEADLINE_MS", 3_000_000),

            max_streaming_retries: env_parse("MAX_STREAMING_RETRIES", 12),
            chunk_buffer_limit: env_parse("CHUNK_BUFFER_LIMIT", 1024 * 1024),

            // Either name disables streaming; the second is an operator escape hatch
            force_disable_streaming: env_flag("FORCE_DISABLE_STREAMING", false)
                || env_flag("EMERGENCY_DISABLE_STREAMING", false),

            upstream_max_retries: env_parse("UPSTREAM_MAX_RETRIES", 3),

            haiku_model: std::env::var("HAIKU_MODEL")
                .ok()
                .or_else(|| file.models.haiku.as_ref().map(|m| m.target.clone()))
                .unwrap_or_else(|| DEFAULT_HAIKU_MODEL.to_string()),

            sonnet_model: std::env::var("SONNET_MODEL")
                .ok()
                .or_else(|| file.models.sonnet.as_ref().map(|m| m.target.clone()))
                .unwrap_or_else(|| DEFAULT_SONNET_MODEL.to_string()),

            opus_model: std::env::var("OPUS_MODEL")
                .ok()
                .or_else(|| file.models.opus.as_ref().map(|m| m.target.clone()))
                .unwrap_or_else(|| DEFAULT_OPUS_MODEL.to_string()),

            token_counter_model: std::env::var("TOKEN_COUNTER_MODEL")
                .unwrap_or_else(|_| "claude".to_string()),

            thinking_budget: std::env::var("THINKING_BUDGET")
                .ok()
                .and_then(|s| s.parse().ok()),

            tool_repair_enabled: env_flag("TOOL_REPAIR", true),
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("PORT must be non-zero");
        }

        if !self.allow_remote && !is_loopback_host(&self.host) {
            anyhow::bail!(
                "refusing to bind non-loopback address {} without ALLOW_REMOTE=true",
                self.host
            );
        }

        if self.chunk_buffer_limit == 0 {
            anyhow::bail!("CHUNK_BUFFER_LIMIT must be non-zero");
        }

        Ok(())
    }
}

/// True when the host names a loopback address.
pub fn is_loopback_host(host: &str) -> bool {
    let bare = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_lowercase();
    if bare == "localhost" {
        return true;
    }
    bare.parse::<std::net::IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

fn config_file_path() -> PathBuf {
    std::env::var("CONFIG_FILE")
        .map(|s| expand_tilde(&s))
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".antigravity-gateway")
                .join("config.json")
        })
}

fn default_token_store_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".antigravity-gateway")
        .join("accounts.json")
}

/// Read the optional JSON config file. A missing file is fine; a present but
/// unparseable one is a hard error.
fn load_config_file(path: &std::path::Path) -> Result<ConfigFile> {
    if !path.exists() {
        return Ok(ConfigFile::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("invalid config file {}", path.display()))
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(&path[2..]);
        }
    }
    PathBuf::from(path)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Boolean env flag: "false"/"0"/"no"/"disabled"/"off" is false,
/// any other non-empty value is true.
fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => {
            let raw = raw.to_lowercase();
            if raw.is_empty() {
                default
            } else {
                !matches!(raw.as_str(), "false" | "0" | "no" | "disabled" | "off")
            }
        }
        Err(_) => default,
    }
}

/// Fixed config for unit tests across the crate.
#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 8089,
        log_level: "info".to_string(),
        allow_remote: false,
        token_store_file: PathBuf::from("/tmp/accounts.json"),
        connect_timeout: 10,
        request_timeout: 90,
        request_deadline_ms: 3_000_000,
        max_streaming_retries: 12,
        chunk_buffer_limit: 1024 * 1024,
        force_disable_streaming: false,
        upstream_max_retries: 3,
        haiku_model: DEFAULT_HAIKU_MODEL.to_string(),
        sonnet_model: DEFAULT_SONNET_MODEL.to_string(),
        opus_model: DEFAULT_OPUS_MODEL.to_string(),
        token_counter_model: "claude".to_string(),
        thinking_budget: None,
        tool_repair_enabled: true,
    }
}
