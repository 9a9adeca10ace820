// Model alias routing
// Maps the alias the client sent to a concrete upstream model id

use crate::config::Config;
use crate::error::ApiError;

/// Upstream ids may carry an `antigravity-` routing prefix that must not be
/// sent upstream.
pub const UPSTREAM_PREFIX: &str = "antigravity-";

/// Result of routing a requested alias.
#[derive(Debug, Clone)]
pub struct ModelRoute {
    /// What the client originally sent; echoed back in every response
    pub requested: String,
    /// Model id sent upstream (prefix stripped)
    pub upstream_id: String,
    /// Whether the target model surfaces interleaved thoughts
    pub thinking: bool,
}

#[derive(Debug, Clone)]
pub struct ModelResolver {
    haiku: String,
    sonnet: String,
    opus: String,
}

impl ModelResolver {
    pub fn new(config: &Config) -> Self {
        Self {
            haiku: config.haiku_model.clone(),
            sonnet: config.sonnet_model.clone(),
            opus: config.opus_model.clone(),
        }
    }

    /// Routing rules, in order: a literal `antigravity-*` id is used
    /// verbatim; otherwise the alias is matched by family substring; an
    /// unmatched alias is a client error.
    pub fn resolve(&self, requested: &str) -> Result<ModelRoute, ApiError> {
        let target = if requested.starts_with(UPSTREAM_PREFIX) {
            requested.to_string()
        } else {
            let lower = requested.to_lowercase();
            if lower.contains("haiku") {
                self.haiku.clone()
            } else if lower.contains("sonnet") {
                self.sonnet.clone()
            } else if lower.contains("opus") {
                self.opus.clone()
            } else {
                return Err(ApiError::InvalidModel(format!(
                    "cannot route model \"{}\"; use an alias containing haiku, sonnet or opus, \
                     or a literal antigravity-* id",
                    requested
                )));
            }
        };

        let upstream_id = target
            .strip_prefix(UPSTREAM_PREFIX)
            .unwrap_or(&target)
            .to_string();

        Ok(ModelRoute {
            requested: requested.to_string(),
            thinking: is_thinking_model(&upstream_id),
            upstream_id,
        })
    }
}

/// Claude-family targets surface interleaved thoughts and expect the
/// matching request decoration.
pub fn is_thinking_model(upstream_id: &str) -> bool {
    upstream_id.starts_with("claude")
}
