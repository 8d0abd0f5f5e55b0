use std::path::{Path, PathBuf};

use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::core::error::{MimicError, Result};
use crate::core::transport::{DEFAULT_BASE_URL, DEFAULT_MODEL};

pub const HOME_ENV: &str = "MIMIC_HOME";
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Installation-wide settings stored as `<base>/config`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub openai_token: String,
    #[serde(default)]
    pub username: String,
    /// Completion model; falls back to [`DEFAULT_MODEL`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// API root; falls back to [`DEFAULT_BASE_URL`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Config {
    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    /// The credential to call the API with. `OPENAI_API_KEY` wins over the
    /// stored token when set.
    pub fn credential(&self) -> Option<String> {
        resolve_credential(&self.openai_token, std::env::var(API_KEY_ENV).ok())
    }
}

fn resolve_credential(stored: &str, from_env: Option<String>) -> Option<String> {
    from_env
        .filter(|token| !token.trim().is_empty())
        .or_else(|| Some(stored.trim().to_string()).filter(|token| !token.is_empty()))
}

/// Resolve the storage base directory: explicit flag, then `MIMIC_HOME`,
/// then `~/.mimic`.
pub fn resolve_base_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os(HOME_ENV).filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".mimic"))
        .ok_or_else(|| {
            MimicError::Configuration("Failed to determine the home directory".to_string())
        })
}
