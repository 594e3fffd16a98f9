//! Secret resolution for the model API key.
//!
//! Sources are tried in priority order:
//!
//! 1. **Direct value** in the config file, for local testing
//! 2. **File reference**, for mounted secrets (`api_key_file: /run/secrets/model-key`)
//! 3. **Env var reference** (`api_key_env_var: COMPLYFLOW_MODEL_API_KEY`)

use std::fs;

use secrecy::SecretString;

use crate::config::ModelConfig;
use crate::error::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("No secret source provided (need one of: direct value, file path, or env var name)")]
    NoSourceProvided,

    #[error("Failed to read secret from file '{path}': {source}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Environment variable '{name}' not set")]
    EnvVarNotSet { name: String },

    #[error("Environment variable '{name}' contains invalid UTF-8")]
    EnvVarNotUnicode { name: String },
}

pub type Result<T> = std::result::Result<T, SecretError>;

/// Resolves a secret from the first non-empty source: direct value, then
/// file contents, then environment variable. File and env values are
/// trimmed.
pub fn resolve_secret(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> Result<SecretString> {
    if let Some(value) = direct.filter(|v| !v.is_empty()) {
        return Ok(SecretString::from(value.to_string()));
    }

    if let Some(path) = file_path.filter(|p| !p.is_empty()) {
        let expanded = expand_home(path);
        return match fs::read_to_string(&expanded) {
            Ok(content) => Ok(SecretString::from(content.trim().to_string())),
            Err(e) => Err(SecretError::FileReadError {
                path: expanded,
                source: e,
            }),
        };
    }

    if let Some(var_name) = env_var.filter(|n| !n.is_empty()) {
        return match std::env::var(var_name) {
            Ok(value) => Ok(SecretString::from(value.trim().to_string())),
            Err(std::env::VarError::NotPresent) => Err(SecretError::EnvVarNotSet {
                name: var_name.to_string(),
            }),
            Err(std::env::VarError::NotUnicode(_)) => Err(SecretError::EnvVarNotUnicode {
                name: var_name.to_string(),
            }),
        };
    }

    Err(SecretError::NoSourceProvided)
}

/// Like [`resolve_secret`], but no configured source is `Ok(None)`.
pub fn resolve_secret_optional(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> Result<Option<SecretString>> {
    match resolve_secret(direct, file_path, env_var) {
        Ok(secret) => Ok(Some(secret)),
        Err(SecretError::NoSourceProvided) => Ok(None),
        Err(e) => Err(e),
    }
}

/// The model API key, if any source is configured. An env var named by
/// default but unset means "no key"; one named explicitly must be set.
pub fn model_api_key(model: &ModelConfig) -> std::result::Result<Option<SecretString>, ConfigError> {
    let explicit = model.api_key.is_some() || model.api_key_file.is_some();
    let resolved = resolve_secret_optional(
        model.api_key.as_deref(),
        model.api_key_file.as_deref(),
        model.api_key_env_var.as_deref(),
    );
    match resolved {
        Ok(secret) => Ok(secret),
        Err(SecretError::EnvVarNotSet { name }) if !explicit => {
            log::warn!("Model API key variable {} is not set; sending unauthenticated requests", name);
            Ok(None)
        }
        Err(e) => Err(ConfigError::Secret {
            name: "model.api_key".to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Expands a leading `~` to the user's home directory.
pub(crate) fn expand_home(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}
