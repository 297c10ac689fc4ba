//! Run settings.
//!
//! Settings come from, in increasing priority: defaults, an optional JSON
//! file, and `SALTGRAPH_*` environment variables.
//!
//! ```json
//! { "root": "data", "salt_len": 8, "algorithm": "sha256", "threads": 4 }
//! ```

use std::env;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::fingerprint::Algorithm;

/// Salt length used when nothing else is configured.
pub const DEFAULT_SALT_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Directory relative target paths are resolved against.
    pub root: Utf8PathBuf,
    /// Number of hex characters of the salted version embedded in paths.
    pub salt_len: usize,
    /// Hash function for salted versions.
    pub algorithm: Algorithm,
    /// Worker threads for task execution, `None` uses rayon's default.
    pub threads: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root: Utf8PathBuf::from("."),
            salt_len: DEFAULT_SALT_LEN,
            algorithm: Algorithm::Sha256,
            threads: None,
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    /// Applies `SALTGRAPH_ROOT`, `SALTGRAPH_SALT_LEN`, `SALTGRAPH_ALGORITHM`
    /// and `SALTGRAPH_THREADS` on top of `self`.
    pub fn with_env(self) -> Result<Self, ConfigError> {
        self.with_vars(|name| env::var(name).ok())
    }

    pub(crate) fn with_vars<F>(mut self, var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        if let Some(root) = var("SALTGRAPH_ROOT") {
            self.root = root.into();
        }

        if let Some(value) = var("SALTGRAPH_SALT_LEN") {
            self.salt_len = match value.parse() {
                Ok(len) if (1..=64).contains(&len) => len,
                _ => {
                    return Err(ConfigError::Env {
                        var: "SALTGRAPH_SALT_LEN",
                        value,
                    });
                }
            };
        }

        if let Some(value) = var("SALTGRAPH_ALGORITHM") {
            self.algorithm = value.parse().map_err(|_| ConfigError::Env {
                var: "SALTGRAPH_ALGORITHM",
                value: value.clone(),
            })?;
        }

        if let Some(value) = var("SALTGRAPH_THREADS") {
            self.threads = match value.parse() {
                Ok(0) | Err(_) => {
                    return Err(ConfigError::Env {
                        var: "SALTGRAPH_THREADS",
                        value,
                    });
                }
                Ok(n) => Some(n),
            };
        }

        Ok(self)
    }

    pub fn root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn salt_len(mut self, salt_len: usize) -> Self {
        self.salt_len = salt_len;
        self
    }

    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }
}
