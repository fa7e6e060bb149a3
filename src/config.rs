// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration for stablehand.
//!
//! Everything the manager needs is carried in one [`ManagerConfig`] value
//! that is passed into constructors explicitly. There is no ambient global
//! state; tests build a config by hand and production loads one from
//! `~/.stablehand/config.json`, with `OLLAMA_HOST` overriding the daemon
//! address the way the daemon's own tooling honors it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default daemon endpoint.
const DEFAULT_HOST: &str = "http://localhost:11434";

/// Environment variable that overrides the configured host.
const HOST_ENV_VAR: &str = "OLLAMA_HOST";

/// Model ensured when no name is given on the command line.
const DEFAULT_MODEL: &str = "qwen3:0.6b";

/// External pull command, invoked as `<tool> pull <name>`.
const DEFAULT_PULL_TOOL: &str = "ollama";

/// Default timeout for connection establishment (in seconds).
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Default timeout for plain request/response calls (in seconds).
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Default timeout for a whole pull operation (in seconds).
const PULL_TIMEOUT_SECS: u64 = 3600;

/// Models offered by the interactive picker when the config file does not
/// supply its own list.
const KNOWN_MODELS: &[&str] = &[
    "qwen3:0.6b",
    "qwen2.5:0.5b",
    "qwen2.5:7b",
    "qwen3:latest",
    "qwen3:1.7b",
    "qwen3:4b",
    "qwen3:14b",
    "llama3:8b",
    "llama3:70b",
    "gemma2:2b",
    "gemma2:9b",
    "mistral:7b",
    "mixtral:8x7b",
    "phi3:3.8b",
];

/// Manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Base URL of the daemon (e.g. "http://localhost:11434").
    pub host: String,
    /// Model ensured by the default command.
    pub default_model: String,
    /// Model identifiers offered by the interactive picker.
    pub known_models: Vec<String>,
    /// External pull command name or path.
    pub pull_tool: String,
    /// Connection establishment timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Request/response timeout in seconds.
    pub request_timeout_secs: u64,
    /// Whole-pull timeout in seconds.
    pub pull_timeout_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            known_models: KNOWN_MODELS.iter().map(|m| m.to_string()).collect(),
            pull_tool: DEFAULT_PULL_TOOL.to_string(),
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            pull_timeout_secs: PULL_TIMEOUT_SECS,
        }
    }
}

impl ManagerConfig {
    /// Default config file location.
    pub fn config_path() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".stablehand").join("config.json"))
            .unwrap_or_else(|| PathBuf::from(".stablehand/config.json"))
    }

    /// Load the configuration from the default location.
    ///
    /// A missing or unreadable file falls back to defaults; `OLLAMA_HOST`
    /// is applied on top either way.
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// Load the configuration from a specific file, then apply the
    /// environment override.
    pub fn load_from(path: &Path) -> Self {
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "invalid config file, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        };
        config.apply_env_override();
        config
    }

    /// Apply the `OLLAMA_HOST` override. Values without a scheme (the
    /// daemon accepts bare `host:port`) are normalized to `http://`.
    fn apply_env_override(&mut self) {
        if let Ok(host) = std::env::var(HOST_ENV_VAR) {
            let host = host.trim();
            if !host.is_empty() {
                self.host = normalize_host(host);
            }
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }
}

/// Prefix a scheme when the value is a bare `host:port`.
fn normalize_host(host: &str) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        host.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", host.trim_end_matches('/'))
    }
}
