use crate::chat::turn::{TurnSettings, DEFAULT_MAX_ROUNDS, DEFAULT_MAX_TOOL_RESULT_BYTES};
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "TOOLMUX_CONFIG";
/// Fallback source for the model API key.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Top-level application configuration (`config.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub mcp: McpSettings,
    #[serde(default)]
    pub mirror: MirrorConfig,
}

/// HTTP gateway the UI talks to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upper bound on request bodies.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Generative model used by the chat loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// API key; falls back to `GEMINI_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
}

/// Timeouts and bounds for MCP connections and the function-calling loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpSettings {
    /// Transport construction plus handshake.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Each protocol request (list/call/get/read).
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    #[serde(default = "default_max_tool_result_bytes")]
    pub max_tool_result_bytes: usize,
}

/// Client-side presence mirror state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Where server configs and the "was connected" set persist. `~` is expanded.
    #[serde(default)]
    pub state_path: Option<String>,
    /// Gateway URL the mirror talks to.
    #[serde(default)]
    pub gateway_url: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    3100
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_model() -> String {
    "gemini-2.0-flash".into()
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".into()
}

fn default_model_timeout_secs() -> u64 {
    120
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_call_timeout_secs() -> u64 {
    60
}

fn default_max_tool_rounds() -> usize {
    DEFAULT_MAX_ROUNDS
}

fn default_max_tool_result_bytes() -> usize {
    DEFAULT_MAX_TOOL_RESULT_BYTES
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_model(),
            base_url: default_base_url(),
            temperature: None,
            timeout_secs: default_model_timeout_secs(),
        }
    }
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            max_tool_rounds: default_max_tool_rounds(),
            max_tool_result_bytes: default_max_tool_result_bytes(),
        }
    }
}

impl ModelConfig {
    /// Configured key, else the environment, ignoring blanks.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .filter(|k| !k.trim().is_empty())
    }
}

impl McpSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }

    pub fn turn_settings(&self) -> TurnSettings {
        TurnSettings {
            max_rounds: self.max_tool_rounds.max(1),
            max_tool_result_bytes: self.max_tool_result_bytes.max(256),
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "toolmux", "toolmux")
}

impl MirrorConfig {
    pub fn resolved_state_path(&self) -> Result<PathBuf> {
        match &self.state_path {
            Some(path) => Ok(PathBuf::from(shellexpand::tilde(path).into_owned())),
            None => project_dirs()
                .map(|dirs| dirs.data_dir().join("servers.json"))
                .context("Cannot determine a data directory; set [mirror].state_path"),
        }
    }

    pub fn resolved_gateway_url(&self, gateway: &GatewayConfig) -> String {
        self.gateway_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", gateway.host, gateway.port))
    }
}

impl Config {
    /// Default location: `$TOOLMUX_CONFIG`, else `<config dir>/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(shellexpand::tilde(&path).into_owned()));
        }
        project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `path` (or the default path). A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path(),
        };
        let Some(path) = path.filter(|p| p.exists()) else {
            tracing::debug!("No config file found, using defaults");
            return Ok(Self::default());
        };

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }
}
