use super::error::McpError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Identity and connection recipe for one tool server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Opaque caller-assigned identifier, unique per registry.
    pub id: String,
    /// Display label.
    pub name: String,
    /// Transport kind and its parameters.
    pub transport: TransportConfig,
}

/// Transport parameters, tagged by kind: `{"type": "stdio", "command": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    Stdio {
        /// Command to spawn.
        command: String,
        /// Arguments for the command.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        /// Environment overlay, merged over the host environment.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    Http {
        url: String,
    },
    Sse {
        url: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Stdio,
    Http,
    Sse,
}

impl TransportKind {
    pub const ALL: [TransportKind; 3] = [Self::Stdio, Self::Http, Self::Sse];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::Sse => "sse",
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Stdio { .. } => TransportKind::Stdio,
            Self::Http { .. } => TransportKind::Http,
            Self::Sse { .. } => TransportKind::Sse,
        }
    }
}

impl ServerConfig {
    pub fn stdio(id: impl Into<String>, name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            transport: TransportConfig::Stdio {
                command: command.into(),
                args: Vec::new(),
                env: BTreeMap::new(),
            },
        }
    }

    /// Parse an untyped record, telling an unknown transport tag apart from
    /// parameters that do not fit a known one.
    pub fn from_value(value: Value) -> Result<Self, McpError> {
        let kind = value
            .get("transport")
            .and_then(|t| t.get("type"))
            .and_then(Value::as_str)
            .ok_or_else(|| McpError::Config("missing transport.type".into()))?;

        if TransportKind::parse(kind).is_none() {
            return Err(McpError::UnsupportedTransportKind(kind.to_string()));
        }

        let config: Self =
            serde_json::from_value(value).map_err(|e| McpError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the parameters are usable for the declared transport.
    pub fn validate(&self) -> Result<(), McpError> {
        if self.id.trim().is_empty() {
            return Err(McpError::Config("server id must not be empty".into()));
        }
        if self.name.trim().is_empty() {
            return Err(McpError::Config(format!(
                "server '{}' must have a display name",
                self.id
            )));
        }

        match &self.transport {
            TransportConfig::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(McpError::Config(format!(
                        "server '{}': stdio transport requires 'command'",
                        self.id
                    )));
                }
            }
            TransportConfig::Http { url } | TransportConfig::Sse { url } => {
                let parsed = reqwest::Url::parse(url).map_err(|e| {
                    McpError::Config(format!("server '{}': invalid url '{url}': {e}", self.id))
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(McpError::Config(format!(
                        "server '{}': url must be http(s), got '{}'",
                        self.id,
                        parsed.scheme()
                    )));
                }
            }
        }
        Ok(())
    }
}
