//! Client-side presence mirror.
//!
//! Keeps the caller's list of server configs and its belief about each
//! server's status, persists both, and replays connects after a restart. It
//! never owns a session: every change goes through a [`RegistryApi`], and the
//! registry's answer always wins.

pub mod remote;
pub mod store;

pub use remote::GatewayClient;
pub use store::{MirrorState, MirrorStore};

use crate::mcp::{ConnectionStatus, OperationResult, ServerConfig, ServerSummary};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// The registry operations the mirror relies on.
#[async_trait]
pub trait RegistryApi: Send + Sync {
    async fn servers(&self) -> anyhow::Result<Vec<ServerSummary>>;
    async fn connect(&self, config: &ServerConfig) -> OperationResult;
    async fn disconnect(&self, id: &str) -> OperationResult;
}

#[async_trait]
impl<T: RegistryApi + ?Sized> RegistryApi for std::sync::Arc<T> {
    async fn servers(&self) -> anyhow::Result<Vec<ServerSummary>> {
        (**self).servers().await
    }

    async fn connect(&self, config: &ServerConfig) -> OperationResult {
        (**self).connect(config).await
    }

    async fn disconnect(&self, id: &str) -> OperationResult {
        (**self).disconnect(id).await
    }
}

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("server import must be a JSON array of server configs")]
    NotAnArray,

    #[error("invalid server config at index {index}: {message}")]
    InvalidRecord { index: usize, message: String },

    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error("invalid server config: {0}")]
    InvalidConfig(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// One configured server as the mirror currently sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorEntry {
    pub id: String,
    pub name: String,
    pub transport: &'static str,
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Presence {
    status: ConnectionStatus,
    last_error: Option<String>,
}

impl Presence {
    fn disconnected() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            last_error: None,
        }
    }

    fn from_result(result: &OperationResult) -> Self {
        if result.success {
            Self {
                status: ConnectionStatus::Connected,
                last_error: None,
            }
        } else {
            Self {
                status: ConnectionStatus::Error,
                last_error: result.error.clone(),
            }
        }
    }
}

pub struct PresenceMirror<R> {
    registry: R,
    store: MirrorStore,
    state: MirrorState,
    presence: HashMap<String, Presence>,
}

impl<R: RegistryApi> PresenceMirror<R> {
    /// Empty mirror; call [`restore`](Self::restore) to load persisted state.
    pub fn new(registry: R, store: MirrorStore) -> Self {
        Self {
            registry,
            store,
            state: MirrorState::default(),
            presence: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Load persisted configs and reconcile them against the registry.
    ///
    /// Every config starts `disconnected`. Ids the registry reports as
    /// `connected` adopt that status. Ids remembered as connected but not
    /// reported so get one reconnect attempt. If the status query fails, every
    /// remembered id gets that attempt.
    pub async fn restore(&mut self) -> Result<(), MirrorError> {
        self.state = self.store.load()?;
        self.presence = self
            .state
            .servers
            .iter()
            .map(|s| (s.id.clone(), Presence::disconnected()))
            .collect();

        let live: HashSet<String> = match self.registry.servers().await {
            Ok(servers) => servers
                .into_iter()
                .filter(|s| s.status == ConnectionStatus::Connected)
                .map(|s| s.id)
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Registry status query failed; reconnecting remembered servers");
                HashSet::new()
            }
        };

        let mut replay = Vec::new();
        for config in &self.state.servers {
            if live.contains(&config.id) {
                self.presence.insert(
                    config.id.clone(),
                    Presence {
                        status: ConnectionStatus::Connected,
                        last_error: None,
                    },
                );
            } else if self.state.connected.contains(&config.id) {
                replay.push(config.clone());
            }
        }

        if !replay.is_empty() {
            tracing::info!(servers = replay.len(), "Reconnecting previously connected servers");
        }
        let results =
            futures::future::join_all(replay.iter().map(|config| self.registry.connect(config)))
                .await;
        for (config, result) in replay.iter().zip(results) {
            if let Some(e) = &result.error {
                tracing::warn!(server = %config.id, error = %e, "Reconnect failed");
            }
            self.presence
                .insert(config.id.clone(), Presence::from_result(&result));
        }

        self.sync_connected();
        self.persist()
    }

    /// Configured servers with their mirrored status, in configuration order.
    pub fn entries(&self) -> Vec<MirrorEntry> {
        self.state
            .servers
            .iter()
            .map(|config| {
                let presence = self
                    .presence
                    .get(&config.id)
                    .cloned()
                    .unwrap_or_else(Presence::disconnected);
                MirrorEntry {
                    id: config.id.clone(),
                    name: config.name.clone(),
                    transport: config.transport.kind().as_str(),
                    status: presence.status,
                    last_error: presence.last_error,
                }
            })
            .collect()
    }

    pub fn status(&self, id: &str) -> ConnectionStatus {
        self.presence
            .get(id)
            .map(|p| p.status)
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    pub fn config(&self, id: &str) -> Option<&ServerConfig> {
        self.state.servers.iter().find(|s| s.id == id)
    }

    /// Add or replace a config. Replacing does not touch a live connection;
    /// the new recipe applies on the next connect.
    pub fn add_server(&mut self, config: ServerConfig) -> Result<(), MirrorError> {
        config
            .validate()
            .map_err(|e| MirrorError::InvalidConfig(e.to_string()))?;
        match self.state.servers.iter_mut().find(|s| s.id == config.id) {
            Some(existing) => *existing = config,
            None => {
                self.presence
                    .insert(config.id.clone(), Presence::disconnected());
                self.state.servers.push(config);
            }
        }
        self.persist()
    }

    /// Forget a config, disconnecting it first if the mirror believes it is live.
    pub async fn remove_server(&mut self, id: &str) -> Result<(), MirrorError> {
        if self.config(id).is_none() {
            return Err(MirrorError::UnknownServer(id.to_string()));
        }
        if self.status(id) != ConnectionStatus::Disconnected {
            let result = self.registry.disconnect(id).await;
            if let Some(e) = result.error {
                tracing::debug!(server = %id, error = %e, "Disconnect before removal reported an error");
            }
        }
        self.state.servers.retain(|s| s.id != id);
        self.presence.remove(id);
        self.state.connected.remove(id);
        self.persist()
    }

    pub async fn connect(&mut self, id: &str) -> OperationResult {
        let Some(config) = self.config(id).cloned() else {
            return OperationResult::failed(MirrorError::UnknownServer(id.to_string()));
        };
        self.presence.insert(
            id.to_string(),
            Presence {
                status: ConnectionStatus::Connecting,
                last_error: None,
            },
        );
        let result = self.registry.connect(&config).await;
        self.presence
            .insert(id.to_string(), Presence::from_result(&result));
        self.sync_connected();
        self.persist_logged();
        result
    }

    /// The mirror reads `disconnected` afterwards whatever the registry said:
    /// the registry drops the entry even when closing fails, and a not-found
    /// answer means there was nothing live to begin with.
    pub async fn disconnect(&mut self, id: &str) -> OperationResult {
        if self.config(id).is_none() {
            return OperationResult::failed(MirrorError::UnknownServer(id.to_string()));
        }
        let result = self.registry.disconnect(id).await;
        self.presence.insert(id.to_string(), Presence::disconnected());
        self.sync_connected();
        self.persist_logged();
        result
    }

    /// Configured servers as a pretty-printed JSON array.
    pub fn export_json(&self) -> Result<String, MirrorError> {
        Ok(serde_json::to_string_pretty(&self.state.servers)?)
    }

    /// Replace the whole configured set from a JSON array.
    ///
    /// Nothing changes unless every record is valid. Servers the mirror
    /// believed live are disconnected first; imported servers start
    /// `disconnected`.
    pub async fn import_json(&mut self, json: &str) -> Result<usize, MirrorError> {
        let Value::Array(records) = serde_json::from_str::<Value>(json)? else {
            return Err(MirrorError::NotAnArray);
        };

        let mut servers = Vec::with_capacity(records.len());
        let mut seen = HashSet::new();
        for (index, record) in records.into_iter().enumerate() {
            let config = ServerConfig::from_value(record).map_err(|e| MirrorError::InvalidRecord {
                index,
                message: e.to_string(),
            })?;
            if !seen.insert(config.id.clone()) {
                return Err(MirrorError::InvalidRecord {
                    index,
                    message: format!("duplicate id '{}'", config.id),
                });
            }
            servers.push(config);
        }

        let live: Vec<String> = self
            .presence
            .iter()
            .filter(|(_, p)| p.status != ConnectionStatus::Disconnected)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &live {
            self.registry.disconnect(id).await;
        }

        let count = servers.len();
        self.presence = servers
            .iter()
            .map(|s| (s.id.clone(), Presence::disconnected()))
            .collect();
        self.state = MirrorState {
            servers,
            connected: Default::default(),
        };
        self.persist()?;
        tracing::info!(servers = count, "Imported server configs");
        Ok(count)
    }

    fn sync_connected(&mut self) {
        self.state.connected = self
            .presence
            .iter()
            .filter(|(_, p)| p.status == ConnectionStatus::Connected)
            .map(|(id, _)| id.clone())
            .collect();
    }

    fn persist(&self) -> Result<(), MirrorError> {
        self.store.save(&self.state)?;
        Ok(())
    }

    fn persist_logged(&self) {
        if let Err(e) = self.persist() {
            tracing::warn!(path = %self.store.path().display(), error = %e, "Failed to persist mirror state");
        }
    }
}
