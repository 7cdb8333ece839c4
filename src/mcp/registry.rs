//! Process-wide table of managed connections, keyed by server id.
//!
//! Each id owns a slot with two locks:
//! - an async `gate` serializing lifecycle operations (connect/disconnect take
//!   it exclusively, capability calls take it shared), and
//! - a sync `state` that status queries read without waiting on the gate, so a
//!   connect in flight is observable as `connecting`.
//!
//! A slot leaves the map once its entry is gone and no task holds it, so the
//! map only tracks ids that are live or in flight.

use super::client::{McpClient, McpSession};
use super::config::ServerConfig;
use super::error::McpError;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        })
    }
}

/// `{success, error?}` as returned by lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl fmt::Display) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
        }
    }
}

/// Owned view of one tracked entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSummary {
    pub id: String,
    pub name: String,
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Runtime record for one server. `session` is `Some` only while `Connected`.
struct ManagedConnection {
    config: ServerConfig,
    status: ConnectionStatus,
    last_error: Option<String>,
    session: Option<Arc<dyn McpSession>>,
}

#[derive(Default)]
struct Slot {
    gate: tokio::sync::RwLock<()>,
    state: RwLock<Option<ManagedConnection>>,
}

/// Builds an initialized session for a server config.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ServerConfig) -> Result<Arc<dyn McpSession>, McpError>;
}

/// Production connector: transport adapter + protocol handshake.
pub struct TransportConnector {
    call_timeout: Duration,
}

impl TransportConnector {
    pub fn new(call_timeout: Duration) -> Self {
        Self { call_timeout }
    }
}

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(&self, config: &ServerConfig) -> Result<Arc<dyn McpSession>, McpError> {
        let client = McpClient::connect(config, self.call_timeout).await?;
        Ok(Arc::new(client))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RegistrySettings {
    /// Bound on transport construction plus handshake.
    pub connect_timeout: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Demotes an entry left in `connecting` when a connect future is dropped midway.
struct ConnectingGuard<'a> {
    slot: &'a Slot,
    armed: bool,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(conn) = self.slot.state.write().as_mut() {
            if conn.status == ConnectionStatus::Connecting {
                conn.status = ConnectionStatus::Error;
                conn.last_error = Some("connect cancelled".into());
            }
        }
    }
}

pub struct ConnectionRegistry {
    slots: RwLock<HashMap<String, Arc<Slot>>>,
    connector: Arc<dyn Connector>,
    settings: RegistrySettings,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn Connector>, settings: RegistrySettings) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            connector,
            settings,
        }
    }

    fn slot(&self, id: &str) -> Option<Arc<Slot>> {
        self.slots.read().get(id).cloned()
    }

    fn slot_or_insert(&self, id: &str) -> Arc<Slot> {
        if let Some(slot) = self.slot(id) {
            return slot;
        }
        Arc::clone(self.slots.write().entry(id.to_string()).or_default())
    }

    /// Connect (or reconnect) the server described by `config`.
    ///
    /// An existing entry for the same id is fully torn down first. The call
    /// always settles the entry as `connected` or `error`.
    pub async fn connect(&self, config: ServerConfig) -> OperationResult {
        if let Err(e) = config.validate() {
            return OperationResult::failed(e);
        }

        let slot = self.slot_or_insert(&config.id);
        let _gate = slot.gate.write().await;

        let previous = slot.state.write().take();
        if let Some(session) = previous.and_then(|conn| conn.session) {
            tracing::info!(server = %config.id, "Closing previous MCP session before reconnect");
            if let Err(e) = self.close_session(&session).await {
                tracing::warn!(server = %config.id, error = %e, "MCP session close error");
            }
        }

        *slot.state.write() = Some(ManagedConnection {
            config: config.clone(),
            status: ConnectionStatus::Connecting,
            last_error: None,
            session: None,
        });
        let mut guard = ConnectingGuard {
            slot: &slot,
            armed: true,
        };

        let timeout = self.settings.connect_timeout;
        let outcome = match tokio::time::timeout(timeout, self.connector.connect(&config)).await {
            Ok(result) => result,
            Err(_) => Err(McpError::timeout("connect", timeout.as_secs())),
        };

        let result = {
            let mut state = slot.state.write();
            let conn = state.get_or_insert_with(|| ManagedConnection {
                config: config.clone(),
                status: ConnectionStatus::Connecting,
                last_error: None,
                session: None,
            });
            match outcome {
                Ok(session) => {
                    conn.status = ConnectionStatus::Connected;
                    conn.last_error = None;
                    conn.session = Some(session);
                    OperationResult::ok()
                }
                Err(e) => {
                    conn.status = ConnectionStatus::Error;
                    conn.last_error = Some(e.to_string());
                    conn.session = None;
                    OperationResult::failed(e)
                }
            }
        };
        guard.armed = false;

        match &result.error {
            None => tracing::info!(server = %config.id, name = %config.name, "MCP server connected"),
            Some(e) => tracing::warn!(server = %config.id, error = %e, "MCP server failed to connect"),
        }
        result
    }

    /// Close and forget a server. Close failures are reported alongside a
    /// successful removal.
    pub async fn disconnect(&self, id: &str) -> OperationResult {
        let Some(slot) = self.slot(id) else {
            return OperationResult::failed(McpError::ServerNotFound(id.to_string()));
        };
        let result = self.remove_entry(id, &slot).await;
        drop(slot);
        self.prune(id);
        result
    }

    async fn remove_entry(&self, id: &str, slot: &Slot) -> OperationResult {
        let _gate = slot.gate.write().await;

        let Some(conn) = slot.state.write().take() else {
            return OperationResult::failed(McpError::ServerNotFound(id.to_string()));
        };

        let mut result = OperationResult::ok();
        if let Some(session) = conn.session {
            if let Err(e) = self.close_session(&session).await {
                tracing::warn!(server = %id, error = %e, "MCP session close error");
                result.error = Some(format!("session close failed: {e}"));
            }
        }
        tracing::info!(server = %id, "MCP server disconnected");
        result
    }

    /// Close bounded by the connect timeout; the gate is held meanwhile.
    async fn close_session(&self, session: &Arc<dyn McpSession>) -> Result<(), McpError> {
        let timeout = self.settings.connect_timeout;
        match tokio::time::timeout(timeout, session.close()).await {
            Ok(result) => result,
            Err(_) => Err(McpError::timeout("close", timeout.as_secs())),
        }
    }

    /// Drop the slot for `id` once its entry is gone and nothing else holds it.
    fn prune(&self, id: &str) {
        let mut slots = self.slots.write();
        let idle = slots
            .get(id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1 && slot.state.read().is_none());
        if idle {
            slots.remove(id);
        }
    }

    /// Unknown ids read as `disconnected`.
    pub fn status(&self, id: &str) -> ConnectionStatus {
        self.slot(id)
            .and_then(|slot| slot.state.read().as_ref().map(|c| c.status))
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    /// Snapshot of every tracked entry, sorted by id.
    pub fn servers(&self) -> Vec<ServerSummary> {
        let slots: Vec<Arc<Slot>> = self.slots.read().values().cloned().collect();
        let mut out: Vec<ServerSummary> = slots
            .iter()
            .filter_map(|slot| {
                slot.state.read().as_ref().map(|c| ServerSummary {
                    id: c.config.id.clone(),
                    name: c.config.name.clone(),
                    status: c.status,
                    last_error: c.last_error.clone(),
                })
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn config(&self, id: &str) -> Option<ServerConfig> {
        self.slot(id)
            .and_then(|slot| slot.state.read().as_ref().map(|c| c.config.clone()))
    }

    /// Run `op` against the live session of a connected server.
    ///
    /// Fails with `ServerNotConnected` without touching the network unless the
    /// entry is `connected`. A timeout, or an error after which the transport
    /// reports itself dead, demotes the entry to `error`.
    pub async fn with_session<T, F, Fut>(&self, id: &str, op: F) -> Result<T, McpError>
    where
        F: FnOnce(Arc<dyn McpSession>) -> Fut,
        Fut: Future<Output = Result<T, McpError>>,
    {
        let not_connected = || McpError::ServerNotConnected(id.to_string());
        let slot = self.slot(id).ok_or_else(not_connected)?;
        let _gate = slot.gate.read().await;

        let session = slot
            .state
            .read()
            .as_ref()
            .filter(|c| c.status == ConnectionStatus::Connected)
            .and_then(|c| c.session.clone())
            .ok_or_else(not_connected)?;

        let result = op(Arc::clone(&session)).await;

        if let Err(e) = &result {
            if e.is_timeout() || !session.is_alive() {
                self.demote(id, &slot, &session, e).await;
            }
        }
        result
    }

    async fn demote(&self, id: &str, slot: &Slot, session: &Arc<dyn McpSession>, cause: &McpError) {
        let demoted = {
            let mut state = slot.state.write();
            match state.as_mut() {
                Some(conn)
                    if conn
                        .session
                        .as_ref()
                        .is_some_and(|s| same_session(s, session)) =>
                {
                    conn.status = ConnectionStatus::Error;
                    conn.last_error = Some(cause.to_string());
                    conn.session.take()
                }
                _ => None,
            }
        };

        if let Some(session) = demoted {
            tracing::warn!(server = %id, error = %cause, "MCP session demoted to error");
            if let Err(e) = self.close_session(&session).await {
                tracing::warn!(server = %id, error = %e, "MCP session close error");
            }
        }
    }

    /// Disconnect every tracked server. Called once on process shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.servers().into_iter().map(|s| s.id).collect();
        if ids.is_empty() {
            return;
        }
        tracing::info!(servers = ids.len(), "Shutting down MCP connections");
        let results = futures::future::join_all(ids.iter().map(|id| self.disconnect(id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Some(e) = result.error {
                tracing::warn!(server = %id, error = %e, "MCP server shutdown error");
            }
        }
    }
}

fn same_session(a: &Arc<dyn McpSession>, b: &Arc<dyn McpSession>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a).cast::<()>(),
        Arc::as_ptr(b).cast::<()>(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::testing::{tool, FakeConnector, ServerBehaviour};
    use std::sync::atomic::Ordering;

    fn registry(connector: Arc<FakeConnector>, connect_timeout: Duration) -> ConnectionRegistry {
        ConnectionRegistry::new(connector, RegistrySettings { connect_timeout })
    }

    #[tokio::test]
    async fn connect_settles_to_connected() {
        let connector = Arc::new(FakeConnector::default());
        let registry = registry(connector, Duration::from_secs(5));

        let result = registry.connect(ServerConfig::stdio("a", "Alpha", "echo")).await;
        assert!(result.success, "{result:?}");
        assert_eq!(registry.status("a"), ConnectionStatus::Connected);
        assert_eq!(
            registry.servers(),
            vec![ServerSummary {
                id: "a".into(),
                name: "Alpha".into(),
                status: ConnectionStatus::Connected,
                last_error: None,
            }]
        );
    }

    #[tokio::test]
    async fn failed_connect_records_error() {
        let connector = Arc::new(FakeConnector::default().with(
            "a",
            ServerBehaviour {
                fail_connect: true,
                ..Default::default()
            },
        ));
        let registry = registry(connector, Duration::from_secs(5));

        let result = registry.connect(ServerConfig::stdio("a", "Alpha", "echo")).await;
        assert!(!result.success);
        assert_eq!(registry.status("a"), ConnectionStatus::Error);
        let summary = &registry.servers()[0];
        assert!(summary
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("connection refused")));
    }

    #[tokio::test]
    async fn connect_timeout_demotes_to_error() {
        let connector = Arc::new(FakeConnector::default().with(
            "slow",
            ServerBehaviour {
                connect_delay: Some(Duration::from_secs(10)),
                ..Default::default()
            },
        ));
        let registry = registry(connector, Duration::from_millis(50));

        let result = registry.connect(ServerConfig::stdio("slow", "Slow", "echo")).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
        assert_eq!(registry.status("slow"), ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn invalid_config_creates_no_entry() {
        let registry = registry(Arc::new(FakeConnector::default()), Duration::from_secs(5));
        let result = registry.connect(ServerConfig::stdio("a", "Alpha", "  ")).await;
        assert!(!result.success);
        assert!(registry.servers().is_empty());
    }

    #[tokio::test]
    async fn disconnect_unknown_is_not_found_and_repeatable() {
        let registry = registry(Arc::new(FakeConnector::default()), Duration::from_secs(5));
        for _ in 0..2 {
            let result = registry.disconnect("missing").await;
            assert!(!result.success);
            assert!(result.error.unwrap().contains("not found"));
        }
        assert!(registry.servers().is_empty());
        assert_eq!(registry.status("missing"), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_closes_session_and_forgets_entry() {
        let connector = Arc::new(FakeConnector::default());
        let registry = registry(Arc::clone(&connector), Duration::from_secs(5));
        registry.connect(ServerConfig::stdio("a", "Alpha", "echo")).await;

        assert!(registry.disconnect("a").await.success);
        assert!(connector.sessions_for("a")[0].closed.load(Ordering::SeqCst));
        assert!(registry.servers().is_empty());
        assert_eq!(registry.status("a"), ConnectionStatus::Disconnected);
        assert!(!registry.disconnect("a").await.success);
    }

    #[tokio::test]
    async fn reconnect_closes_previous_session_first() {
        let connector = Arc::new(FakeConnector::default());
        let registry = registry(Arc::clone(&connector), Duration::from_secs(5));

        registry.connect(ServerConfig::stdio("a", "Alpha", "echo")).await;
        registry.connect(ServerConfig::stdio("a", "Alpha v2", "echo")).await;

        assert_eq!(connector.events(), vec!["open:a#1", "close:a#1", "open:a#2"]);
        assert_eq!(registry.servers().len(), 1);
        assert_eq!(registry.servers()[0].name, "Alpha v2");
    }

    #[tokio::test]
    async fn different_ids_do_not_block_each_other() {
        let connector = Arc::new(FakeConnector::default().with(
            "slow",
            ServerBehaviour {
                connect_delay: Some(Duration::from_millis(300)),
                ..Default::default()
            },
        ));
        let registry = Arc::new(registry(connector, Duration::from_secs(5)));

        let background = Arc::clone(&registry);
        let slow = tokio::spawn(async move {
            background
                .connect(ServerConfig::stdio("slow", "Slow", "echo"))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(registry.status("slow"), ConnectionStatus::Connecting);
        assert!(registry.connect(ServerConfig::stdio("fast", "Fast", "echo")).await.success);
        assert_eq!(registry.status("slow"), ConnectionStatus::Connecting);

        assert!(slow.await.unwrap().success);
        assert_eq!(registry.status("slow"), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn with_session_refuses_unconnected_entries() {
        let connector = Arc::new(FakeConnector::default().with(
            "broken",
            ServerBehaviour {
                fail_connect: true,
                ..Default::default()
            },
        ));
        let registry = registry(connector, Duration::from_secs(5));
        registry.connect(ServerConfig::stdio("broken", "Broken", "echo")).await;

        for id in ["broken", "never-seen"] {
            let err = registry
                .with_session(id, |s| async move { s.list_tools().await })
                .await
                .unwrap_err();
            assert!(matches!(err, McpError::ServerNotConnected(_)));
        }
    }

    #[tokio::test]
    async fn call_timeout_demotes_entry() {
        let connector = Arc::new(FakeConnector::default().with(
            "a",
            ServerBehaviour {
                tools: vec![tool("search")],
                ..Default::default()
            },
        ));
        let registry = registry(Arc::clone(&connector), Duration::from_secs(5));
        registry.connect(ServerConfig::stdio("a", "Alpha", "echo")).await;

        let err = registry
            .with_session("a", |_| async { Err::<(), _>(McpError::timeout("tools/call", 1)) })
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(registry.status("a"), ConnectionStatus::Error);
        assert!(connector.sessions_for("a")[0].closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn hung_close_does_not_wedge_the_id() {
        let connector = Arc::new(FakeConnector::default().with(
            "a",
            ServerBehaviour {
                close_delay: Some(Duration::from_secs(3600)),
                ..Default::default()
            },
        ));
        let registry = registry(Arc::clone(&connector), Duration::from_millis(100));
        registry.connect(ServerConfig::stdio("a", "Alpha", "echo")).await;

        let reconnect = tokio::time::timeout(
            Duration::from_secs(5),
            registry.connect(ServerConfig::stdio("a", "Alpha", "echo")),
        )
        .await
        .expect("reconnect settled");
        assert!(reconnect.success, "{reconnect:?}");
        assert_eq!(registry.status("a"), ConnectionStatus::Connected);

        let removed = tokio::time::timeout(Duration::from_secs(5), registry.disconnect("a"))
            .await
            .expect("disconnect settled");
        assert!(removed.success);
        assert!(removed.error.unwrap().contains("timed out"));
        assert_eq!(registry.status("a"), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn disconnected_ids_release_their_slots() {
        let registry = registry(Arc::new(FakeConnector::default()), Duration::from_secs(5));
        for n in 0..20 {
            let id = format!("s{n}");
            registry.connect(ServerConfig::stdio(&id, "S", "echo")).await;
            assert!(registry.disconnect(&id).await.success);
        }
        assert!(registry.slots.read().is_empty());

        registry.connect(ServerConfig::stdio("kept", "Kept", "echo")).await;
        assert_eq!(registry.slots.read().len(), 1);
        assert!(registry.disconnect("kept").await.success);
        assert!(registry.connect(ServerConfig::stdio("kept", "Kept", "echo")).await.success);
        assert_eq!(registry.status("kept"), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn shutdown_sweeps_every_session() {
        let connector = Arc::new(FakeConnector::default());
        let registry = registry(Arc::clone(&connector), Duration::from_secs(5));
        registry.connect(ServerConfig::stdio("a", "Alpha", "echo")).await;
        registry.connect(ServerConfig::stdio("b", "Beta", "echo")).await;

        registry.shutdown().await;

        assert!(registry.servers().is_empty());
        assert!(connector
            .opened
            .lock()
            .iter()
            .all(|s| s.closed.load(Ordering::SeqCst)));
    }

    /// Real stdio transport against a scripted `sh` server that answers the
    /// handshake and an empty tools/list, then idles until stdin closes.
    #[cfg(unix)]
    #[tokio::test]
    async fn stdio_server_lifecycle() {
        let script = r#"read _init
echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"sh"}}}'
read _initialized
read _list
echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[]}}'
cat > /dev/null"#;
        let mut config = ServerConfig::stdio("echo", "Echo", "sh");
        if let crate::mcp::config::TransportConfig::Stdio { args, .. } = &mut config.transport {
            args.extend(["-c".to_string(), script.to_string()]);
        }

        let registry = ConnectionRegistry::new(
            Arc::new(TransportConnector::new(Duration::from_secs(10))),
            RegistrySettings {
                connect_timeout: Duration::from_secs(10),
            },
        );

        let result = registry.connect(config).await;
        assert!(result.success, "{result:?}");

        let tools = registry
            .with_session("echo", |s| async move { s.list_tools().await })
            .await
            .unwrap();
        assert!(tools.is_empty());

        assert!(registry.disconnect("echo").await.success);
        assert_eq!(registry.status("echo"), ConnectionStatus::Disconnected);
    }
}
