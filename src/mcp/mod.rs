//! MCP connection management: transports, protocol sessions, the connection
//! registry and the capability facade on top of it.

pub mod client;
pub mod config;
pub mod error;
pub mod facade;
pub mod protocol;
pub mod registry;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{McpClient, McpSession};
pub use config::{ServerConfig, TransportConfig, TransportKind};
pub use error::McpError;
pub use facade::{CapabilityFacade, McpResponse};
pub use registry::{
    ConnectionRegistry, ConnectionStatus, Connector, OperationResult, RegistrySettings,
    ServerSummary, TransportConnector,
};

use std::sync::Arc;
use std::time::Duration;

/// Registry wired to the real transports, as used by the gateway.
pub fn production_registry(connect_timeout: Duration, call_timeout: Duration) -> Arc<ConnectionRegistry> {
    Arc::new(ConnectionRegistry::new(
        Arc::new(TransportConnector::new(call_timeout)),
        RegistrySettings { connect_timeout },
    ))
}
