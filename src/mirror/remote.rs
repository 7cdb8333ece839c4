use super::RegistryApi;
use crate::mcp::{ConnectionRegistry, OperationResult, ServerConfig, ServerSummary};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use std::time::Duration;

#[async_trait]
impl RegistryApi for ConnectionRegistry {
    async fn servers(&self) -> Result<Vec<ServerSummary>> {
        Ok(ConnectionRegistry::servers(self))
    }

    async fn connect(&self, config: &ServerConfig) -> OperationResult {
        ConnectionRegistry::connect(self, config.clone()).await
    }

    async fn disconnect(&self, id: &str) -> OperationResult {
        ConnectionRegistry::disconnect(self, id).await
    }
}

/// Talks to a running gateway's `/servers` routes.
pub struct GatewayClient {
    client: reqwest::Client,
    base: Url,
}

impl GatewayClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url).with_context(|| format!("Invalid gateway URL: {base_url}"))?;
        if base.cannot_be_a_base() {
            bail!("Invalid gateway URL: {base_url}");
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, base })
    }

    /// Base URL with `segments` appended, each percent-encoded.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn operation(&self, request: reqwest::RequestBuilder) -> OperationResult {
        let resp = match request.send().await {
            Ok(resp) => resp,
            Err(e) => return OperationResult::failed(format!("gateway request failed: {e}")),
        };
        let status = resp.status();
        match resp.json::<OperationResult>().await {
            Ok(result) => result,
            Err(_) => OperationResult::failed(format!("gateway returned HTTP {status}")),
        }
    }
}

#[async_trait]
impl RegistryApi for GatewayClient {
    async fn servers(&self) -> Result<Vec<ServerSummary>> {
        let resp = self
            .client
            .get(self.url(&["servers"]))
            .send()
            .await
            .context("gateway request failed")?
            .error_for_status()?;
        resp.json().await.context("malformed server list")
    }

    async fn connect(&self, config: &ServerConfig) -> OperationResult {
        self.operation(self.client.post(self.url(&["servers"])).json(config))
            .await
    }

    async fn disconnect(&self, id: &str) -> OperationResult {
        self.operation(self.client.delete(self.url(&["servers", id])))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_encode_ids_and_keep_base_path() {
        let client = GatewayClient::new("http://127.0.0.1:3100/api/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            client.url(&["servers", "a b/c"]).as_str(),
            "http://127.0.0.1:3100/api/servers/a%20b%2Fc"
        );
    }

    #[test]
    fn rejects_non_base_urls() {
        assert!(GatewayClient::new("mailto:x@y", Duration::from_secs(1)).is_err());
        assert!(GatewayClient::new("not a url", Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn unreachable_gateway_reports_failure() {
        // Port 9 (discard) on loopback is expected to refuse connections.
        let client = GatewayClient::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        assert!(client.servers().await.is_err());
        let result = client.disconnect("a").await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("gateway request failed"));
    }
}
