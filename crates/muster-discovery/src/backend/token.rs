//! Hosted cluster-token backend (`token` scheme)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use muster_common::{Error, Node, Result};
use tokio::sync::mpsc;
use tracing::debug;

use crate::backend::{Backend, http_client, watch_period};
use crate::listener::DiscoveryListener;
use crate::watch::WatchHandle;

/// Default hosted discovery service.
pub const DEFAULT_DISCOVERY_URL: &str = "https://discovery.muster.dev/v1";

/// Discovery through a hosted cluster-token HTTP service.
///
/// A cluster is identified by an opaque token; members register by POSTing
/// their address under the token and fetch the member list back as a JSON
/// array of `host:port` strings. The URI is either a bare token (hosted
/// service) or `host/path/token` for a self-hosted endpoint.
#[derive(Default)]
pub struct TokenBackend {
    client: Option<reqwest::Client>,
    url: String,
    token: String,
    heartbeat: Duration,
}

impl TokenBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> Result<&reqwest::Client> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::StoreConnect("backend not initialized".to_string()))
    }

    /// Create a new cluster and return its freshly minted token.
    ///
    /// This is a provisioning-time helper; steady-state discovery only needs
    /// fetch/watch/register against an existing token.
    pub async fn create_cluster(&self) -> Result<String> {
        let url = format!("{}/clusters", self.url);
        let resp = self
            .client()?
            .post(&url)
            .send()
            .await
            .map_err(|e| Error::StoreWrite(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Error::StoreWrite(format!(
                "discovery service returned {}",
                resp.status()
            )));
        }
        resp.text()
            .await
            .map_err(|e| Error::StoreWrite(e.to_string()))
    }
}

async fn fetch_nodes(client: &reqwest::Client, url: &str, token: &str) -> Result<Vec<Node>> {
    let endpoint = format!("{}/clusters/{}", url, token);
    let resp = client
        .get(&endpoint)
        .send()
        .await
        .map_err(|e| Error::StoreRead(e.to_string()))?;

    if !resp.status().is_success() {
        return Err(Error::StoreRead(format!(
            "discovery service returned {}",
            resp.status()
        )));
    }

    let addrs: Vec<String> = resp
        .json()
        .await
        .map_err(|e| Error::StoreRead(e.to_string()))?;

    let mut nodes = Vec::with_capacity(addrs.len());
    for addr in &addrs {
        nodes.push(Node::parse(addr)?);
    }
    Ok(nodes)
}

#[async_trait]
impl Backend for TokenBackend {
    fn name(&self) -> &'static str {
        "token"
    }

    /// `rest` is either a bare token, or `host/path/token` where everything
    /// before the last `/` is a custom service base. A base without an
    /// explicit scheme gets `https://`.
    async fn initialize(&mut self, rest: &str, heartbeat: Duration) -> Result<()> {
        match rest.rfind('/') {
            Some(i) => {
                let base = &rest[..i];
                self.url = if base.contains("://") {
                    base.to_string()
                } else {
                    format!("https://{}", base)
                };
                self.token = rest[i + 1..].to_string();
            }
            None => {
                self.url = DEFAULT_DISCOVERY_URL.to_string();
                self.token = rest.to_string();
            }
        }
        if self.token.is_empty() {
            return Err(Error::invalid_uri(rest, "missing <token>"));
        }
        self.heartbeat = heartbeat;
        self.client = Some(http_client()?);
        Ok(())
    }

    async fn fetch(&self) -> Result<Vec<Node>> {
        fetch_nodes(self.client()?, &self.url, &self.token).await
    }

    /// Polls the service every heartbeat; failed ticks are reported to the
    /// listener and the loop continues.
    fn watch(&self, listener: Arc<dyn DiscoveryListener>) -> WatchHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let client = self.client.clone();
        let url = self.url.clone();
        let token = self.token.clone();
        let period = watch_period(self.heartbeat);

        let task = tokio::spawn(async move {
            let Some(client) = client else {
                debug!(backend = "token", "watch on uninitialized backend");
                return;
            };
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!(backend = "token", "watch stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        match fetch_nodes(&client, &url, &token).await {
                            Ok(nodes) => listener.on_change(nodes),
                            Err(e) => listener.on_error(e),
                        }
                    }
                }
            }
        });

        WatchHandle::new(shutdown_tx, task)
    }

    async fn register(&self, addr: &str) -> Result<()> {
        let endpoint = format!("{}/clusters/{}", self.url, self.token);
        let resp = self
            .client()?
            .post(&endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(addr.to_string())
            .send()
            .await
            .map_err(|e| Error::StoreWrite(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Error::StoreWrite(format!(
                "discovery service returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn initialized(rest: &str) -> TokenBackend {
        let mut backend = TokenBackend::new();
        backend
            .initialize(rest, Duration::from_millis(20))
            .await
            .unwrap();
        backend
    }

    #[tokio::test]
    async fn test_initialize_bare_token_uses_default_url() {
        let backend = initialized("deadbeef").await;
        assert_eq!(backend.url, DEFAULT_DISCOVERY_URL);
        assert_eq!(backend.token, "deadbeef");
    }

    #[tokio::test]
    async fn test_initialize_custom_base_url() {
        let backend = initialized("discovery.internal/v1/deadbeef").await;
        assert_eq!(backend.url, "https://discovery.internal/v1");
        assert_eq!(backend.token, "deadbeef");
    }

    #[tokio::test]
    async fn test_initialize_keeps_explicit_scheme() {
        let backend = initialized("http://127.0.0.1:9999/deadbeef").await;
        assert_eq!(backend.url, "http://127.0.0.1:9999");
        assert_eq!(backend.token, "deadbeef");
    }

    #[tokio::test]
    async fn test_initialize_rejects_empty_token() {
        let mut backend = TokenBackend::new();
        let err = backend
            .initialize("discovery.internal/v1/", Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing <token>"));
    }

    #[tokio::test]
    async fn test_register_then_fetch_returns_registered_node() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/clusters/tok"))
            .and(body_string("127.0.0.1:2675"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/clusters/tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec!["127.0.0.1:2675"]))
            .mount(&server)
            .await;

        let backend = initialized(&format!("{}/tok", server.uri())).await;
        backend.register("127.0.0.1:2675").await.unwrap();

        let nodes = backend.fetch().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0], Node::parse("127.0.0.1:2675").unwrap());
    }

    #[tokio::test]
    async fn test_fetch_fails_on_non_200() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/clusters/tok"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let backend = initialized(&format!("{}/tok", server.uri())).await;
        let err = backend.fetch().await.unwrap_err();
        assert!(matches!(err, Error::StoreRead(_)));
    }

    #[tokio::test]
    async fn test_create_cluster_returns_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/clusters"))
            .respond_with(ResponseTemplate::new(200).set_body_string("freshtoken"))
            .mount(&server)
            .await;

        let backend = initialized(&format!("{}/ignored", server.uri())).await;
        assert_eq!(backend.create_cluster().await.unwrap(), "freshtoken");
    }

    #[tokio::test]
    async fn test_watch_polls_until_stopped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/clusters/tok"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(vec!["10.0.0.1:2375", "10.0.0.2:2375"]),
            )
            .mount(&server)
            .await;

        let backend = initialized(&format!("{}/tok", server.uri())).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        struct Chan(mpsc::UnboundedSender<Vec<Node>>);
        impl DiscoveryListener for Chan {
            fn on_change(&self, nodes: Vec<Node>) {
                let _ = self.0.send(nodes);
            }
            fn on_error(&self, _error: Error) {}
        }

        let handle = backend.watch(Arc::new(Chan(tx)));
        let nodes = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(nodes.len(), 2);

        handle.stop().await;
    }
}
