//! Consul blocking-query backend (`consul` scheme)

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use muster_common::{Error, Node, Result};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backend::{Backend, http_client, split_store_uri, watch_period};
use crate::listener::DiscoveryListener;
use crate::watch::{Reconnect, WatchHandle};

/// Grace added on top of the server-side wait so a long poll cannot hang
/// past its heartbeat.
const LONG_POLL_GRACE: Duration = Duration::from_secs(10);

/// One Consul KV pair, as returned by `GET /v1/kv/...`.
#[derive(Debug, Deserialize)]
struct KvPair {
    #[serde(rename = "Key")]
    key: String,

    /// Base64-encoded; absent for the namespace root marker.
    #[serde(rename = "Value")]
    value: Option<String>,
}

/// Minimal Consul KV client: list with optional blocking index, and put.
///
/// Requests rotate to the next endpoint after a transport failure, so a
/// multi-server cluster keeps answering while one server is down.
#[derive(Clone)]
struct ConsulClient {
    http: reqwest::Client,
    endpoints: Arc<Vec<String>>,
    current: Arc<AtomicUsize>,
    prefix: String,
}

impl ConsulClient {
    fn base(&self) -> String {
        let index = self.current.load(Ordering::SeqCst) % self.endpoints.len();
        let endpoint = &self.endpoints[index];
        if endpoint.contains("://") {
            endpoint.clone()
        } else {
            format!("http://{}", endpoint)
        }
    }

    fn rotate(&self) {
        let next = (self.current.load(Ordering::SeqCst) + 1) % self.endpoints.len();
        self.current.store(next, Ordering::SeqCst);
        debug!(backend = "consul", endpoint_index = next, "rotated endpoint");
    }

    /// List every key under the prefix. With `wait`, issues a blocking query
    /// against the given index, bounded by the wait duration. Returns the
    /// pairs and the `X-Consul-Index` cursor for the next blocking query.
    async fn list(&self, wait: Option<(u64, Duration)>) -> Result<(Vec<KvPair>, u64)> {
        let mut url = format!("{}/v1/kv/{}?recurse=true", self.base(), self.prefix);
        if let Some((index, wait)) = wait {
            url.push_str(&format!("&index={}&wait={}ms", index, wait.as_millis()));
        }

        let mut request = self.http.get(&url);
        if let Some((_, wait)) = wait {
            request = request.timeout(wait + LONG_POLL_GRACE);
        }

        let resp = request.send().await.map_err(|e| {
            self.rotate();
            Error::StoreRead(e.to_string())
        })?;

        let index = resp
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        match resp.status() {
            reqwest::StatusCode::NOT_FOUND => Ok((Vec::new(), index)),
            s if s.is_success() => {
                let pairs: Vec<KvPair> = resp
                    .json()
                    .await
                    .map_err(|e| Error::StoreRead(e.to_string()))?;
                Ok((pairs, index))
            }
            s => Err(Error::StoreRead(format!("consul returned {}", s))),
        }
    }

    async fn put(&self, key: &str, body: &str) -> Result<()> {
        let url = format!("{}/v1/kv/{}", self.base(), key);
        let resp = self
            .http
            .put(&url)
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| {
                self.rotate();
                Error::StoreWrite(e.to_string())
            })?;
        if !resp.status().is_success() {
            return Err(Error::StoreWrite(format!("consul returned {}", resp.status())));
        }
        Ok(())
    }

    /// Full membership snapshot: list, skip the root marker, decode each
    /// value. One malformed entry fails the whole snapshot.
    async fn fetch_nodes(&self) -> Result<Vec<Node>> {
        let (pairs, _) = self.list(None).await?;
        let mut nodes = Vec::new();
        for pair in pairs {
            if pair.key == self.prefix {
                continue;
            }
            let decoded = BASE64
                .decode(pair.value.as_deref().unwrap_or_default())
                .map_err(|e| Error::StoreRead(format!("invalid value at '{}': {}", pair.key, e)))?;
            let addr = String::from_utf8(decoded)
                .map_err(|e| Error::StoreRead(format!("invalid value at '{}': {}", pair.key, e)))?;
            nodes.push(Node::parse(&addr)?);
        }
        Ok(nodes)
    }
}

/// Discovery over the Consul KV store.
///
/// Members live as `<namespace>/<addr> -> addr` keys; change detection uses
/// Consul blocking queries with the `X-Consul-Index` cursor, bounded by the
/// heartbeat as the server-side wait.
#[derive(Default)]
pub struct ConsulBackend {
    client: Option<ConsulClient>,
    prefix: String,
    heartbeat: Duration,
    last_index: u64,
}

impl ConsulBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> Result<&ConsulClient> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::StoreConnect("backend not initialized".to_string()))
    }
}

fn as_connect_error(e: Error) -> Error {
    match e {
        Error::StoreRead(msg) | Error::StoreWrite(msg) => Error::StoreConnect(msg),
        other => other,
    }
}

#[async_trait]
impl Backend for ConsulBackend {
    fn name(&self) -> &'static str {
        "consul"
    }

    /// `rest` is `host:port[,host:port...]/namespace`. The namespace root
    /// marker is written up front ("already exists" is an upsert here) and
    /// the initial blocking-query cursor is captured.
    async fn initialize(&mut self, rest: &str, heartbeat: Duration) -> Result<()> {
        let (endpoints, path) = split_store_uri(rest)?;
        self.prefix = format!("{}/", path.trim_end_matches('/'));
        self.heartbeat = heartbeat;

        let client = ConsulClient {
            http: http_client()?,
            endpoints: Arc::new(endpoints),
            current: Arc::new(AtomicUsize::new(0)),
            prefix: self.prefix.clone(),
        };

        let prefix = client.prefix.clone();
        client.put(&prefix, "").await.map_err(as_connect_error)?;
        let (_, index) = client.list(None).await.map_err(as_connect_error)?;

        self.last_index = index;
        self.client = Some(client);
        Ok(())
    }

    async fn fetch(&self) -> Result<Vec<Node>> {
        self.client()?.fetch_nodes().await
    }

    /// Long-polls the namespace with the index cursor; every return (change
    /// or server-side wait timeout) refreshes the snapshot. Failed polls
    /// back off and reconnect; an exhausted budget is surfaced through the
    /// listener before the loop ends.
    fn watch(&self, listener: Arc<dyn DiscoveryListener>) -> WatchHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let client = self.client.clone();
        let wait = watch_period(self.heartbeat);
        let start_index = self.last_index;

        let task = tokio::spawn(async move {
            let Some(client) = client else {
                debug!(backend = "consul", "watch on uninitialized backend");
                return;
            };
            let mut cursor = start_index;
            let mut reconnect = Reconnect::new();

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!(backend = "consul", "watch stopped");
                        break;
                    }
                    result = client.list(Some((cursor, wait))) => match result {
                        Ok((_, index)) => {
                            reconnect.reset();
                            cursor = index;
                            debug!(backend = "consul", index, "watch triggered");
                            match client.fetch_nodes().await {
                                Ok(nodes) => listener.on_change(nodes),
                                Err(e) => listener.on_error(e),
                            }
                        }
                        Err(e) => {
                            warn!(backend = "consul", error = %e, "blocking query failed");
                            match reconnect.next_delay() {
                                Some(delay) => {
                                    tokio::select! {
                                        _ = shutdown_rx.recv() => break,
                                        _ = tokio::time::sleep(delay) => {}
                                    }
                                }
                                None => {
                                    listener.on_error(Error::WatchStream(e.to_string()));
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        });

        WatchHandle::new(shutdown_tx, task)
    }

    async fn register(&self, addr: &str) -> Result<()> {
        let client = self.client()?;
        let key = format!("{}{}", self.prefix, addr);
        client.put(&key, addr).await
    }
}
