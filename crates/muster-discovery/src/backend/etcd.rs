//! etcd TTL-key backend (`etcd` scheme)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions, PutOptions, WatchOptions};
use muster_common::{Error, Node, Result};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backend::{Backend, CONNECT_TIMEOUT, split_store_uri};
use crate::listener::DiscoveryListener;
use crate::watch::{Reconnect, WatchHandle};

/// Lease TTL for a registration: 1.5x the heartbeat, rounded down, so an
/// entry survives one missed re-registration but not two. etcd rejects
/// zero-second leases, hence the floor of one.
fn register_ttl(heartbeat: Duration) -> i64 {
    ((heartbeat.as_secs() * 3 / 2) as i64).max(1)
}

async fn fetch_nodes(client: &mut Client, prefix: &str) -> Result<Vec<Node>> {
    let resp = client
        .get(prefix, Some(GetOptions::new().with_prefix()))
        .await
        .map_err(|e| Error::StoreRead(e.to_string()))?;

    let mut nodes = Vec::new();
    for kv in resp.kvs() {
        let key = kv.key_str().map_err(|e| Error::StoreRead(e.to_string()))?;
        if key == prefix {
            continue;
        }
        let value = kv.value_str().map_err(|e| Error::StoreRead(e.to_string()))?;
        nodes.push(Node::parse(value)?);
    }
    Ok(nodes)
}

/// Discovery over etcd.
///
/// Members live as `<namespace><addr> -> addr` keys bound to a lease, so a
/// member that stops re-registering expires on its own. Change detection is
/// a single watch stream opened with the namespace prefix.
#[derive(Default)]
pub struct EtcdBackend {
    client: Option<Client>,
    prefix: String,
    heartbeat: Duration,
}

impl EtcdBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> Result<Client> {
        self.client
            .clone()
            .ok_or_else(|| Error::StoreConnect("backend not initialized".to_string()))
    }
}

#[async_trait]
impl Backend for EtcdBackend {
    fn name(&self) -> &'static str {
        "etcd"
    }

    /// `rest` is `host:port[,host:port...]/namespace`. The namespace root
    /// marker is written up front; a plain put is create-or-keep here.
    async fn initialize(&mut self, rest: &str, heartbeat: Duration) -> Result<()> {
        let (endpoints, path) = split_store_uri(rest)?;
        self.prefix = format!("/{}/", path.trim_matches('/'));
        self.heartbeat = heartbeat;

        let options = ConnectOptions::new().with_connect_timeout(CONNECT_TIMEOUT);
        let mut client = Client::connect(endpoints, Some(options))
            .await
            .map_err(|e| Error::StoreConnect(e.to_string()))?;

        client
            .put(self.prefix.clone(), "", None)
            .await
            .map_err(|e| Error::StoreConnect(e.to_string()))?;

        self.client = Some(client);
        Ok(())
    }

    async fn fetch(&self) -> Result<Vec<Node>> {
        let mut client = self.client()?;
        fetch_nodes(&mut client, &self.prefix).await
    }

    /// One persistent watch stream per loop; every event batch triggers a
    /// full refetch. A broken stream is reopened with backoff until the
    /// reconnect budget runs out, at which point the failure is surfaced
    /// through the listener and the loop ends.
    fn watch(&self, listener: Arc<dyn DiscoveryListener>) -> WatchHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let client = self.client.clone();
        let prefix = self.prefix.clone();

        let task = tokio::spawn(async move {
            let Some(mut client) = client else {
                debug!(backend = "etcd", "watch on uninitialized backend");
                return;
            };
            let mut reconnect = Reconnect::new();
            let mut last_error = String::new();

            'outer: loop {
                match client
                    .watch(prefix.clone(), Some(WatchOptions::new().with_prefix()))
                    .await
                {
                    Ok((_watcher, mut stream)) => {
                        reconnect.reset();
                        'stream: loop {
                            tokio::select! {
                                _ = shutdown_rx.recv() => {
                                    debug!(backend = "etcd", "watch stopped");
                                    break 'outer;
                                }
                                message = stream.message() => match message {
                                    Ok(Some(_event)) => {
                                        debug!(backend = "etcd", "watch triggered");
                                        match fetch_nodes(&mut client, &prefix).await {
                                            Ok(nodes) => listener.on_change(nodes),
                                            Err(e) => listener.on_error(e),
                                        }
                                    }
                                    Ok(None) => {
                                        last_error = "watch stream closed".to_string();
                                        break 'stream;
                                    }
                                    Err(e) => {
                                        last_error = e.to_string();
                                        break 'stream;
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => last_error = e.to_string(),
                }

                warn!(backend = "etcd", error = %last_error, "watch stream failed");
                match reconnect.next_delay() {
                    Some(delay) => {
                        tokio::select! {
                            _ = shutdown_rx.recv() => break 'outer,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => {
                        listener.on_error(Error::WatchStream(last_error.clone()));
                        break 'outer;
                    }
                }
            }
        });

        WatchHandle::new(shutdown_tx, task)
    }

    /// Writes the entry under a fresh lease so it expires automatically if
    /// the member stops re-registering on its heartbeat.
    async fn register(&self, addr: &str) -> Result<()> {
        let mut client = self.client()?;
        let lease = client
            .lease_grant(register_ttl(self.heartbeat), None)
            .await
            .map_err(|e| Error::StoreWrite(e.to_string()))?;
        client
            .put(
                format!("{}{}", self.prefix, addr),
                addr,
                Some(PutOptions::new().with_lease(lease.id())),
            )
            .await
            .map_err(|e| Error::StoreWrite(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_ttl_is_one_and_a_half_heartbeats() {
        assert_eq!(register_ttl(Duration::from_secs(10)), 15);
        assert_eq!(register_ttl(Duration::from_secs(3)), 4); // rounded down
        assert_eq!(register_ttl(Duration::from_secs(1)), 1);
        assert_eq!(register_ttl(Duration::ZERO), 1);
    }

    #[tokio::test]
    async fn test_initialize_requires_path() {
        let mut backend = EtcdBackend::new();
        let err = backend
            .initialize("127.0.0.1:2379", Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing <path>"));
    }

    #[tokio::test]
    async fn test_initialize_sets_namespace_before_connect_error() {
        let mut backend = EtcdBackend::new();
        let err = backend
            .initialize("127.0.0.1:1/path", Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StoreConnect(_)));
        assert_eq!(backend.prefix, "/path/");
    }

    #[tokio::test]
    async fn test_initialize_normalizes_nested_path() {
        let mut backend = EtcdBackend::new();
        let _ = backend
            .initialize("127.0.0.1:1/prod/agents/", Duration::ZERO)
            .await;
        assert_eq!(backend.prefix, "/prod/agents/");
    }

    #[tokio::test]
    async fn test_fetch_before_initialize_fails() {
        let backend = EtcdBackend::new();
        assert!(matches!(
            backend.fetch().await,
            Err(Error::StoreConnect(_))
        ));
    }
}
