//! ZooKeeper ephemeral-node backend (`zk` scheme)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use muster_common::{Error, Node, Result};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use zookeeper_client as zk;

use crate::backend::{Backend, split_store_uri};
use crate::listener::DiscoveryListener;
use crate::watch::{Reconnect, WatchHandle};

/// Every ancestor of the namespace, shallowest first: `["a", "b"]` becomes
/// `"/a"`, `"/a/b"`. ZooKeeper has no recursive create.
fn ancestors(path: &[String]) -> Vec<String> {
    (1..=path.len())
        .map(|i| format!("/{}", path[..i].join("/")))
        .collect()
}

/// Child names under the namespace are the member addresses.
fn parse_children(children: &[String]) -> Result<Vec<Node>> {
    let mut nodes = Vec::with_capacity(children.len());
    for child in children {
        nodes.push(Node::parse(child)?);
    }
    Ok(nodes)
}

/// Discovery over a ZooKeeper ensemble.
///
/// Members register as ephemeral znodes named after their address, so a
/// member whose session drops disappears from the namespace on its own.
/// ZooKeeper children watches are one-shot and must be re-installed after
/// every firing.
#[derive(Default)]
pub struct ZkBackend {
    client: Option<Arc<zk::Client>>,
    path: Vec<String>,
}

impl ZkBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> Result<Arc<zk::Client>> {
        self.client
            .clone()
            .ok_or_else(|| Error::StoreConnect("backend not initialized".to_string()))
    }

    fn fullpath(&self) -> String {
        format!("/{}", self.path.join("/"))
    }

    async fn create_full_path(&self, client: &zk::Client) -> Result<()> {
        let options = zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all());
        for level in ancestors(&self.path) {
            match client.create(&level, &[], &options).await {
                Ok(_) => {}
                // Fine, someone got there first.
                Err(zk::Error::NodeExists) => {}
                Err(e) => return Err(Error::StoreWrite(e.to_string())),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for ZkBackend {
    fn name(&self) -> &'static str {
        "zk"
    }

    /// `rest` is `host:port[,host:port...]/some/path`; the whole ensemble
    /// goes into one connect string. Every level of the namespace is created
    /// up front, tolerating nodes that already exist.
    async fn initialize(&mut self, rest: &str, _heartbeat: Duration) -> Result<()> {
        let (endpoints, path) = split_store_uri(rest)?;
        self.path = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if self.path.is_empty() {
            return Err(Error::invalid_uri(rest, "missing <path>"));
        }

        let client = zk::Client::connect(&endpoints.join(","))
            .await
            .map_err(|e| Error::StoreConnect(e.to_string()))?;
        self.create_full_path(&client).await?;

        self.client = Some(Arc::new(client));
        Ok(())
    }

    async fn fetch(&self) -> Result<Vec<Node>> {
        let client = self.client()?;
        let children = client
            .list_children(&self.fullpath())
            .await
            .map_err(|e| Error::StoreRead(e.to_string()))?;
        parse_children(&children)
    }

    /// Delivers the current children immediately, then re-installs the
    /// one-shot children watch after every firing; each re-install also
    /// refreshes the snapshot. Install failures back off and retry until
    /// the reconnect budget runs out, then surface through the listener.
    fn watch(&self, listener: Arc<dyn DiscoveryListener>) -> WatchHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let client = self.client.clone();
        let full = self.fullpath();

        let task = tokio::spawn(async move {
            let Some(client) = client else {
                debug!(backend = "zk", "watch on uninitialized backend");
                return;
            };
            let mut reconnect = Reconnect::new();
            let mut last_error = String::new();

            'outer: loop {
                match client.list_and_watch_children(&full).await {
                    Ok((children, watcher)) => {
                        reconnect.reset();
                        match parse_children(&children) {
                            Ok(nodes) => listener.on_change(nodes),
                            Err(e) => listener.on_error(e),
                        }
                        tokio::select! {
                            _ = shutdown_rx.recv() => {
                                debug!(backend = "zk", "watch stopped");
                                break 'outer;
                            }
                            _event = watcher.changed() => {
                                debug!(backend = "zk", "watch triggered");
                                // Loop re-installs the watch and refetches.
                            }
                        }
                    }
                    Err(e) => {
                        last_error = e.to_string();
                        warn!(backend = "zk", error = %last_error, "children watch failed");
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
                }
            }
        });

        WatchHandle::new(shutdown_tx, task)
    }

    /// Registration is delete-then-create rather than upsert so the entry
    /// gets a fresh ephemeral lifetime bound to this session. Two processes
    /// registering the same address race on the delete/create pair; last
    /// writer wins, and the displacement is logged rather than trusted
    /// silently.
    async fn register(&self, addr: &str) -> Result<()> {
        let client = self.client()?;
        self.create_full_path(&client).await?;

        let node_path = format!("{}/{}", self.fullpath(), addr);
        let options = zk::CreateMode::Ephemeral.with_acls(zk::Acls::anyone_all());
        match client.create(&node_path, addr.as_bytes(), &options).await {
            Ok(_) => Ok(()),
            Err(zk::Error::NodeExists) => {
                warn!(backend = "zk", path = %node_path, "displacing existing registration");
                match client.delete(&node_path, None).await {
                    Ok(()) | Err(zk::Error::NoNode) => {}
                    Err(e) => return Err(Error::StoreWrite(e.to_string())),
                }
                client
                    .create(&node_path, addr.as_bytes(), &options)
                    .await
                    .map(|_| ())
                    .map_err(|e| Error::StoreWrite(e.to_string()))
            }
            Err(e) => Err(Error::StoreWrite(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ancestors_shallowest_first() {
        let path = vec!["prod".to_string(), "agents".to_string()];
        assert_eq!(ancestors(&path), vec!["/prod", "/prod/agents"]);
    }

    #[test]
    fn test_parse_children_all_or_nothing() {
        let children = vec!["10.0.0.1:2375".to_string(), "bogus".to_string()];
        assert!(matches!(
            parse_children(&children),
            Err(Error::InvalidAddress(_))
        ));

        let children = vec!["10.0.0.1:2375".to_string(), "10.0.0.2:2375".to_string()];
        assert_eq!(parse_children(&children).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_initialize_requires_path() {
        let mut backend = ZkBackend::new();
        let err = backend
            .initialize("127.0.0.1:2181", Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing <path>"));

        let err = backend
            .initialize("127.0.0.1:2181/", Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing <path>"));
    }

    #[tokio::test]
    async fn test_fetch_before_initialize_fails() {
        let backend = ZkBackend::new();
        assert!(matches!(backend.fetch().await, Err(Error::StoreConnect(_))));
    }

    #[test]
    fn test_fullpath_joins_namespace_levels() {
        let backend = ZkBackend {
            client: None,
            path: vec!["prod".to_string(), "agents".to_string()],
        };
        assert_eq!(backend.fullpath(), "/prod/agents");
    }
}
