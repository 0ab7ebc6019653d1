//! Static address-list backend (`nodes` scheme)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use muster_common::{Error, Node, Result};
use tokio::sync::mpsc;
use tracing::debug;

use crate::backend::Backend;
use crate::listener::DiscoveryListener;
use crate::watch::WatchHandle;

/// Discovery over a fixed comma-separated address list.
///
/// This is the fallback backend for URIs without a scheme, so a bare
/// `host:port,host:port` string is usable as a cluster description.
#[derive(Default)]
pub struct NodesBackend {
    nodes: Vec<Node>,
}

impl NodesBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for NodesBackend {
    fn name(&self) -> &'static str {
        "nodes"
    }

    async fn initialize(&mut self, rest: &str, _heartbeat: Duration) -> Result<()> {
        let mut nodes = Vec::new();
        for addr in rest.split(',') {
            nodes.push(Node::parse(addr)?);
        }
        self.nodes = nodes;
        Ok(())
    }

    async fn fetch(&self) -> Result<Vec<Node>> {
        Ok(self.nodes.clone())
    }

    /// A static list never changes, so the loop only waits for its stop
    /// signal. Documented limitation, not a bug.
    fn watch(&self, _listener: Arc<dyn DiscoveryListener>) -> WatchHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let task = tokio::spawn(async move {
            let _ = shutdown_rx.recv().await;
            debug!(backend = "nodes", "watch stopped");
        });
        WatchHandle::new(shutdown_tx, task)
    }

    async fn register(&self, _addr: &str) -> Result<()> {
        Err(Error::NotSupported {
            backend: "nodes",
            operation: "register",
        })
    }
}
