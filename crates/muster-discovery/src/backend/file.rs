//! File-polling backend (`file` scheme)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use muster_common::{Error, Node, Result};
use tokio::sync::mpsc;
use tracing::debug;

use crate::backend::{Backend, watch_period};
use crate::listener::DiscoveryListener;
use crate::watch::WatchHandle;

/// Discovery over a locally-editable address file: one `host:port` per
/// line, blank lines ignored.
///
/// The file is re-read in full on every fetch, so edits take effect on the
/// next heartbeat without any registration protocol.
#[derive(Default)]
pub struct FileBackend {
    path: PathBuf,
    heartbeat: Duration,
}

impl FileBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

async fn read_nodes(path: &PathBuf) -> Result<Vec<Node>> {
    let data = tokio::fs::read_to_string(path).await?;
    let mut nodes = Vec::new();
    for line in data.lines() {
        if line.trim().is_empty() {
            continue;
        }
        nodes.push(Node::parse(line)?);
    }
    Ok(nodes)
}

#[async_trait]
impl Backend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    /// Stores the path and interval; no I/O happens until the first fetch.
    async fn initialize(&mut self, rest: &str, heartbeat: Duration) -> Result<()> {
        self.path = PathBuf::from(rest);
        self.heartbeat = heartbeat;
        Ok(())
    }

    async fn fetch(&self) -> Result<Vec<Node>> {
        read_nodes(&self.path).await
    }

    /// Polls the file every heartbeat. A failed tick is reported to the
    /// listener and the loop carries on at the next interval; a locally
    /// edited file is expected to be transiently unreadable or half-written.
    fn watch(&self, listener: Arc<dyn DiscoveryListener>) -> WatchHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let path = self.path.clone();
        let period = watch_period(self.heartbeat);

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!(backend = "file", "watch stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        match read_nodes(&path).await {
                            Ok(nodes) => listener.on_change(nodes),
                            Err(e) => listener.on_error(e),
                        }
                    }
                }
            }
        });

        WatchHandle::new(shutdown_tx, task)
    }

    async fn register(&self, _addr: &str) -> Result<()> {
        Err(Error::NotSupported {
            backend: "file",
            operation: "register",
        })
    }
}
