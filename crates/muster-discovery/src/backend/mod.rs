//! The backend contract shared by every discovery implementation

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use muster_common::{Error, Node, Result};

use crate::listener::DiscoveryListener;
use crate::watch::WatchHandle;

pub mod consul;
pub mod etcd;
pub mod file;
pub mod nodes;
pub mod token;
pub mod zookeeper;

/// Heartbeat used by watch loops when the caller passed a zero interval.
pub(crate) const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(10);

/// Connect timeout applied to every store client this crate builds.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// One discovery backend.
///
/// A backend is constructed blank by its registry factory and brought to
/// life by `initialize`; after that, `fetch`, `watch` and `register` are the
/// whole caller-facing surface. Initialization errors are fatal and
/// synchronous; watch-loop errors flow through the listener instead.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Scheme name, used as a log field.
    fn name(&self) -> &'static str;

    /// Configure the backend from the non-scheme part of a discovery URI
    /// and the caller's heartbeat interval.
    async fn initialize(&mut self, rest: &str, heartbeat: Duration) -> Result<()>;

    /// Return the current member list as one full snapshot.
    async fn fetch(&self) -> Result<Vec<Node>>;

    /// Spawn a background loop that delivers a fresh snapshot to `listener`
    /// whenever the backing store reports a change.
    fn watch(&self, listener: Arc<dyn DiscoveryListener>) -> WatchHandle;

    /// Advertise `addr` as a cluster member.
    async fn register(&self, addr: &str) -> Result<()>;
}

/// Split the `rest` of a store URI into `(endpoints, namespace path)`.
///
/// Store URIs look like `host1:port,host2:port/some/path`; the first `/`
/// separates the endpoint list from the namespace. A missing path is an
/// `InvalidUri` error.
pub(crate) fn split_store_uri(rest: &str) -> Result<(Vec<String>, &str)> {
    let (addrs, path) = rest
        .split_once('/')
        .ok_or_else(|| Error::invalid_uri(rest, "missing <path>"))?;
    let endpoints = addrs.split(',').map(str::to_string).collect();
    Ok((endpoints, path))
}

/// Effective watch period: the caller's heartbeat, or the default when zero.
pub(crate) fn watch_period(heartbeat: Duration) -> Duration {
    if heartbeat.is_zero() {
        DEFAULT_HEARTBEAT
    } else {
        heartbeat
    }
}

/// Build the HTTP client used by the token and consul backends.
pub(crate) fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| Error::StoreConnect(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_store_uri() {
        let (endpoints, path) = split_store_uri("127.0.0.1:8500/cluster").unwrap();
        assert_eq!(endpoints, vec!["127.0.0.1:8500".to_string()]);
        assert_eq!(path, "cluster");
    }

    #[test]
    fn test_split_store_uri_multiple_endpoints() {
        let (endpoints, path) =
            split_store_uri("192.168.0.1:2181,192.168.0.2:2181/prod/agents").unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(path, "prod/agents");
    }

    #[test]
    fn test_split_store_uri_missing_path() {
        let err = split_store_uri("127.0.0.1").unwrap_err();
        assert!(err.to_string().contains("missing <path>"));
    }

    #[test]
    fn test_watch_period_defaults_zero() {
        assert_eq!(watch_period(Duration::ZERO), DEFAULT_HEARTBEAT);
        assert_eq!(
            watch_period(Duration::from_secs(3)),
            Duration::from_secs(3)
        );
    }
}
