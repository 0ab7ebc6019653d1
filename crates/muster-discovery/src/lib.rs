//! Muster discovery - pluggable cluster node discovery
//!
//! This crate lets a group of hosts discover each other's network addresses
//! through interchangeable backing stores, all behind one contract:
//! fetch the current member list, register an address, and watch for changes.
//!
//! Built-in backends:
//! - `nodes`: a fixed comma-separated address list
//! - `file`: a locally-editable address file, polled on a heartbeat
//! - `token`: a hosted cluster-token HTTP service, polled on a heartbeat
//! - `consul`: Consul KV with blocking queries
//! - `etcd`: etcd leases and watch streams
//! - `zk`: ZooKeeper ephemeral nodes and children watches
//!
//! Backends are selected by URI scheme through a [`Registry`] built at
//! startup; a bare address list without a scheme resolves to `nodes`.

pub mod backend;
pub mod listener;
pub mod registry;
pub mod watch;

pub use backend::{Backend, file::FileBackend, nodes::NodesBackend, token::TokenBackend};
pub use backend::{consul::ConsulBackend, etcd::EtcdBackend, zookeeper::ZkBackend};
pub use listener::{DiscoveryListener, FnListener};
pub use registry::{Registry, resolve};
pub use watch::WatchHandle;

// Shared surface re-exported for consumers
pub use muster_common::{Error, Node, Result};
