//! Watch listener trait and adapters

use muster_common::{Error, Node};
use tracing::warn;

/// Trait for receiving membership snapshots from a watch loop.
///
/// Implement this to be notified whenever a backend observes a change under
/// its namespace. Watch loops never fail silently: failures that would
/// otherwise be swallowed inside a background task are delivered to
/// [`DiscoveryListener::on_error`].
pub trait DiscoveryListener: Send + Sync + 'static {
    /// Called with a full membership snapshot after every observed change.
    ///
    /// Snapshots replace each other wholesale; there is no diffing between
    /// consecutive calls.
    fn on_change(&self, nodes: Vec<Node>);

    /// Called when a watch cycle fails.
    ///
    /// Polling backends keep running after reporting; store-backed watch
    /// loops report once more with [`Error::WatchStream`] before giving up
    /// when their reconnect budget is exhausted.
    fn on_error(&self, error: Error);
}

/// A listener that invokes a closure for each snapshot.
///
/// Watch-cycle errors are logged and otherwise dropped; implement
/// [`DiscoveryListener`] directly when error handling matters.
pub struct FnListener<F>
where
    F: Fn(Vec<Node>) + Send + Sync + 'static,
{
    f: F,
}

impl<F> FnListener<F>
where
    F: Fn(Vec<Node>) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> DiscoveryListener for FnListener<F>
where
    F: Fn(Vec<Node>) + Send + Sync + 'static,
{
    fn on_change(&self, nodes: Vec<Node>) {
        (self.f)(nodes);
    }

    fn on_error(&self, error: Error) {
        warn!(error = %error, "discovery watch cycle failed");
    }
}
