use std::hash::Hash;

/// A client identity admitted by the rate limiter.
///
/// Clients key the per-client reservation map, so they must be hashable and
/// comparable. The one lifecycle capability the limiter relies on is
/// [`on_close`](ErlClient::on_close): the registered callback must run
/// exactly once when the client disconnects, so the limiter can reclaim the
/// client's reserved capacity.
pub trait ErlClient: Clone + Eq + Hash + Send + Sync + 'static {
    /// Register a callback to run when this client disconnects.
    fn on_close(&self, callback: Box<dyn FnOnce() + Send + 'static>);
}
