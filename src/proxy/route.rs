//! server-selection contract shared by the replicated router and its stats source.

/// identifies one backing cache server within a [`Route`].
pub type ServerId = u64;

/// a source of per-server memory usage, consulted for weighted selection.
pub trait Stats {
    /// current known memory usage for `server_id`, or `None` if it could not be sampled.
    fn get_mem_usage(&self, server_id: ServerId) -> Option<f64>;

    /// signal that `server_id` failed a live request, prompting an out-of-band resample.
    fn notify_server_failed(&self, server_id: ServerId);
}

/// picks one replica per key for the lifetime of a single request, remembering which
/// replicas have already failed so a retry excludes them.
pub trait Selector {
    /// mark `server_id` failed for the rest of this request and clear the cached choice.
    fn set_failed_server(&self, server_id: ServerId);

    /// the server id to use for `key`, and whether it is known-good (`false` means every
    /// candidate had already failed and the full server list was used as a fallback).
    fn select_server(&self, key: &str) -> (ServerId, bool);

    /// every server not yet marked failed, in configured order, having run live-detection
    /// via [`Selector::select_server`] first.
    fn select_servers_for_delete(&self, key: &str) -> Vec<ServerId>;

    /// clear the cached choice. the failed set persists for the selector's lifetime.
    fn reset(&self);
}

/// builds a fresh [`Selector`] for each request.
pub trait Route {
    fn new_selector(&self) -> Box<dyn Selector>;
}
