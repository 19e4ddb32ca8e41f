//! replication and server-selection layer sitting above a single-server [`CacheClient`](crate::CacheClient).

pub mod pipeline;
pub mod replicated;
pub mod route;
pub mod stats;

pub use pipeline::{ProxyCacheClient, ProxyPipeline};
pub use replicated::{default_rand_factory, RandFunc, RandomFactory, ReplicatedRoute, ReplicatedSelector, RAND_MAX};
pub use route::{Route, Selector, ServerId, Stats};
pub use stats::{MemLogger, ServerStats};
