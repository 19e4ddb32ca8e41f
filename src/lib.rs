//! a strongly consistent, lease based client side cache.
//!
//! a [`CacheClient`] opens pipelines against one or more Redis-compatible servers. every
//! pipeline accumulates `lease_get`/`lease_set`/`delete` calls and flushes them in
//! batched round trips, so independent cache-aside fetches issued in the same tick of a
//! request still cost one GET and one SET. the [`proxy`] module adds weighted,
//! memory-aware replica selection with automatic retry on top of a plain single-server
//! client.
#![forbid(unsafe_code)]

mod client;
mod pool;
mod session;

pub mod config;
pub mod error;
pub mod item;
pub mod pipeline;
pub mod proxy;

pub use self::{
    client::{RedisClient, RedisPipeline, NEXT_CAS_KEY},
    config::Config,
    error::Error,
    item::{Item, ItemCodec, MultiGetFiller},
    pipeline::{CacheClient, DeleteOutcome, Deferred, LeaseGetOutcome, LeaseSetOutcome, Pipeline},
    pool::ObjectPool,
    session::Session,
};

#[cfg(feature = "json")]
pub use item::new_json_codec;

/// extension points for building alternate transports, routing strategies or stats
/// sources against this crate's own contracts.
pub mod dev {
    pub use crate::proxy::route::{Route, Selector, ServerId, Stats};
}
