//! lease-based pipeline contract shared by the single-server Redis backend and the
//! replicated proxy.
//!
//! a [`Pipeline`] accepts `lease_get`/`lease_set`/`delete` calls, accumulates them into
//! a pending batch, and flushes the batch upon first result observation or an explicit
//! [`Pipeline::finish`]. every call returns a deferred: a boxed closure that, once
//! invoked, drains the owning session (triggering the flush) and yields the outcome for
//! that particular call.

use super::session::Session;

/// outcome of a `lease_get`. `Found` and `LeaseGranted` are mutually exclusive per key:
/// the cache server either already holds a value, or it handed out a fresh lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseGetOutcome {
    /// the key was present. its value may be an empty byte string.
    Found(Vec<u8>),
    /// no value was present; the server granted a lease identified by this CAS.
    /// a subsequent `lease_set` presenting the same CAS may fill the key.
    LeaseGranted(u64),
    /// the call could not be completed; describes why.
    Error(String),
}

/// outcome of a `lease_set`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseSetOutcome {
    Ok,
    NotFound,
    /// the presented CAS no longer matches the lease held by the server.
    CasMismatch,
    Error(String),
}

/// outcome of a `delete`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Ok,
    NotFound,
    Error(String),
}

/// a boxed continuation producing `T` once its owning batch has been flushed.
pub type Deferred<T> = Box<dyn FnOnce() -> T>;

/// single-server or proxying accumulator of lease-get/lease-set/delete calls.
///
/// object-safe by design: the replicated proxy and any test fake hold pipelines as
/// `Box<dyn Pipeline>` behind a common [`CacheClient`].
pub trait Pipeline {
    /// schedule a lease-get for `key`. realizing the returned deferred drains
    /// [`Pipeline::lower_session`]'s higher-priority session, flushing the batch.
    fn lease_get(&self, key: &str) -> Deferred<LeaseGetOutcome>;

    /// schedule a lease-set for `key` presenting `cas` and `data`. the pipeline picks
    /// the SET's TTL uniformly from its configured range.
    fn lease_set(&self, key: &str, cas: u64, data: Vec<u8>) -> Deferred<LeaseSetOutcome>;

    /// schedule a delete for `key`.
    fn delete(&self, key: &str) -> Deferred<DeleteOutcome>;

    /// the session fill/set-back continuations scheduled by the item layer belong on,
    /// strictly below this pipeline's own accumulation/flush bookkeeping.
    fn lower_session(&self) -> Session;

    /// flush any pending batch. idempotent.
    fn finish(&self);
}

/// a factory for [`Pipeline`]s bound to one or more backing cache servers.
pub trait CacheClient {
    /// start a new pipeline. when `sess` is supplied the pipeline schedules its
    /// bookkeeping continuations there instead of allocating a fresh [`Session`],
    /// letting several pipelines share one request-scoped priority chain.
    fn pipeline(&self, sess: Option<Session>) -> Box<dyn Pipeline>;
}

const CAS_PREFIX: &[u8] = b"cas:";
const VAL_PREFIX: &[u8] = b"val:";

/// decode a raw GET reply body into a [`LeaseGetOutcome`], per the wire envelope: a
/// `cas:<decimal>` body is a held lease, a `val:`-prefixed body is a stored value with
/// the prefix stripped, and anything else is a stored value verbatim.
pub(crate) fn decode_get_body(raw: &[u8]) -> LeaseGetOutcome {
    if let Some(body) = raw.strip_prefix(CAS_PREFIX) {
        return match std::str::from_utf8(body).ok().and_then(|s| s.parse::<u64>().ok()) {
            Some(cas) => LeaseGetOutcome::LeaseGranted(cas),
            None => LeaseGetOutcome::Error(format!(
                "malformed lease cas body: {:?}",
                String::from_utf8_lossy(body)
            )),
        };
    }

    let body = raw.strip_prefix(VAL_PREFIX).unwrap_or(raw);
    LeaseGetOutcome::Found(body.to_vec())
}
