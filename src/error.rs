//! public facing error type and small marker types for typed error handling.

use core::{
    fmt,
    ops::{Deref, DerefMut},
};

use std::error;

/// public facing error type. providing basic format and display based error handling.
///
/// for typed based error handling runtime type cast is needed with the help of other
/// public error types offered by this module.
///
/// # Example
/// ```rust
/// use leasecache::error::{Error, Transport};
///
/// fn is_transport_down(e: Error) -> bool {
///     e.downcast_ref::<Transport>().is_some()
/// }
/// ```
pub struct Error(Box<dyn error::Error + Send + Sync>);

impl Error {
    /// true when this error originated from a failed round-trip to a cache server rather
    /// than from an application-level protocol outcome.
    pub fn is_transport_down(&self) -> bool {
        self.0.is::<Transport>()
    }

    pub(crate) fn transport(e: redis::RedisError) -> Self {
        Self(Box::new(Transport(e)))
    }

    pub(crate) fn malformed_cas(body: impl Into<String>) -> Self {
        Self(Box::new(MalformedCas(body.into())))
    }
}

impl Deref for Error {
    type Target = dyn error::Error + Send + Sync;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl DerefMut for Error {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.0
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.0.source()
    }
}

/// a round-trip to a backing cache server failed. every deferred belonging to the batch
/// that carried this call resolves to an ERROR outcome with the same underlying message.
#[derive(Debug)]
pub struct Transport(redis::RedisError);

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cache transport error: {}", self.0)
    }
}

impl error::Error for Transport {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&self.0)
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Self::transport(e)
    }
}

/// a `cas:` prefixed wire value whose suffix did not parse as a non-negative integer.
#[derive(Debug)]
pub struct MalformedCas(pub String);

impl fmt::Display for MalformedCas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed lease cas body: {:?}", self.0)
    }
}

impl error::Error for MalformedCas {}

impl From<MalformedCas> for Error {
    fn from(e: MalformedCas) -> Self {
        Self(Box::new(e))
    }
}

/// route construction was given zero server ids.
#[derive(Debug, Default)]
pub struct EmptyServerList;

impl fmt::Display for EmptyServerList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("replicated route requires at least one server id")
    }
}

impl error::Error for EmptyServerList {}

impl From<EmptyServerList> for Error {
    fn from(e: EmptyServerList) -> Self {
        Self(Box::new(e))
    }
}

/// rejected [`Config`](crate::Config) values, returned from `Config::build`.
#[derive(Debug)]
pub enum ConfigError {
    /// `min_ttl` was greater than `max_ttl`.
    TtlRange { min_ttl: u64, max_ttl: u64 },
    /// `max_keys_per_batch` was zero.
    ZeroBatchSize,
    /// `sleep_min` was greater than `sleep_max`.
    SleepRange { sleep_min: u64, sleep_max: u64 },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::TtlRange { min_ttl, max_ttl } => {
                write!(f, "min_ttl ({min_ttl}) must not be greater than max_ttl ({max_ttl})")
            }
            Self::ZeroBatchSize => f.write_str("max_keys_per_batch must be at least 1"),
            Self::SleepRange { sleep_min, sleep_max } => {
                write!(f, "sleep_min ({sleep_min}) must not be greater than sleep_max ({sleep_max})")
            }
        }
    }
}

impl error::Error for ConfigError {}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self(Box::new(e))
    }
}
