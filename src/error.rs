//! Error types shared by the client and server engines.
//!
//! Only resource-acquisition failures surface as errors. Transient network
//! failures, timeouts and mismatched replies are retried inside the engines
//! and never reach the caller.

use std::io;
use thiserror::Error;

/// Failure to bring an engine (or one of its lanes) up.
#[derive(Debug, Error)]
pub enum HelloError {
    /// The server host name could not be resolved.
    #[error("unknown host '{host}': {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    /// A socket could not be opened, configured or bound.
    #[error("{context}: {source}")]
    Socket {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The readiness multiplexer could not be opened or polled.
    #[error("{context}: {source}")]
    Poll {
        context: String,
        #[source]
        source: io::Error,
    },

    /// A worker or event-loop thread could not be spawned.
    #[error("cannot spawn thread: {0}")]
    Spawn(#[source] io::Error),

    /// Rejected configuration values.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl HelloError {
    pub(crate) fn socket(context: impl Into<String>, source: io::Error) -> Self {
        HelloError::Socket {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn poll(context: impl Into<String>, source: io::Error) -> Self {
        HelloError::Poll {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, HelloError>;
