use std::io;
use thiserror::Error;

/// Errors raised synchronously by the network layer.
///
/// Asynchronous failures never show up here: a failed connect or a reset peer is
/// reported as a [`crate::network::ConnectionEvent`] instead.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("failed to bind {address}: {source}")]
    Bind { address: String, source: io::Error },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl NetworkError {
    pub fn invalid_address<A: ToString, R: ToString>(address: A, reason: R) -> Self {
        Self::InvalidAddress { address: address.to_string(), reason: reason.to_string() }
    }

    pub fn bind<A: ToString>(address: A, source: io::Error) -> Self {
        Self::Bind { address: address.to_string(), source }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}
