//! Error types for the pre-flight components

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while acquiring or releasing the instance lock
///
/// Contention with a live competing instance is not an error; it is
/// reported through [`crate::instance_lock::LockOutcome::Rejected`].
#[derive(Error, Debug)]
pub enum LockError {
    /// Lock file could not be read, written, or removed for a reason other
    /// than absence
    #[error("lock file {path} is not accessible: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Termination request against a live competing owner failed
    #[error("failed to terminate competing instance (PID {pid}): {source}")]
    Kill {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// Errors raised while constructing a pinned-certificate HTTPS client
///
/// All variants are configuration failures: no client value exists when
/// any of them is returned. Per-handshake verification failures surface
/// later, as transport errors on the requests themselves.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The supplied trust anchor did not parse as a PEM certificate
    #[error("invalid pinned certificate: {0}")]
    InvalidCertificate(String),

    /// The TLS configuration was rejected by the TLS backend
    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] rustls::Error),

    /// The HTTP client, including its cookie store, could not be built
    #[error("failed to build HTTPS client: {0}")]
    Client(#[from] reqwest::Error),
}
