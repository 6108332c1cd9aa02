//! mcs-core: Pre-flight guarantees for the MATLAB MCP core server
//!
//! This crate provides the two guarantees the server establishes before it
//! serves traffic: a cross-process singleton lock keyed by a well-known
//! lock file, and an HTTPS client factory whose clients trust exactly one
//! operator-supplied self-signed certificate.

pub mod error;
pub mod instance_lock;
pub mod process;
pub mod transport;

pub use error::{LockError, TransportError};
pub use instance_lock::{InstanceLock, LockOutcome};
pub use process::{ProcessControl, SystemProcesses};
pub use transport::{client_for_pinned_certificate, SkewTolerantVerifier};
