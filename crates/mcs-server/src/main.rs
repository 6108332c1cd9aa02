//! MATLAB MCP core server entry point
//!
//! Establishes the singleton guarantee before anything else runs: acquires
//! the host-wide instance lock, terminating a lingering predecessor so a
//! client restart always gets a fresh server, then holds the lock until
//! the process is interrupted and releases it on the way out.

use std::process::ExitCode;
use std::sync::mpsc;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mcs_core::{InstanceLock, LockOutcome};

fn main() -> ExitCode {
    init_logging();

    let lock = InstanceLock::new();

    // Take over from any existing instance so a restart gets a fresh server.
    match lock.acquire(true) {
        Ok(LockOutcome::Acquired) => {
            tracing::info!("Instance lock acquired (PID {})", std::process::id());
        }
        Ok(LockOutcome::Rejected { pid }) => {
            // Shouldn't happen with takeover enabled, but handle it anyway.
            eprintln!(
                "MATLAB MCP core server is already running (PID {}). Only one instance is allowed.",
                pid
            );
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            tracing::error!("Failed to acquire instance lock: {}", e);
            return ExitCode::FAILURE;
        }
    }

    let status = match wait_for_shutdown() {
        Ok(()) => {
            tracing::info!("Shutdown signal received, stopping");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("Failed to wait for shutdown: {:#}", e);
            ExitCode::FAILURE
        }
    };

    if let Err(e) = lock.release() {
        tracing::warn!("Failed to release instance lock on exit: {}", e);
    }

    status
}

/// Initialize logging on stderr, leaving stdout free for protocol traffic
fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Block until the process receives an interrupt
fn wait_for_shutdown() -> Result<()> {
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("Failed to set signal handler")?;

    let _ = rx.recv();
    Ok(())
}
