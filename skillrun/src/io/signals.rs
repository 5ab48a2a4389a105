//! Cooperative interrupt flag driven by SIGINT/SIGTERM.
//!
//! The scheduler polls [`InterruptFlag`] at the start of each turn. A second
//! signal while a run is still winding down exits the process immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::exit_codes;

#[derive(Debug, Clone, Default)]
pub struct InterruptFlag {
    requested: Arc<AtomicBool>,
    signal_name: Arc<Mutex<Option<String>>>,
}

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the run as interrupted. Returns `true` if it already was.
    pub fn request(&self, signal_name: &str) -> bool {
        if let Ok(mut name) = self.signal_name.lock() {
            name.get_or_insert_with(|| signal_name.to_string());
        }
        self.requested.swap(true, Ordering::SeqCst)
    }

    /// Forget an earlier request so the next run starts uninterrupted.
    pub fn clear(&self) {
        if let Ok(mut name) = self.signal_name.lock() {
            *name = None;
        }
        self.requested.store(false, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn signal_name(&self) -> Option<String> {
        self.signal_name.lock().ok().and_then(|name| name.clone())
    }
}

/// Spawn a listener thread that sets `flag` on SIGINT/SIGTERM.
pub fn install_signal_handlers(flag: &InterruptFlag) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    let flag = flag.clone();
    thread::Builder::new()
        .name("skillrun-signals".to_string())
        .spawn(move || runtime.block_on(listen(flag)))
        .context("spawn signal listener")?;
    Ok(())
}

async fn listen(flag: InterruptFlag) {
    #[cfg(unix)]
    let mut terminate =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(stream) => Some(stream),
            Err(err) => {
                warn!(%err, "SIGTERM listener unavailable");
                None
            }
        };

    loop {
        #[cfg(unix)]
        let name = tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => "SIGINT",
                Err(err) => {
                    warn!(%err, "SIGINT listener failed");
                    return;
                }
            },
            Some(()) = async {
                match terminate.as_mut() {
                    Some(stream) => stream.recv().await,
                    None => std::future::pending().await,
                }
            } => "SIGTERM",
        };
        #[cfg(not(unix))]
        let name = match tokio::signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            Err(err) => {
                warn!(%err, "SIGINT listener failed");
                return;
            }
        };

        if flag.request(name) {
            warn!(signal = name, "second signal received, exiting");
            std::process::exit(exit_codes::INTERRUPTED);
        }
        info!(signal = name, "interrupt requested; stopping at next turn");
    }
}
