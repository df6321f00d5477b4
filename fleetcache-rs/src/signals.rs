//! Terminates the platform on CTRL+C or SIGHUP.
//!
//! Once the platform is terminated, the server stops accepting connections and all background
//! tasks (config monitor, command actors) wind down.
use std::sync::Arc;

use tokio::signal::unix::SignalKind;

use crate::platform::Platform;

/// Spawns a task which awaits either **CTRL+C** or **SIGHUP** and then terminates the platform.
///
/// This is called by the [Builder](crate::builder::Builder) unless it is disabled.
pub fn install(platform: Arc<Platform>) {
    crate::spawn!(async move {
        let mut sig_hup = match tokio::signal::unix::signal(SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(error) => {
                log::error!("Failed to install a handler for SIGHUP: {}", error);
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => log::info!("Received CTRL-C. Shutting down..."),
            _ = sig_hup.recv() => log::info!("Received SIGHUP. Shutting down..."),
        }

        platform.terminate();
    });
}
