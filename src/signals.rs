//! Process signals
//!
//! SIGTERM and SIGINT request termination, SIGHUP a configuration reload.
//! The listeners run on a small tokio runtime on their own thread and only
//! flip the flags of a [`ControlHandle`].

use egunctl_bridge::ControlHandle;
use std::thread::{self, JoinHandle};

/// Start listening for signals. The listener thread runs for the rest of
/// the process.
pub fn install(control: ControlHandle) -> anyhow::Result<JoinHandle<()>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    // Register before returning so no signal is missed
    let listeners = {
        let _guard = runtime.enter();
        Listeners::register()?
    };

    let handle = thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || runtime.block_on(listeners.run(control)))?;
    Ok(handle)
}

#[cfg(unix)]
struct Listeners {
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Listeners {
    fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    async fn run(mut self, control: ControlHandle) {
        loop {
            tokio::select! {
                _ = self.terminate.recv() => {
                    tracing::info!("SIGTERM received, terminating");
                    control.request_terminate();
                }
                _ = self.interrupt.recv() => {
                    tracing::info!("SIGINT received, terminating");
                    control.request_terminate();
                }
                _ = self.hangup.recv() => {
                    tracing::info!("SIGHUP received, reloading configuration");
                    control.request_reload();
                }
            }
        }
    }
}

#[cfg(not(unix))]
struct Listeners;

#[cfg(not(unix))]
impl Listeners {
    fn register() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn run(self, control: ControlHandle) {
        while tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, terminating");
            control.request_terminate();
        }
    }
}
