use crate::VmError;
use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{Pid, getpid};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Owns the process-level signal handling for the launcher.
///
/// SIGTERM and SIGINT turn into a shutdown request. When running as PID 1
/// inside a container, exited children are also reaped on SIGCHLD.
pub struct Supervisor {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Register signal listeners. Must be called inside a tokio runtime.
    ///
    /// # Errors
    /// Returns `VmError::Signal` if a signal stream cannot be registered.
    pub fn install() -> Result<Self, VmError> {
        let mut supervisor = Self::detached();

        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| VmError::Signal(format!("SIGTERM handler: {e}")))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| VmError::Signal(format!("SIGINT handler: {e}")))?;
        let tx = supervisor.shutdown_tx.clone();
        supervisor.tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                _ = sigint.recv() => info!("received SIGINT, shutting down"),
            }
            tx.send_replace(true);
        }));

        if getpid() == Pid::from_raw(1) {
            let mut sigchld = signal(SignalKind::child())
                .map_err(|e| VmError::Signal(format!("SIGCHLD handler: {e}")))?;
            debug!("running as init, reaping orphaned children");
            supervisor.tasks.push(tokio::spawn(async move {
                while sigchld.recv().await.is_some() {
                    reap_zombies();
                }
            }));
        }

        Ok(supervisor)
    }

    /// A supervisor with no signal listeners; shutdown only happens through
    /// [`Supervisor::request_shutdown`].
    #[must_use]
    pub fn detached() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            shutdown_tx,
            shutdown_rx,
            tasks: Vec::new(),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub fn shutdown_requested(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shutdown_rx.clone();
        async move {
            // The sender lives in `self`; a closed channel also means shutdown.
            let _ = rx.wait_for(|requested| *requested).await;
        }
    }

    /// Stop listening for signals.
    pub fn teardown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Collect every exited child without blocking. Returns how many were reaped.
pub fn reap_zombies() -> usize {
    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
            Ok(status) => {
                debug!(?status, "reaped child");
                reaped += 1;
            }
            Err(Errno::EINTR) => {}
            Err(e) => {
                warn!(error = %e, "waitpid failed");
                break;
            }
        }
    }
    reaped
}
