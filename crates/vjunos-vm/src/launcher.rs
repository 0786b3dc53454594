use crate::{
    ApplianceLifecycle, ApplianceSession, BootPoller, ConsoleConnector, ExpectEngine, HealthFile,
    PollOutcome, RunState, SessionState, VmError, apply_bootstrap_config, apply_startup_config,
};
use std::path::{Path, PathBuf};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use vjunos_core::ApplianceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// The appliance came up and was stopped on request.
    Completed,
    /// Shutdown was requested before the appliance finished coming up.
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Boot,
    Bootstrap,
    StartupConfig,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Boot => "boot",
            Phase::Bootstrap => "bootstrap",
            Phase::StartupConfig => "startup-config",
        }
    }
}

/// Takes one appliance from power-on to fully configured, then keeps it
/// running until shutdown is requested.
pub struct Launcher<K: ConsoleConnector, L: ApplianceLifecycle> {
    config: ApplianceConfig,
    session: ApplianceSession,
    engine: ExpectEngine<K>,
    lifecycle: L,
    poller: BootPoller,
    health: HealthFile,
    run_dir: PathBuf,
}

impl<K: ConsoleConnector, L: ApplianceLifecycle> Launcher<K, L> {
    pub fn new(config: ApplianceConfig, connector: K, lifecycle: L, run_dir: &Path) -> Self {
        Self {
            session: ApplianceSession::new(&config),
            engine: ExpectEngine::new(connector, config.timeouts.default),
            poller: BootPoller::new(config.boot.read_timeout),
            health: HealthFile::new(run_dir.join("health")),
            run_dir: run_dir.to_path_buf(),
            lifecycle,
            config,
        }
    }

    #[must_use]
    pub fn session(&self) -> &ApplianceSession {
        &self.session
    }

    #[must_use]
    pub fn health(&self) -> &HealthFile {
        &self.health
    }

    /// Bring the appliance up, then wait for `shutdown` and stop the VM.
    ///
    /// # Errors
    /// Returns the first phase failure. The VM is stopped and the health file
    /// records the error before returning.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<LaunchOutcome, VmError>
    where
        F: Future<Output = ()>,
    {
        std::fs::create_dir_all(&self.run_dir)?;
        self.health.starting()?;
        info!(hostname = %self.config.hostname, run_dir = %self.run_dir.display(), "launching appliance");

        let mut shutdown = std::pin::pin!(shutdown);
        let brought_up = tokio::select! {
            result = self.bring_up() => Some(result),
            () = &mut shutdown => None,
        };

        match brought_up {
            None => {
                info!("shutdown requested during startup");
                self.stop_vm().await;
                return Ok(LaunchOutcome::Interrupted);
            }
            Some(Err(e)) => {
                if let Err(health_err) = self.health.failed(&e.to_string()) {
                    warn!(error = %health_err, "failed to update health file");
                }
                self.stop_vm().await;
                return Err(e);
            }
            Some(Ok(())) => {}
        }

        RunState::from_session(&self.session).save(&self.run_dir)?;
        self.health.running()?;
        info!(hostname = %self.config.hostname, "appliance ready");

        shutdown.await;
        info!("shutdown requested");
        self.stop_vm().await;
        Ok(LaunchOutcome::Completed)
    }

    async fn bring_up(&mut self) -> Result<(), VmError> {
        self.boot().await.inspect_err(|e| log_phase_error(Phase::Boot, e))?;

        apply_bootstrap_config(&mut self.engine, &self.config)
            .await
            .inspect_err(|e| log_phase_error(Phase::Bootstrap, e))?;

        apply_startup_config(
            &mut self.engine,
            &self.config.startup_config,
            self.config.timeouts.commit,
        )
        .await
        .inspect_err(|e| log_phase_error(Phase::StartupConfig, e))?;

        self.engine.close().await
    }

    async fn boot(&mut self) -> Result<(), VmError> {
        let mut ticker = tokio::time::interval(self.config.boot.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let outcome = self
                .poller
                .poll(&mut self.session, &mut self.engine, &mut self.lifecycle)
                .await?;
            debug!(?outcome, "poll cycle");

            match outcome {
                PollOutcome::Running { .. } | PollOutcome::Idle(SessionState::Running) => {
                    return Ok(());
                }
                PollOutcome::Idle(_) => {
                    return Err(VmError::StallLimit {
                        restarts: self.session.restarts(),
                    });
                }
                _ => {}
            }
        }
    }

    async fn stop_vm(&mut self) {
        self.engine.discard();
        if self.session.state() == SessionState::NotStarted {
            return;
        }
        if let Err(e) = self.lifecycle.stop().await {
            warn!(error = %e, "failed to stop VM");
        }
    }
}

fn log_phase_error(phase: Phase, e: &VmError) {
    error!(phase = phase.as_str(), error = %e, "appliance startup failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeConsole, FakeLifecycle, LifecycleCall};
    use std::time::Duration;

    fn test_config(dir: &Path) -> ApplianceConfig {
        let mut config = ApplianceConfig::default();
        config.boot.poll_interval = Duration::from_millis(1);
        config.boot.read_timeout = Duration::from_millis(1);
        config.timeouts.default = Duration::from_millis(50);
        config.timeouts.commit = Duration::from_millis(50);
        config.startup_config = dir.join("startup-config.cfg");
        config
    }

    async fn wait_for_healthy(path: PathBuf) {
        loop {
            if std::fs::read_to_string(&path).is_ok_and(|s| s.starts_with('0')) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_run_brings_appliance_up_and_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::write(&config.startup_config, "set system host-name sw1\n").unwrap();

        let console = FakeConsole::auto_prompt();
        let lifecycle = FakeLifecycle::default();
        let mut launcher = Launcher::new(config, console.clone(), lifecycle.clone(), dir.path());

        let outcome = launcher
            .run(wait_for_healthy(dir.path().join("health")))
            .await
            .unwrap();

        assert_eq!(outcome, LaunchOutcome::Completed);
        assert_eq!(launcher.session().state(), SessionState::Running);
        assert_eq!(lifecycle.calls(), vec![LifecycleCall::Start, LifecycleCall::Stop]);

        let writes = console.writes();
        assert_eq!(&writes[..3], ["\r", "root", ""]);
        assert!(writes.contains(&"set cli screen-length 0".to_string()));
        assert_eq!(
            &writes[writes.len() - 3..],
            ["set system host-name sw1", "commit", "exit"]
        );

        let state = RunState::load(dir.path()).unwrap();
        assert_eq!(state.state, SessionState::Running);
        assert_eq!(state.hostname, "vr-vjunosswitch");
        assert!(launcher.health().read().unwrap().is_healthy());
    }

    #[tokio::test]
    async fn test_shutdown_during_boot_stops_vm() {
        let dir = tempfile::tempdir().unwrap();
        let console = FakeConsole::new();
        let lifecycle = FakeLifecycle::default();
        let mut launcher = Launcher::new(
            test_config(dir.path()),
            console,
            lifecycle.clone(),
            dir.path(),
        );

        let outcome = launcher
            .run(tokio::time::sleep(Duration::from_millis(50)))
            .await
            .unwrap();

        assert_eq!(outcome, LaunchOutcome::Interrupted);
        assert_eq!(launcher.session().state(), SessionState::Booting);
        assert_eq!(lifecycle.calls(), vec![LifecycleCall::Start, LifecycleCall::Stop]);
        assert_eq!(launcher.health().read().unwrap().message, "starting");
    }

    #[tokio::test]
    async fn test_stall_limit_fails_launch() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.boot.spin_limit = 2;
        config.boot.max_restarts = Some(0);

        let lifecycle = FakeLifecycle::default();
        let mut launcher =
            Launcher::new(config, FakeConsole::new(), lifecycle.clone(), dir.path());

        let err = launcher
            .run(std::future::pending::<()>())
            .await
            .unwrap_err();

        assert!(matches!(err, VmError::StallLimit { restarts: 0 }));
        assert_eq!(launcher.session().state(), SessionState::Failed);
        assert_eq!(lifecycle.count(LifecycleCall::Stop), 1);

        let health = launcher.health().read().unwrap();
        assert!(!health.is_healthy());
        assert!(health.message.contains("stalled"));
    }

    #[tokio::test]
    async fn test_bootstrap_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let console = FakeConsole::new();
        // Banner and login succeed, then the appliance goes quiet.
        console.push_output(b"login:");
        console.push_output(b"login:");
        console.push_output(b"root@:~ # ");

        let lifecycle = FakeLifecycle::default();
        let mut launcher =
            Launcher::new(test_config(dir.path()), console, lifecycle.clone(), dir.path());

        let err = launcher
            .run(std::future::pending::<()>())
            .await
            .unwrap_err();

        assert!(matches!(err, VmError::ExpectTimeout { .. }));
        assert_eq!(launcher.session().state(), SessionState::Running);
        assert_eq!(lifecycle.calls(), vec![LifecycleCall::Start, LifecycleCall::Stop]);
        assert!(RunState::load(dir.path()).is_err());
    }
}
