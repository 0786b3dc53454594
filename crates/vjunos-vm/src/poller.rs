use crate::expect::log_output;
use crate::{ApplianceLifecycle, ApplianceSession, ConsoleConnector, ExpectEngine, SessionState, VmError};
use std::time::Duration;
use tracing::{debug, info, warn};
use vjunos_core::Pattern;

/// Banner printed by the appliance once it accepts logins.
pub const LOGIN_BANNER: &str = "login:";
/// Shell prompt of the default root account.
pub const SHELL_PROMPT: &str = "root@:~ # ";
/// The factory image logs root in without a password.
pub const LOGIN_USER: &str = "root";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The VM was powered on by this cycle.
    Started,
    /// Nothing recognisable; the spin counter now holds `spins`.
    Waiting { spins: u32 },
    /// Output other than the banner was seen; the spin counter was reset.
    Output { bytes: usize },
    /// The appliance stalled and was restarted.
    Restarted { restarts: u32 },
    /// Login completed; the appliance is up.
    Running { elapsed: Duration },
    /// The session is already `Running` or `Failed`; nothing was done.
    Idle(SessionState),
}

/// Drives one appliance from power-on to a logged-in console, one bounded
/// read per call.
#[derive(Debug, Clone)]
pub struct BootPoller {
    banner: Pattern,
    shell_prompt: Pattern,
    login_user: String,
    read_timeout: Duration,
}

impl BootPoller {
    #[must_use]
    pub fn new(read_timeout: Duration) -> Self {
        Self {
            banner: Pattern::literal(LOGIN_BANNER),
            shell_prompt: Pattern::literal(SHELL_PROMPT),
            login_user: LOGIN_USER.into(),
            read_timeout,
        }
    }

    /// Run a single poll cycle.
    ///
    /// # Errors
    /// Returns `VmError::StallLimit` when a restart cap is configured and
    /// exhausted, `VmError::ExpectTimeout` if the login handshake stalls, and
    /// lifecycle errors from a restart.
    pub async fn poll<K, L>(
        &self,
        session: &mut ApplianceSession,
        engine: &mut ExpectEngine<K>,
        lifecycle: &mut L,
    ) -> Result<PollOutcome, VmError>
    where
        K: ConsoleConnector,
        L: ApplianceLifecycle,
    {
        match session.state() {
            SessionState::NotStarted => {
                lifecycle.start().await?;
                session.mark_booting();
                info!(hostname = %session.hostname, "VM started, waiting for login banner");
                return Ok(PollOutcome::Started);
            }
            state @ (SessionState::Running | SessionState::Failed) => {
                return Ok(PollOutcome::Idle(state));
            }
            SessionState::Booting => {}
        }

        if session.is_stalled() {
            return self.restart(session, engine, lifecycle).await;
        }

        let outcome = match engine
            .read_until(std::slice::from_ref(&self.banner), self.read_timeout)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) if e.is_console_gone() => {
                debug!(error = %e, "console not reachable yet");
                engine.discard();
                session.spin();
                return Ok(PollOutcome::Waiting {
                    spins: session.spin_count(),
                });
            }
            Err(e) => return Err(e),
        };

        if outcome.is_match() {
            log_output(&outcome.data);
            let elapsed = self.login(session, engine).await?;
            return Ok(PollOutcome::Running { elapsed });
        }

        if outcome.data.is_empty() {
            session.spin();
            Ok(PollOutcome::Waiting {
                spins: session.spin_count(),
            })
        } else {
            log_output(&outcome.data);
            session.saw_output();
            Ok(PollOutcome::Output {
                bytes: outcome.data.len(),
            })
        }
    }

    async fn login<K: ConsoleConnector>(
        &self,
        session: &mut ApplianceSession,
        engine: &mut ExpectEngine<K>,
    ) -> Result<Duration, VmError> {
        info!(hostname = %session.hostname, "login banner seen");

        engine.send("\r").await?;
        engine
            .send_and_wait(&self.login_user, &self.banner, None)
            .await?;
        engine.send_and_wait("", &self.shell_prompt, None).await?;
        info!("Login completed");

        engine.close().await?;

        let elapsed = session.start_time().elapsed();
        session.mark_running(elapsed);
        info!(
            hostname = %session.hostname,
            elapsed = ?elapsed,
            restarts = session.restarts(),
            "Startup complete"
        );
        Ok(elapsed)
    }

    async fn restart<K, L>(
        &self,
        session: &mut ApplianceSession,
        engine: &mut ExpectEngine<K>,
        lifecycle: &mut L,
    ) -> Result<PollOutcome, VmError>
    where
        K: ConsoleConnector,
        L: ApplianceLifecycle,
    {
        if !session.may_restart() {
            session.mark_failed();
            warn!(
                hostname = %session.hostname,
                restarts = session.restarts(),
                "boot stalled and restart limit reached"
            );
            return Err(VmError::StallLimit {
                restarts: session.restarts(),
            });
        }

        warn!(
            hostname = %session.hostname,
            spins = session.spin_count(),
            limit = session.spin_limit,
            "no login banner, restarting VM"
        );
        engine.discard();
        lifecycle.stop().await?;
        lifecycle.start().await?;
        session.record_restart();

        Ok(PollOutcome::Restarted {
            restarts: session.restarts(),
        })
    }
}
