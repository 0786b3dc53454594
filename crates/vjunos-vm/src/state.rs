use crate::VmError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};
use vjunos_core::{ApplianceConfig, Credentials, ManagementConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    NotStarted,
    Booting,
    Running,
    Failed,
}

impl SessionState {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::NotStarted => "Not started",
            SessionState::Booting => "Booting",
            SessionState::Running => "Running",
            SessionState::Failed => "Failed",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Running | SessionState::Failed)
    }
}

/// Bootstrap lifecycle of one appliance.
///
/// State only moves forward (`NotStarted → Booting → Running | Failed`). A
/// stall restart keeps the session in `Booting` and only resets the spin
/// counter; hostname and credentials survive restarts.
#[derive(Debug)]
pub struct ApplianceSession {
    pub hostname: String,
    pub credentials: Credentials,
    pub management: ManagementConfig,
    pub spin_limit: u32,
    pub max_restarts: Option<u32>,
    state: SessionState,
    spin_count: u32,
    restarts: u32,
    start_time: Instant,
    startup_duration: Option<Duration>,
}

impl ApplianceSession {
    #[must_use]
    pub fn new(config: &ApplianceConfig) -> Self {
        Self {
            hostname: config.hostname.clone(),
            credentials: config.credentials.clone(),
            management: config.management.clone(),
            spin_limit: config.boot.spin_limit,
            max_restarts: config.boot.max_restarts,
            state: SessionState::NotStarted,
            spin_count: 0,
            restarts: 0,
            start_time: Instant::now(),
            startup_duration: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn spin_count(&self) -> u32 {
        self.spin_count
    }

    #[must_use]
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    #[must_use]
    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    #[must_use]
    pub fn startup_duration(&self) -> Option<Duration> {
        self.startup_duration
    }

    #[must_use]
    pub fn is_stalled(&self) -> bool {
        self.spin_count > self.spin_limit
    }

    /// Whether another stall restart is allowed.
    #[must_use]
    pub fn may_restart(&self) -> bool {
        self.max_restarts.is_none_or(|max| self.restarts < max)
    }

    pub(crate) fn mark_booting(&mut self) {
        if self.state == SessionState::NotStarted {
            self.state = SessionState::Booting;
        }
    }

    pub(crate) fn spin(&mut self) {
        self.spin_count = self.spin_count.saturating_add(1);
    }

    pub(crate) fn saw_output(&mut self) {
        self.spin_count = 0;
    }

    pub(crate) fn record_restart(&mut self) {
        self.spin_count = 0;
        self.restarts += 1;
    }

    pub(crate) fn mark_running(&mut self, elapsed: Duration) {
        if self.state == SessionState::Booting {
            self.state = SessionState::Running;
            self.startup_duration = Some(elapsed);
        }
    }

    pub(crate) fn mark_failed(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::Failed;
        }
    }

    #[cfg(test)]
    pub(crate) fn set_spin_count(&mut self, count: u32) {
        self.spin_count = count;
    }
}

/// Snapshot written to the run directory once the appliance is up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub hostname: String,
    pub management_address: String,
    pub state: SessionState,
    pub startup_secs: f64,
    pub restarts: u32,
}

impl RunState {
    #[must_use]
    pub fn from_session(session: &ApplianceSession) -> Self {
        Self {
            hostname: session.hostname.clone(),
            management_address: session.management.cidr(),
            state: session.state(),
            startup_secs: session
                .startup_duration()
                .map_or(0.0, |d| d.as_secs_f64()),
            restarts: session.restarts(),
        }
    }

    /// Load run state from disk.
    ///
    /// # Errors
    /// Returns `VmError` if the state file cannot be read or parsed.
    pub fn load(run_dir: &Path) -> Result<Self, VmError> {
        let state_file = run_dir.join("state.json");
        let content = std::fs::read_to_string(&state_file)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save run state to disk.
    ///
    /// # Errors
    /// Returns `VmError` if the state cannot be serialized or written.
    pub fn save(&self, run_dir: &Path) -> Result<(), VmError> {
        let state_file = run_dir.join("state.json");
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&state_file, content)?;
        Ok(())
    }
}
