use crate::VmError;
use std::path::PathBuf;

pub struct VjunosDirs {
    pub state: PathBuf,
}

impl VjunosDirs {
    /// Locate the platform state directory.
    ///
    /// # Errors
    /// Returns `VmError` if standard OS directories cannot be determined.
    pub fn new() -> Result<Self, VmError> {
        let state = dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .ok_or_else(|| VmError::Directory("state directory not found".into()))?
            .join("vjunos");

        Ok(Self { state })
    }

    #[must_use]
    pub fn runs_dir(&self) -> PathBuf {
        self.state.join("runs")
    }

    /// Run directory for the appliance named `hostname`.
    #[must_use]
    pub fn run_dir(&self, hostname: &str) -> PathBuf {
        self.runs_dir().join(hostname)
    }
}
