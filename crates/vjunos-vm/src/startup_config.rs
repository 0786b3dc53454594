use crate::bootstrap::{OPERATIONAL_PROMPT, PRIVILEGED_PROMPT};
use crate::{ConsoleConnector, ExpectEngine, VmError};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, trace};
use vjunos_core::{CommandStep, Script};

const ENTER_TIMEOUT: Duration = Duration::from_secs(10);

/// User-supplied configuration lines, read once from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserConfigSource {
    pub path: PathBuf,
    pub lines: Vec<String>,
}

impl UserConfigSource {
    /// Read the file at `path`. A missing file is not an error.
    ///
    /// # Errors
    /// Returns `VmError::Io` if the file exists but cannot be read.
    pub fn load(path: &Path) -> Result<Option<Self>, VmError> {
        if !path.exists() {
            trace!(path = %path.display(), "startup config file not found");
            return Ok(None);
        }

        trace!(path = %path.display(), "startup config file exists");
        let content = std::fs::read_to_string(path)?;
        let lines = content.lines().map(|l| l.trim_end().to_string()).collect();
        trace!(path = %path.display(), "parsed startup config file");

        Ok(Some(Self {
            path: path.to_path_buf(),
            lines,
        }))
    }

    /// Script replaying every line in configuration mode, then committing.
    ///
    /// Lines are sent without waiting for a prompt and the appliance's reply
    /// is never inspected, so a rejected line is indistinguishable from an
    /// accepted one.
    #[must_use]
    pub fn script(&self, commit_timeout: Duration) -> Script {
        Script::new("startup-config")
            .stage(
                "enter-configuration",
                [
                    CommandStep::after(PRIVILEGED_PROMPT, "cli").with_timeout(ENTER_TIMEOUT),
                    CommandStep::after(OPERATIONAL_PROMPT, "configure").with_timeout(ENTER_TIMEOUT),
                ],
            )
            .stage("apply-lines", self.lines.iter().map(CommandStep::send))
            .stage(
                "commit",
                [
                    CommandStep::after(PRIVILEGED_PROMPT, "commit").with_timeout(commit_timeout),
                    CommandStep::after(PRIVILEGED_PROMPT, "exit").with_timeout(commit_timeout),
                ],
            )
    }
}

/// Replay the user's startup configuration, if there is one.
///
/// # Errors
/// Returns `VmError` if the file cannot be read or a prompt is not seen.
pub async fn apply_startup_config<K: ConsoleConnector>(
    engine: &mut ExpectEngine<K>,
    path: &Path,
    commit_timeout: Duration,
) -> Result<bool, VmError> {
    let Some(source) = UserConfigSource::load(path)? else {
        return Ok(false);
    };

    info!(path = %path.display(), lines = source.lines.len(), "Writing lines from startup config");
    engine.run_script(&source.script(commit_timeout)).await?;
    info!(path = %path.display(), "startup config applied");
    Ok(true)
}
