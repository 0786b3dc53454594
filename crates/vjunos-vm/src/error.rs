use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VmError {
    #[error("QEMU error: {0}")]
    Qemu(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] vjunos_core::CoreError),

    #[error("QMP error: {0}")]
    Qmp(String),

    #[error("Console unavailable: {0}")]
    ConsoleUnavailable(String),

    #[error("Console closed by peer")]
    ConsoleClosed,

    #[error("Console error: {0}")]
    Console(String),

    #[error("Timed out after {timeout:?} waiting for {prompt}")]
    ExpectTimeout { prompt: String, timeout: Duration },

    #[error("Appliance stalled during boot after {restarts} restarts")]
    StallLimit { restarts: u32 },

    #[error("Signal handling error: {0}")]
    Signal(String),

    #[error("Health file error: {0}")]
    Health(String),

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

impl VmError {
    /// Errors that mean "the console is not there right now" rather than
    /// "the appliance misbehaved". The boot poller treats these as silence.
    #[must_use]
    pub fn is_console_gone(&self) -> bool {
        matches!(self, VmError::ConsoleUnavailable(_) | VmError::ConsoleClosed)
    }
}

/// Convert a `Path` to `&str` for use with external commands.
///
/// # Errors
/// Returns `VmError::InvalidPath` if the path contains invalid UTF-8.
pub fn path_to_str(path: &Path) -> Result<&str, VmError> {
    path.to_str()
        .ok_or_else(|| VmError::InvalidPath(path.display().to_string()))
}
