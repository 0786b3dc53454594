use crate::VmError;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Contents of the health file: an exit status and a short message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStatus {
    pub code: i32,
    pub message: String,
}

impl HealthStatus {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.code == 0
    }

    /// Parse `"<code> <message>"`.
    ///
    /// # Errors
    /// Returns `VmError::Health` if the code is not an integer.
    pub fn parse(content: &str) -> Result<Self, VmError> {
        let content = content.trim();
        let (code, message) = content.split_once(' ').unwrap_or((content, ""));
        let code = code
            .parse()
            .map_err(|_| VmError::Health(format!("invalid status '{code}'")))?;
        Ok(Self {
            code,
            message: message.to_string(),
        })
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

/// File the container health check reads.
#[derive(Debug, Clone)]
pub struct HealthFile {
    path: PathBuf,
}

impl HealthFile {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// # Errors
    /// Returns `VmError::Io` if the file cannot be written.
    pub fn update(&self, code: i32, message: &str) -> Result<(), VmError> {
        let status = HealthStatus {
            code,
            message: message.to_string(),
        };
        debug!(path = %self.path.display(), %status, "updating health");
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, status.to_string())?;
        Ok(())
    }

    /// # Errors
    /// Returns `VmError::Io` if the file cannot be written.
    pub fn starting(&self) -> Result<(), VmError> {
        self.update(1, "starting")
    }

    /// # Errors
    /// Returns `VmError::Io` if the file cannot be written.
    pub fn running(&self) -> Result<(), VmError> {
        self.update(0, "running")
    }

    /// # Errors
    /// Returns `VmError::Io` if the file cannot be written.
    pub fn failed(&self, reason: &str) -> Result<(), VmError> {
        self.update(1, reason)
    }

    /// # Errors
    /// Returns `VmError` if the file is missing or malformed.
    pub fn read(&self) -> Result<HealthStatus, VmError> {
        HealthStatus::parse(&std::fs::read_to_string(&self.path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let health = HealthFile::new(dir.path().join("health"));

        health.starting().unwrap();
        assert_eq!(std::fs::read_to_string(health.path()).unwrap(), "1 starting");
        assert!(!health.read().unwrap().is_healthy());

        health.running().unwrap();
        let status = health.read().unwrap();
        assert!(status.is_healthy());
        assert_eq!(status.message, "running");

        health.failed("Timed out waiting for login").unwrap();
        let status = health.read().unwrap();
        assert_eq!(status.code, 1);
        assert_eq!(status.message, "Timed out waiting for login");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(HealthStatus::parse("ok running").is_err());
        assert_eq!(
            HealthStatus::parse("0\n").unwrap(),
            HealthStatus {
                code: 0,
                message: String::new()
            }
        );
    }

    #[test]
    fn test_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let health = HealthFile::new(dir.path().join("nope"));
        assert!(matches!(health.read(), Err(VmError::Io(_))));
    }
}
