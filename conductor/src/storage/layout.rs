//! Storage layout

use std::path::PathBuf;

use crate::errors::ConductorError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Directory layout for records, settings and logs
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub base_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    pub fn plans_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("plans"))
    }

    pub fn executions_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("executions"))
    }

    pub fn audit_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("audit"))
    }

    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Create the record directories
    pub async fn setup(&self) -> Result<(), ConductorError> {
        self.plans_dir().create().await?;
        self.executions_dir().create().await?;
        self.audit_dir().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/var/lib/fwconductor");

        #[cfg(not(target_os = "linux"))]
        let base_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".fwconductor");

        Self::new(base_dir)
    }
}

#[cfg(not(target_os = "linux"))]
mod dirs {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
    }
}
