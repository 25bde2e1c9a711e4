//! Engine tuning, loaded from `settings.json` under the user config dir.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Error, Result};

/// Tunables for the sync engine.
///
/// Missing keys fall back to their defaults, so an empty object is a valid
/// settings file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// First reconnect delay, in seconds.
    pub backoff_start_secs: u64,
    /// Reconnect delay ceiling, in seconds.
    pub backoff_max_secs: u64,
    /// Messages reconciled per metadata fetch.
    pub sync_batch_size: usize,
    /// Messages per download batch.
    pub download_batch_size: usize,
    /// On metered networks, bodies and attachments at or above this size
    /// are left for an explicit request.
    pub auto_download_limit: u64,
    /// Quiet period after losing connectivity before a restart, in seconds.
    pub reconnect_quiet_secs: u64,
    /// Bound on closing a store connection, in seconds.
    pub store_close_timeout_secs: u64,
    /// Retention window for newly discovered folders, in days.
    pub default_folder_days: u32,
    /// Interval between warnings while waiting for a unit to finish, in seconds.
    pub join_warn_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backoff_start_secs: 8,
            backoff_max_secs: 1024,
            sync_batch_size: 20,
            download_batch_size: 20,
            auto_download_limit: 32 * 1024,
            reconnect_quiet_secs: 90,
            store_close_timeout_secs: 20,
            default_folder_days: 7,
            join_warn_secs: 30,
        }
    }
}

impl SyncConfig {
    /// Default location of the settings file.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mailmirror")
            .join("settings.json")
    }

    /// Default location of the mirror database.
    #[must_use]
    pub fn default_database_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mailmirror")
            .join("mailmirror.db")
    }

    /// Load settings from `path`, or defaults if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// holds values that fail [`SyncConfig::validate`].
    pub async fn load(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(Self::default());
        }

        let contents = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save settings to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, contents).await?;

        info!("Settings saved to {:?}", path);
        Ok(())
    }

    /// Checks that the values are usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.backoff_start_secs == 0 {
            return Err(Error::Config("backoff_start_secs must be positive".into()));
        }
        if self.backoff_max_secs < self.backoff_start_secs {
            return Err(Error::Config(
                "backoff_max_secs must not be below backoff_start_secs".into(),
            ));
        }
        if self.sync_batch_size == 0 || self.download_batch_size == 0 {
            return Err(Error::Config("batch sizes must be positive".into()));
        }
        if self.join_warn_secs == 0 {
            return Err(Error::Config("join_warn_secs must be positive".into()));
        }
        if self.store_close_timeout_secs == 0 {
            return Err(Error::Config(
                "store_close_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// First reconnect delay.
    #[must_use]
    pub const fn backoff_start(&self) -> Duration {
        Duration::from_secs(self.backoff_start_secs)
    }

    /// Reconnect delay ceiling.
    #[must_use]
    pub const fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    /// Quiet period after losing connectivity.
    #[must_use]
    pub const fn reconnect_quiet(&self) -> Duration {
        Duration::from_secs(self.reconnect_quiet_secs)
    }

    /// Bound on closing a store connection.
    #[must_use]
    pub const fn store_close_timeout(&self) -> Duration {
        Duration::from_secs(self.store_close_timeout_secs)
    }

    /// Interval between join warnings.
    #[must_use]
    pub const fn join_warn(&self) -> Duration {
        Duration::from_secs(self.join_warn_secs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SyncConfig::default();
        config.validate().unwrap();
        assert_eq!(config.backoff_start(), Duration::from_secs(8));
        assert_eq!(config.backoff_max(), Duration::from_secs(1024));
        assert_eq!(config.auto_download_limit, 32 * 1024);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"sync_batch_size": 50}"#).unwrap();
        assert_eq!(config.sync_batch_size, 50);
        assert_eq!(config.download_batch_size, 20);
        assert_eq!(config.reconnect_quiet_secs, 90);
    }

    #[test]
    fn rejects_inverted_backoff() {
        let config = SyncConfig {
            backoff_start_secs: 60,
            backoff_max_secs: 30,
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_zero_join_warning() {
        let config = SyncConfig {
            join_warn_secs: 0,
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = std::env::temp_dir().join(format!("mailmirror-config-{}", std::process::id()));
        let path = dir.join("settings.json");

        let config = SyncConfig {
            default_folder_days: 30,
            ..SyncConfig::default()
        };
        config.save(&path).await.unwrap();
        let loaded = SyncConfig::load(&path).await.unwrap();
        assert_eq!(loaded, config);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn missing_file_gives_defaults() {
        let path = Path::new("/nonexistent/mailmirror/settings.json");
        assert_eq!(SyncConfig::load(path).await.unwrap(), SyncConfig::default());
    }
}
