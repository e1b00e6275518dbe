use crate::core::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BASE_PATH: &str = "/var/lib/jvp";
pub const DEFAULT_LIBVIRT_SOCKET: &str = "/var/run/libvirt/libvirt-sock";
pub const DEFAULT_METADATA_URI: &str = "http://jvp.local/xmlns/instance/1.0";

/// Timing policy for per-resource lock files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockPolicy {
    /// How long a single acquisition may wait.
    pub acquire_timeout_ms: u64,
    /// Delay between non-blocking attempts.
    pub retry_interval_ms: u64,
    /// Lock files older than this are swept at startup.
    pub stale_after_ms: u64,
    /// Outer attempts made by `with_lock_retry`.
    pub retry_attempts: u32,
    /// Backoff unit between outer attempts (`attempt * retry_backoff_ms`).
    pub retry_backoff_ms: u64,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 30_000,
            retry_interval_ms: 100,
            stale_after_ms: 5 * 60_000,
            retry_attempts: 3,
            retry_backoff_ms: 1_000,
        }
    }
}

impl LockPolicy {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(attempt as u64))
    }
}

/// Background index refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshPolicy {
    pub enabled: bool,
    pub interval_ms: u64,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5 * 60_000,
        }
    }
}

/// Connection settings for the hypervisor daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    pub socket_path: PathBuf,
    /// Connection URI passed on open, e.g. `qemu:///system`.
    pub uri: String,
    /// XML namespace of the instance metadata fragment.
    pub metadata_uri: String,
    /// Namespace prefix used when writing the fragment.
    pub metadata_key: String,
    pub call_timeout_ms: u64,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_LIBVIRT_SOCKET),
            uri: "qemu:///system".to_string(),
            metadata_uri: DEFAULT_METADATA_URI.to_string(),
            metadata_key: "jvp".to_string(),
            call_timeout_ms: 10_000,
        }
    }
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub base_path: PathBuf,
    pub lock: LockPolicy,
    pub refresh: RefreshPolicy,
    /// Keep a `.backup` copy of the previous sidecar on every write.
    pub backup_on_write: bool,
    pub hypervisor: HypervisorConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from(DEFAULT_BASE_PATH),
            lock: LockPolicy::default(),
            refresh: RefreshPolicy::default(),
            backup_on_write: true,
            hypervisor: HypervisorConfig::default(),
        }
    }
}

impl StoreConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            ..Self::default()
        }
    }

    /// Load a JSON configuration file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| StoreError::io(format!("read config '{}'", path.display()), e))?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            StoreError::InvalidArgument(format!("config '{}': {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Override selected fields from `JVP_BASE_PATH` and `JVP_LIBVIRT_SOCKET`.
    pub fn apply_env(mut self) -> Self {
        if let Ok(base) = std::env::var("JVP_BASE_PATH")
            && !base.is_empty()
        {
            self.base_path = PathBuf::from(base);
        }
        if let Ok(socket) = std::env::var("JVP_LIBVIRT_SOCKET")
            && !socket.is_empty()
        {
            self.hypervisor.socket_path = PathBuf::from(socket);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_path.as_os_str().is_empty() {
            return Err(StoreError::InvalidArgument("base_path must not be empty".into()));
        }
        if self.lock.acquire_timeout_ms == 0 || self.lock.retry_interval_ms == 0 {
            return Err(StoreError::InvalidArgument(
                "lock timeouts must be greater than zero".into(),
            ));
        }
        if self.lock.retry_attempts == 0 {
            return Err(StoreError::InvalidArgument(
                "lock.retry_attempts must be at least 1".into(),
            ));
        }
        if self.refresh.enabled && self.refresh.interval_ms == 0 {
            return Err(StoreError::InvalidArgument(
                "refresh.interval_ms must be greater than zero".into(),
            ));
        }
        if self.hypervisor.metadata_key.is_empty() || self.hypervisor.metadata_uri.is_empty() {
            return Err(StoreError::InvalidArgument(
                "hypervisor metadata namespace must be set".into(),
            ));
        }
        Ok(())
    }

    /// Set lock acquisition timeout
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock.acquire_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the delay between lock attempts
    pub fn lock_retry_interval(mut self, interval: Duration) -> Self {
        self.lock.retry_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set outer retry count and backoff unit
    pub fn lock_retries(mut self, attempts: u32, backoff: Duration) -> Self {
        self.lock.retry_attempts = attempts;
        self.lock.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Enable the background refresh at the given interval
    pub fn refresh_every(mut self, interval: Duration) -> Self {
        self.refresh.enabled = true;
        self.refresh.interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn without_refresh(mut self) -> Self {
        self.refresh.enabled = false;
        self
    }

    pub fn backup_on_write(mut self, enabled: bool) -> Self {
        self.backup_on_write = enabled;
        self
    }

    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.hypervisor.socket_path = path.into();
        self
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh.interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.base_path, PathBuf::from(DEFAULT_BASE_PATH));
        assert_eq!(config.lock.stale_after(), Duration::from_secs(300));
        assert_eq!(config.refresh_interval(), Duration::from_secs(300));
        assert!(config.backup_on_write);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("jvp.json");
        std::fs::write(
            &path,
            r#"{"base_path": "/srv/jvp", "lock": {"acquire_timeout_ms": 500}}"#,
        )
        .unwrap();
        let config = StoreConfig::from_file(&path).unwrap();
        assert_eq!(config.base_path, PathBuf::from("/srv/jvp"));
        assert_eq!(config.lock.acquire_timeout_ms, 500);
        assert_eq!(config.lock.retry_interval_ms, 100);
        assert_eq!(config.hypervisor.metadata_key, "jvp");
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = StoreConfig::new("/tmp/x").lock_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_backoff_scales_with_attempt() {
        let policy = LockPolicy::default();
        assert_eq!(policy.retry_backoff(1), Duration::from_secs(1));
        assert_eq!(policy.retry_backoff(3), Duration::from_secs(3));
    }
}
