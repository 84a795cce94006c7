//! Platform wake lock implementations

use log::{debug, warn};
use multihal_core::PowerLock;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Which power lock backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerLockKind {
    /// Track the lock in process only
    #[default]
    Noop,
    /// Kernel wakelocks through `/sys/power/wake_lock`
    Sysfs,
}

impl PowerLockKind {
    pub fn build(self) -> Arc<dyn PowerLock> {
        match self {
            PowerLockKind::Noop => Arc::new(NoopPowerLock::new()),
            PowerLockKind::Sysfs => Arc::new(SysfsPowerLock::new()),
        }
    }
}

/// In-process power lock that only records what happened
///
/// Used when the platform has no wakelock interface, and by tests.
#[derive(Debug, Default)]
pub struct NoopPowerLock {
    held: AtomicBool,
    acquisitions: AtomicU64,
    releases: AtomicU64,
}

impl NoopPowerLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }
}

impl PowerLock for NoopPowerLock {
    fn acquire(&self, _name: &str) -> bool {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        self.held.store(true, Ordering::SeqCst);
        true
    }

    fn release(&self, _name: &str) -> bool {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.held.store(false, Ordering::SeqCst);
        true
    }
}

/// Linux kernel wakelocks (`CONFIG_PM_WAKELOCKS`)
#[derive(Debug)]
pub struct SysfsPowerLock {
    lock_path: PathBuf,
    unlock_path: PathBuf,
}

impl SysfsPowerLock {
    pub fn new() -> Self {
        Self::with_root("/sys/power")
    }

    /// Use `root/wake_lock` and `root/wake_unlock`
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            lock_path: root.join("wake_lock"),
            unlock_path: root.join("wake_unlock"),
        }
    }

    fn write_name(path: &Path, name: &str) -> bool {
        let result = OpenOptions::new()
            .write(true)
            .open(path)
            .and_then(|mut file| file.write_all(name.as_bytes()));
        match result {
            Ok(()) => {
                debug!("Wrote '{}' to {}", name, path.display());
                true
            }
            Err(e) => {
                warn!("Failed to write '{}' to {}: {}", name, path.display(), e);
                false
            }
        }
    }
}

impl Default for SysfsPowerLock {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerLock for SysfsPowerLock {
    fn acquire(&self, name: &str) -> bool {
        Self::write_name(&self.lock_path, name)
    }

    fn release(&self, name: &str) -> bool {
        Self::write_name(&self.unlock_path, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_lock_counts() {
        let lock = NoopPowerLock::new();
        assert!(lock.acquire("a"));
        assert!(lock.is_held());
        assert!(lock.release("a"));
        assert!(!lock.is_held());
        assert_eq!((lock.acquisitions(), lock.releases()), (1, 1));
    }

    #[test]
    fn test_sysfs_lock_writes_name() {
        let dir = std::env::temp_dir().join(format!("multihal-power-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("wake_lock"), "").unwrap();
        std::fs::write(dir.join("wake_unlock"), "").unwrap();

        let lock = SysfsPowerLock::with_root(&dir);
        assert!(lock.acquire("SensorsHAL_WAKEUP"));
        assert!(lock.release("SensorsHAL_WAKEUP"));
        assert_eq!(
            std::fs::read_to_string(dir.join("wake_unlock")).unwrap(),
            "SensorsHAL_WAKEUP"
        );

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_sysfs_lock_missing_file() {
        let lock = SysfsPowerLock::with_root("/nonexistent/multihal");
        assert!(!lock.acquire("x"));
    }
}
