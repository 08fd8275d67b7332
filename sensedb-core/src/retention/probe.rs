//! Disk space probes

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use sysinfo::Disks;

/// Reports free and total bytes of the monitored volume
pub trait SpaceProbe: Send + Sync {
    fn available_bytes(&self) -> Option<u64>;

    fn total_bytes(&self) -> Option<u64>;

    /// Free and total bytes from one reading, `None` if either is missing
    fn read(&self) -> Option<(u64, u64)> {
        Some((self.available_bytes()?, self.total_bytes()?))
    }
}

/// Probe backed by the operating system's mounted disks.
///
/// The volume is the mount point that is the longest prefix of the monitored
/// path.
#[derive(Debug, Clone)]
pub struct DiskProbe {
    path: PathBuf,
}

impl DiskProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let path = std::fs::canonicalize(&path).unwrap_or(path);
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn volume(&self) -> Option<(u64, u64)> {
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|d| self.path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| (d.available_space(), d.total_space()))
    }
}

impl SpaceProbe for DiskProbe {
    fn available_bytes(&self) -> Option<u64> {
        self.volume().map(|(available, _)| available)
    }

    fn total_bytes(&self) -> Option<u64> {
        self.volume().map(|(_, total)| total).filter(|total| *total > 0)
    }

    fn read(&self) -> Option<(u64, u64)> {
        self.volume().filter(|(_, total)| *total > 0)
    }
}

/// Probe returning configured figures
#[derive(Debug, Default)]
pub struct FixedProbe {
    available: AtomicU64,
    total: AtomicU64,
}

/// Sentinel for "unavailable"
const MISSING: u64 = u64::MAX;

impl FixedProbe {
    pub fn new(available_bytes: u64, total_bytes: u64) -> Self {
        Self {
            available: AtomicU64::new(available_bytes),
            total: AtomicU64::new(total_bytes),
        }
    }

    /// Figures in whole gigabytes
    pub fn gb(available_gb: u64, total_gb: u64) -> Self {
        Self::new(available_gb * GB, total_gb * GB)
    }

    /// A probe that never answers
    pub fn unavailable() -> Self {
        Self::new(MISSING, MISSING)
    }

    pub fn set_available(&self, bytes: u64) {
        self.available.store(bytes, Ordering::Release);
    }

    pub fn set_available_gb(&self, gb: u64) {
        self.set_available(gb * GB);
    }
}

impl SpaceProbe for FixedProbe {
    fn available_bytes(&self) -> Option<u64> {
        Some(self.available.load(Ordering::Acquire)).filter(|v| *v != MISSING)
    }

    fn total_bytes(&self) -> Option<u64> {
        Some(self.total.load(Ordering::Acquire)).filter(|v| *v != MISSING)
    }
}

pub const MB: u64 = 1024 * 1024;
pub const GB: u64 = 1024 * MB;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_probe() {
        let probe = FixedProbe::gb(5, 100);
        assert_eq!(probe.available_bytes(), Some(5 * GB));
        probe.set_available_gb(3);
        assert_eq!(probe.available_bytes(), Some(3 * GB));

        assert_eq!(probe.read(), Some((3 * GB, 100 * GB)));

        let dead = FixedProbe::unavailable();
        assert!(dead.available_bytes().is_none());
        assert!(dead.total_bytes().is_none());
        assert!(dead.read().is_none());
    }

    #[test]
    fn test_disk_probe_finds_root_volume() {
        let dir = tempfile::tempdir().unwrap();
        let probe = DiskProbe::new(dir.path());
        // Containers may hide their mounts; only check consistency
        if let Some((available, total)) = probe.read() {
            assert!(available <= total);
        }
    }
}
