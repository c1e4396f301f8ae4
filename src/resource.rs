//! Storage resources: identities of physical media and their byte-count
//! queries.
//!
//! A [`StorageResource`] names one physical medium (process RAM, a mounted
//! filesystem) and answers best-effort capacity questions about it. Devices
//! own one or more resources and forward per-resource queries here.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Process-unique identity of a resource object.
///
/// Resources are compared by identity, not by value: two
/// `FilesystemResource`s over the same mountpoint are distinct resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(pub(crate) u64);

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

impl ResourceId {
    fn next() -> Self {
        ResourceId(NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Shared handle to a resource.
pub type ResourceHandle = Arc<dyn StorageResource>;

/// A physical storage medium.
///
/// All byte counts are best-effort: the OS numbers move underneath the
/// engine and size estimation is inexact, so callers must never rely on
/// strict equality.
pub trait StorageResource: Send + Sync + fmt::Debug {
    /// Identity of this resource object.
    fn resource_id(&self) -> ResourceId;

    /// Human-readable name, used in errors and logs.
    fn name(&self) -> String;

    /// Total capacity of the medium in bytes.
    fn capacity(&self) -> u64;

    /// Bytes currently available on the medium.
    fn available(&self) -> u64;

    /// Bytes currently in use on the medium.
    fn utilized(&self) -> u64 {
        self.capacity().saturating_sub(self.available())
    }
}

/// The process RAM resource. A process-wide singleton obtained through
/// [`CpuRamResource::global`].
#[derive(Debug)]
pub struct CpuRamResource {
    id: ResourceId,
}

impl CpuRamResource {
    fn new() -> Self {
        Self {
            id: ResourceId::next(),
        }
    }

    /// The singleton RAM resource.
    pub fn global() -> Arc<CpuRamResource> {
        static GLOBAL: OnceLock<Arc<CpuRamResource>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(CpuRamResource::new())))
    }
}

impl StorageResource for CpuRamResource {
    fn resource_id(&self) -> ResourceId {
        self.id
    }

    fn name(&self) -> String {
        "cpu-ram".to_string()
    }

    fn capacity(&self) -> u64 {
        sys::ram_total()
    }

    fn available(&self) -> u64 {
        sys::ram_available()
    }
}

/// A mounted filesystem resource.
#[derive(Debug)]
pub struct FilesystemResource {
    id: ResourceId,
    mountpoint: PathBuf,
}

impl FilesystemResource {
    /// Create a resource for the filesystem containing `mountpoint`.
    pub fn new(mountpoint: impl AsRef<Path>) -> Self {
        Self {
            id: ResourceId::next(),
            mountpoint: mountpoint.as_ref().to_path_buf(),
        }
    }

    /// The mountpoint this resource reports on.
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }
}

impl StorageResource for FilesystemResource {
    fn resource_id(&self) -> ResourceId {
        self.id
    }

    fn name(&self) -> String {
        format!("filesystem:{}", self.mountpoint.display())
    }

    fn capacity(&self) -> u64 {
        sys::fs_stats(&self.mountpoint).map_or(0, |s| s.capacity)
    }

    fn available(&self) -> u64 {
        sys::fs_stats(&self.mountpoint).map_or(0, |s| s.available)
    }
}

pub(crate) struct FsStats {
    pub capacity: u64,
    pub available: u64,
}

#[cfg(unix)]
mod sys {
    use std::ffi::CString;
    use std::mem;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    use super::FsStats;

    /// Filesystem statistics at `path` via `statvfs`.
    pub(crate) fn fs_stats(path: &Path) -> Option<FsStats> {
        let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
        let mut vfs: libc::statvfs = unsafe { mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut vfs) };
        if rc != 0 {
            return None;
        }
        let frsize = vfs.f_frsize as u64;
        Some(FsStats {
            capacity: vfs.f_blocks as u64 * frsize,
            // f_bavail: blocks available to unprivileged users, which is
            // what a write by this process can actually consume.
            available: vfs.f_bavail as u64 * frsize,
        })
    }

    pub(crate) fn ram_total() -> u64 {
        #[cfg(target_os = "linux")]
        if let Some(kb) = meminfo_field("MemTotal:") {
            return kb * 1024;
        }
        sysinfo_ram().map_or(0, |(total, _free)| total)
    }

    /// Available RAM. `MemAvailable` accounts for reclaimable page cache;
    /// raw free memory undercounts on systems with a warm cache.
    pub(crate) fn ram_available() -> u64 {
        #[cfg(target_os = "linux")]
        if let Some(kb) = meminfo_field("MemAvailable:") {
            return kb * 1024;
        }
        sysinfo_ram().map_or(0, |(_total, free)| free)
    }

    #[cfg(target_os = "linux")]
    fn meminfo_field(field: &str) -> Option<u64> {
        let contents = std::fs::read_to_string("/proc/meminfo").ok()?;
        for line in contents.lines() {
            if let Some(rest) = line.strip_prefix(field) {
                let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
                return Some(kb);
            }
        }
        None
    }

    #[cfg(target_os = "linux")]
    fn sysinfo_ram() -> Option<(u64, u64)> {
        let mut info: libc::sysinfo = unsafe { mem::zeroed() };
        if unsafe { libc::sysinfo(&mut info) } != 0 {
            return None;
        }
        let unit = info.mem_unit as u64;
        Some((info.totalram as u64 * unit, info.freeram as u64 * unit))
    }

    #[cfg(not(target_os = "linux"))]
    fn sysinfo_ram() -> Option<(u64, u64)> {
        None
    }
}

#[cfg(not(unix))]
mod sys {
    use std::path::Path;

    use super::FsStats;

    pub(crate) fn fs_stats(_path: &Path) -> Option<FsStats> {
        None
    }

    pub(crate) fn ram_total() -> u64 {
        0
    }

    pub(crate) fn ram_available() -> u64 {
        0
    }
}
