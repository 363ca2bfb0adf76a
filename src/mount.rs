//! Mount slots, the process-wide registry, and the `umsN:` namespace.
//!
//! Slots are reserved lowest-first and the derived names (`ums0`,
//! `ums1`, ...) are unique across the process for as long as the mount
//! lives. The registry holds its own mutex, always taken before any
//! device mutex, and never across an await point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nusb::DeviceId;
use tokio::runtime::Handle;
use tracing::info;

use crate::block::{PartitionIo, PartitionStore};
use crate::drive::{Drive, Lun};
use crate::error::{Error, Result};
use crate::fs::ext::ExtVolume;
use crate::fs::fat::FatVolume;
use crate::fs::ntfs::NtfsVolume;
use crate::fs::{Errno, VolumeOps};
use crate::part::{FsKind, PartitionEntry};
use crate::MountFlags;

/// Ceiling on simultaneously mounted volumes.
pub const MAX_MOUNTS: usize = 32;

/// Everything `list_mounted_devices` reports per volume.
#[derive(Debug, Clone)]
pub struct MountedDeviceInfo {
    /// Mount name without the colon, e.g. `ums0`.
    pub name: String,
    pub vendor: String,
    pub product: String,
    pub serial: String,
    pub lun_index: u8,
    pub partition_index: u8,
    pub fs: FsKind,
    pub capacity_bytes: u64,
    pub write_protect: bool,
}

/// One live mount. Dropping the last `Arc` drops the filesystem object
/// and with it the block adapter; `alive` flips false at unmount so
/// handles still held by callers start failing with `ENODEV` instead of
/// touching a gone device.
pub(crate) struct MountEntry {
    pub name: String,
    pub slot: usize,
    pub device_id: DeviceId,
    pub info: MountedDeviceInfo,
    pub store: Arc<PartitionStore>,
    pub volume: Mutex<Box<dyn VolumeOps>>,
    pub cwd: Mutex<String>,
    alive: AtomicBool,
}

impl MountEntry {
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn invalidate(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

/// The slot table. Indices are reused lowest-first, so the set of active
/// slots is dense right after allocation and sparse in general.
pub(crate) struct MountTable {
    slots: Vec<Option<Arc<MountEntry>>>,
}

impl MountTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn list(&self) -> Vec<MountedDeviceInfo> {
        self.slots
            .iter()
            .flatten()
            .map(|entry| entry.info.clone())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<MountEntry>> {
        self.slots
            .iter()
            .flatten()
            .find(|entry| entry.name == name)
            .cloned()
    }

    /// Registers a fully built volume in the lowest free slot.
    pub fn register(
        &mut self,
        device_id: DeviceId,
        mut info: MountedDeviceInfo,
        store: Arc<PartitionStore>,
        volume: Box<dyn VolumeOps>,
    ) -> Result<Arc<MountEntry>> {
        let slot = match self.slots.iter().position(Option::is_none) {
            Some(slot) => slot,
            None if self.slots.len() < MAX_MOUNTS => {
                self.slots.push(None);
                self.slots.len() - 1
            }
            None => return Err(Error::OutOfSlots),
        };

        let name = format!("ums{slot}");
        info.name = name.clone();
        let entry = Arc::new(MountEntry {
            name: name.clone(),
            slot,
            device_id,
            info,
            store,
            volume: Mutex::new(volume),
            cwd: Mutex::new("/".to_string()),
            alive: AtomicBool::new(true),
        });
        self.slots[slot] = Some(entry.clone());
        info!(%name, "volume registered");
        Ok(entry)
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<MountEntry>> {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|entry| entry.name == name) {
                let entry = slot.take();
                if let Some(entry) = &entry {
                    entry.invalidate();
                }
                return entry;
            }
        }
        None
    }

    /// Pulls every mount belonging to one device; used on detach.
    pub fn remove_device(&mut self, device_id: DeviceId) -> Vec<Arc<MountEntry>> {
        let mut removed = Vec::new();
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|entry| entry.device_id == device_id) {
                if let Some(entry) = slot.take() {
                    entry.invalidate();
                    removed.push(entry);
                }
            }
        }
        removed
    }
}

/// Builds the block adapter and filesystem volume for one partition and
/// registers it. Blocking (the filesystem mount reads the device); must
/// run off the async workers. Failure at any step releases everything
/// acquired so far by plain drop order.
pub(crate) fn mount_partition(
    table: &Mutex<MountTable>,
    runtime: &Handle,
    drive: &Drive,
    lun: &Lun,
    partition: &PartitionEntry,
    flags: MountFlags,
) -> Result<Arc<MountEntry>> {
    let read_only = lun.info.write_protect || flags.contains(MountFlags::READ_ONLY);
    let store = Arc::new(PartitionStore::new(
        drive.channel.clone(),
        lun.info.clone(),
        partition.start_lba,
        partition.size_blocks,
        read_only,
    ));
    let io = PartitionIo::new(store.clone(), runtime.clone());

    let volume: Box<dyn VolumeOps> = match partition.kind {
        FsKind::Fat12 | FsKind::Fat16 | FsKind::Fat32 => Box::new(FatVolume::mount(io, flags)?),
        FsKind::Ntfs => Box::new(NtfsVolume::mount(io, flags)?),
        FsKind::Ext2 | FsKind::Ext3 | FsKind::Ext4 => Box::new(ExtVolume::mount(io, flags)?),
        FsKind::ExFat | FsKind::Unknown => return Err(Error::Fs(Errno::NoDev)),
    };

    let serial = if lun.info.serial.is_empty() {
        drive.serial.clone()
    } else {
        lun.info.serial.clone()
    };
    let info = MountedDeviceInfo {
        name: String::new(), // filled in by register
        vendor: lun.info.vendor.clone(),
        product: lun.info.product.clone(),
        serial,
        lun_index: lun.info.lun,
        partition_index: partition.index,
        fs: partition.kind,
        capacity_bytes: partition.size_blocks * lun.info.block_len as u64,
        write_protect: lun.info.write_protect,
    };

    let mut table = table.lock().expect("mount table poisoned");
    table.register(drive.usb_id, info, store, volume)
}

/// Splits a user path into its mount name and remainder:
/// `"ums0:/a/b"` and `"ums0:a/b"` both resolve, the former absolute, the
/// latter relative to the volume's current directory.
pub fn split_mount_path(path: &str) -> Result<(&str, &str)> {
    let (name, rest) = path
        .split_once(':')
        .ok_or_else(|| Error::BadPath(path.to_string()))?;
    if name.is_empty() {
        return Err(Error::BadPath(path.to_string()));
    }
    Ok((name, rest))
}

/// Folds `.`/`..` and duplicate separators into a canonical
/// volume-absolute path. `..` at the root stays at the root.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for piece in path.split('/') {
        match piece {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    let mut out = String::from("/");
    out.push_str(&parts.join("/"));
    out
}

/// Applies the volume cwd to a relative remainder.
pub(crate) fn volume_path(entry: &MountEntry, rest: &str) -> String {
    if rest.starts_with('/') {
        normalize_path(rest)
    } else {
        let cwd = entry.cwd.lock().expect("cwd poisoned");
        normalize_path(&format!("{}/{}", *cwd, rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_absolute_and_relative_forms() {
        assert_eq!(split_mount_path("ums0:/a/b").unwrap(), ("ums0", "/a/b"));
        assert_eq!(split_mount_path("ums12:rel").unwrap(), ("ums12", "rel"));
        assert_eq!(split_mount_path("ums0:").unwrap(), ("ums0", ""));
        assert!(split_mount_path("/no/prefix").is_err());
        assert!(split_mount_path(":oops").is_err());
    }

    #[test]
    fn normalizes_dots_and_separators() {
        assert_eq!(normalize_path("/a/b/c"), "/a/b/c");
        assert_eq!(normalize_path("a//b/./c"), "/a/b/c");
        assert_eq!(normalize_path("/a/../b"), "/b");
        assert_eq!(normalize_path("/../.."), "/");
        assert_eq!(normalize_path(""), "/");
    }
}
