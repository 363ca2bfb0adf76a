//! USB mass storage host: takes freshly attached bulk-only mass storage
//! devices and turns them into mounted, POSIX-like volumes addressed as
//! `ums0:`, `ums1:`, ...
//!
//! The stack, bottom to top: the USB transport ([`usb`]) wraps the host
//! service's control and bulk primitives; the BOT sequencer
//! ([`usb::bot`]) runs the Command/Data/Status round trips; the SCSI
//! layer ([`scsi`]) probes logical units and moves sectors; the drive
//! lifecycle ([`drive`]) and partition parsing ([`part`]) decide what is
//! mountable; the block adapter ([`block`]) and filesystem adapters
//! ([`fs`]) feed the filesystem libraries; the registry ([`mount`]) and
//! hotplug monitor ([`monitor`]) keep the mounted set current.
//!
//! # Usage
//!
//! ```no_run
//! # async fn demo() -> umsfs::Result<()> {
//! let host = umsfs::UmsHost::init(umsfs::HostFlags::empty()).await?;
//! let mut status = host.status_events();
//!
//! status.changed().await.ok();
//! for device in host.list_mounted_devices() {
//!     println!("{}: {} {} ({} bytes)", device.name, device.vendor, device.product, device.capacity_bytes);
//! }
//! host.exit().await;
//! # Ok(())
//! # }
//! ```
//!
//! File and directory operations run on arbitrary caller threads and
//! block on device I/O; do not drive them from async worker threads.

pub mod block;
pub mod drive;
pub mod error;
pub mod fs;
pub mod monitor;
pub mod mount;
pub mod part;
pub mod scsi;
pub mod usb;

use std::io::SeekFrom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use tokio::sync::{oneshot, watch};
use tracing::info;

pub use crate::error::{Error, Result};
pub use crate::fs::{DirEntry, Errno, Fd, FileStat, OpenFlags, VfsStat};
pub use crate::mount::MountedDeviceInfo;
pub use crate::part::FsKind;
pub use crate::scsi::LunInfo;

use crate::monitor::{HostShared, PopulateCallback};
use crate::mount::{volume_path, MountEntry, MountTable};

bitflags! {
    /// Host-wide behavior flags passed to [`UmsHost::init`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostFlags: u32 {
        /// Skip the Prevent Medium Removal / Start Unit step of the LUN
        /// probe: never spin media up behind the user's back.
        const CONSERVATIVE_PROBE = 1 << 0;
    }
}

bitflags! {
    /// Per-mount behavior flags, applied to volumes mounted after
    /// [`UmsHost::set_default_mount_flags`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MountFlags: u32 {
        const UPDATE_ACCESS_TIMES = 1 << 0;
        const SHOW_HIDDEN_FILES = 1 << 1;
        const SHOW_SYSTEM_FILES = 1 << 2;
        const IGNORE_CASE_SENSITIVITY = 1 << 3;
        const IGNORE_HIBERNATION = 1 << 4;
        /// NTFS: mount despite the volume read-only flag.
        const IGNORE_READ_ONLY = 1 << 5;
        /// NTFS: accept a volume with a dirty log.
        const RECOVER_DIRTY_VOLUME = 1 << 6;
        /// Mount everything read-only regardless of the medium.
        const READ_ONLY = 1 << 7;
    }
}

/// Only one host context may exist per process; the registry namespace
/// (`umsN`) is process-wide.
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// The host context: owns the hotplug monitor and fronts the registry.
/// Created by [`UmsHost::init`], torn down by [`UmsHost::exit`].
pub struct UmsHost {
    shared: Arc<HostShared>,
    exit_tx: watch::Sender<bool>,
    monitor: Option<tokio::task::JoinHandle<()>>,
}

impl UmsHost {
    /// Spins up the hotplug monitor and returns once its initial device
    /// scan has completed. Must be called from within a tokio runtime.
    pub async fn init(flags: HostFlags) -> Result<Self> {
        if INITIALIZED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyInitialized);
        }

        let (status_tx, _) = watch::channel(0u64);
        let shared = Arc::new(HostShared {
            mounts: Mutex::new(MountTable::new()),
            status_tx,
            populate: Mutex::new(None),
            default_mount_flags: Mutex::new(MountFlags::empty()),
            host_flags: flags,
            runtime: tokio::runtime::Handle::current(),
        });

        let (exit_tx, exit_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor::run(shared.clone(), exit_rx, ready_tx));

        if ready_rx.await.is_err() {
            INITIALIZED.store(false, Ordering::SeqCst);
            return Err(Error::MonitorStart);
        }
        info!("host initialized");
        Ok(Self {
            shared,
            exit_tx,
            monitor: Some(monitor),
        })
    }

    /// Signals the monitor's exit event and waits for it to drain the
    /// drive table (unmount, cache flush, stop units).
    pub async fn exit(mut self) {
        let _ = self.exit_tx.send(true);
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.await;
        }
        INITIALIZED.store(false, Ordering::SeqCst);
        info!("host exited");
    }

    /// The public status-change event: the value bumps on every
    /// attach/detach/unmount pass; await `changed()` to wake on it.
    pub fn status_events(&self) -> watch::Receiver<u64> {
        self.shared.status_tx.subscribe()
    }

    pub fn mounted_device_count(&self) -> usize {
        self.shared.mounts.lock().expect("mount table poisoned").count()
    }

    /// Snapshot of every mounted volume. Two calls with no intervening
    /// hotplug activity return equal snapshots.
    pub fn list_mounted_devices(&self) -> Vec<MountedDeviceInfo> {
        self.shared.mounts.lock().expect("mount table poisoned").list()
    }

    /// Unmounts one volume by name (`"ums0"` or `"ums0:"`), flushing the
    /// filesystem and the device cache first.
    pub async fn unmount_device(&self, name: &str, signal_status_change: bool) -> Result<()> {
        let name = name.strip_suffix(':').unwrap_or(name);
        monitor::unmount_by_name(&self.shared, name, signal_status_change).await
    }

    /// Stores the callback the monitor invokes with a mounted-list
    /// snapshot after every reconciliation pass.
    pub fn set_populate_callback(
        &self,
        callback: impl Fn(&[MountedDeviceInfo]) + Send + Sync + 'static,
    ) {
        let callback: PopulateCallback = Box::new(callback);
        *self.shared.populate.lock().expect("callback poisoned") = Some(callback);
    }

    pub fn clear_populate_callback(&self) {
        *self.shared.populate.lock().expect("callback poisoned") = None;
    }

    /// Flags applied to volumes mounted from now on; already-mounted
    /// volumes keep what they were mounted with.
    pub fn set_default_mount_flags(&self, flags: MountFlags) {
        *self.shared.default_mount_flags.lock().expect("flags poisoned") = flags;
    }

    /// Handle to one mounted volume's operations table.
    pub fn volume(&self, name: &str) -> Result<VolumeHandle> {
        let name = name.strip_suffix(':').unwrap_or(name);
        let entry = self
            .shared
            .mounts
            .lock()
            .expect("mount table poisoned")
            .get(name)
            .ok_or_else(|| Error::NoSuchDevice(name.to_string()))?;
        Ok(VolumeHandle { entry })
    }

    /// Resolves a `"umsN:path"` user path to its volume handle and the
    /// normalized volume-absolute remainder, applying the volume's
    /// current directory to relative forms.
    pub fn resolve_path(&self, path: &str) -> Result<(VolumeHandle, String)> {
        let (name, rest) = mount::split_mount_path(path)?;
        let handle = self.volume(name)?;
        let resolved = volume_path(&handle.entry, rest);
        Ok((handle, resolved))
    }
}

impl Drop for UmsHost {
    fn drop(&mut self) {
        if self.monitor.is_some() {
            // Exit without join: signal the monitor and release the
            // process-wide slot; the task drains on its own time.
            let _ = self.exit_tx.send(true);
            INITIALIZED.store(false, Ordering::SeqCst);
        }
    }
}

/// One mounted volume's POSIX-like operations, callable from any
/// non-async thread. All paths are volume-relative; a leading `/` makes
/// them absolute, anything else resolves against the volume's current
/// directory.
///
/// Operations on a volume whose device has been unplugged or unmounted
/// fail with [`Errno::NoDev`].
#[derive(Clone)]
pub struct VolumeHandle {
    entry: Arc<MountEntry>,
}

impl VolumeHandle {
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn info(&self) -> &MountedDeviceInfo {
        &self.entry.info
    }

    fn with_volume<T>(
        &self,
        op: impl FnOnce(&mut dyn fs::VolumeOps) -> std::result::Result<T, Errno>,
    ) -> std::result::Result<T, Errno> {
        if !self.entry.is_alive() {
            return Err(Errno::NoDev);
        }
        let mut volume = self.entry.volume.lock().map_err(|_| Errno::Io)?;
        op(volume.as_mut())
    }

    fn resolve(&self, path: &str) -> String {
        volume_path(&self.entry, path)
    }

    pub fn open(&self, path: &str, flags: OpenFlags) -> std::result::Result<Fd, Errno> {
        let path = self.resolve(path);
        self.with_volume(|volume| volume.open(&path, flags))
    }

    pub fn close(&self, fd: Fd) -> std::result::Result<(), Errno> {
        self.with_volume(|volume| volume.close(fd))
    }

    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> std::result::Result<usize, Errno> {
        self.with_volume(|volume| volume.read(fd, buf))
    }

    pub fn write(&self, fd: Fd, buf: &[u8]) -> std::result::Result<usize, Errno> {
        self.with_volume(|volume| volume.write(fd, buf))
    }

    pub fn seek(&self, fd: Fd, pos: SeekFrom) -> std::result::Result<u64, Errno> {
        self.with_volume(|volume| volume.seek(fd, pos))
    }

    pub fn fstat(&self, fd: Fd) -> std::result::Result<FileStat, Errno> {
        self.with_volume(|volume| volume.fstat(fd))
    }

    pub fn truncate(&self, fd: Fd, len: u64) -> std::result::Result<(), Errno> {
        self.with_volume(|volume| volume.truncate(fd, len))
    }

    pub fn fsync(&self, fd: Fd) -> std::result::Result<(), Errno> {
        self.with_volume(|volume| volume.fsync(fd))
    }

    pub fn stat(&self, path: &str) -> std::result::Result<FileStat, Errno> {
        let path = self.resolve(path);
        self.with_volume(|volume| volume.stat(&path))
    }

    pub fn unlink(&self, path: &str) -> std::result::Result<(), Errno> {
        let path = self.resolve(path);
        self.with_volume(|volume| volume.unlink(&path))
    }

    pub fn rename(&self, from: &str, to: &str) -> std::result::Result<(), Errno> {
        let from = self.resolve(from);
        let to = self.resolve(to);
        self.with_volume(|volume| volume.rename(&from, &to))
    }

    pub fn mkdir(&self, path: &str) -> std::result::Result<(), Errno> {
        let path = self.resolve(path);
        self.with_volume(|volume| volume.mkdir(&path))
    }

    pub fn rmdir(&self, path: &str) -> std::result::Result<(), Errno> {
        let path = self.resolve(path);
        self.with_volume(|volume| volume.rmdir(&path))
    }

    pub fn read_dir(&self, path: &str) -> std::result::Result<Vec<DirEntry>, Errno> {
        let path = self.resolve(path);
        self.with_volume(|volume| volume.read_dir(&path))
    }

    pub fn statvfs(&self) -> std::result::Result<VfsStat, Errno> {
        self.with_volume(|volume| volume.statvfs())
    }

    /// Sets the volume's current directory, the base for relative paths.
    pub fn chdir(&self, path: &str) -> std::result::Result<(), Errno> {
        let path = self.resolve(path);
        let stat = self.with_volume(|volume| volume.stat(&path))?;
        if !stat.is_dir {
            return Err(Errno::NotDir);
        }
        *self.entry.cwd.lock().map_err(|_| Errno::Io)? = path;
        Ok(())
    }

    pub fn cwd(&self) -> String {
        self.entry
            .cwd
            .lock()
            .map(|cwd| cwd.clone())
            .unwrap_or_else(|_| "/".to_string())
    }
}
