//! The hotplug monitor: one background task that owns the drive table,
//! reconciles it against the host service on every interface-state
//! change, and fans the result out through the status event and the
//! optional populate callback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_lite::StreamExt;
use nusb::DeviceId;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::drive::Drive;
use crate::error::{Error, Result};
use crate::mount::{self, MountEntry, MountTable, MountedDeviceInfo};
use crate::usb::enumerate_bot_devices;
use crate::{HostFlags, MountFlags};

/// User-supplied callback invoked with a snapshot of the mounted list
/// after every reconciliation pass.
pub type PopulateCallback = Box<dyn Fn(&[MountedDeviceInfo]) + Send + Sync>;

/// Grace period between a hotplug event and the rescan; devices need a
/// moment to finish enumerating, and a burst of events becomes one pass.
const SETTLE_DELAY: Duration = Duration::from_millis(250);

/// Rescan cadence when the host service cannot deliver hotplug events.
const RESCAN_INTERVAL: Duration = Duration::from_secs(2);

/// State shared between the monitor task and the public facade.
pub(crate) struct HostShared {
    pub mounts: Mutex<MountTable>,
    pub status_tx: watch::Sender<u64>,
    pub populate: Mutex<Option<PopulateCallback>>,
    pub default_mount_flags: Mutex<MountFlags>,
    pub host_flags: HostFlags,
    pub runtime: Handle,
}

impl HostShared {
    /// Bumps the public status-change event.
    pub fn signal_status(&self) {
        self.status_tx.send_modify(|generation| *generation += 1);
    }

    pub fn notify_populate(&self) {
        let snapshot = self.mounts.lock().expect("mount table poisoned").list();
        if let Some(callback) = &*self.populate.lock().expect("callback poisoned") {
            callback(&snapshot);
        }
    }
}

/// Monitor task body. Holds the drive table exclusively; everything the
/// facade needs goes through [`HostShared`].
pub(crate) async fn run(
    shared: Arc<HostShared>,
    mut exit_rx: watch::Receiver<bool>,
    ready_tx: oneshot::Sender<()>,
) {
    let mut drives: HashMap<DeviceId, Arc<Drive>> = HashMap::new();

    let mut hotplug = match nusb::watch_devices() {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            warn!("hotplug events unavailable ({err}); falling back to periodic rescan");
            None
        }
    };

    // Devices present before init get picked up by this first pass.
    reconcile(&shared, &mut drives).await;
    let _ = ready_tx.send(());

    loop {
        let mut stream_ended = false;
        match &mut hotplug {
            Some(watcher) => {
                tokio::select! {
                    _ = exit_rx.changed() => break,
                    event = watcher.next() => match event {
                        Some(event) => debug!(?event, "hotplug event"),
                        None => stream_ended = true,
                    },
                }
            }
            None => {
                tokio::select! {
                    _ = exit_rx.changed() => break,
                    _ = tokio::time::sleep(RESCAN_INTERVAL) => {}
                }
            }
        }
        if stream_ended {
            warn!("hotplug stream ended; falling back to periodic rescan");
            hotplug = None;
            continue;
        }

        tokio::time::sleep(SETTLE_DELAY).await;
        reconcile(&shared, &mut drives).await;
    }

    info!("library exit: detaching all drives");
    let ids: Vec<DeviceId> = drives.keys().copied().collect();
    for id in ids {
        if let Some(drive) = drives.remove(&id) {
            detach(&shared, drive, false).await;
        }
    }
    shared.signal_status();
}

/// One reconciliation pass: diff the host service's interface set against
/// the drive table, detach the missing, attach the new, publish.
async fn reconcile(shared: &Arc<HostShared>, drives: &mut HashMap<DeviceId, Arc<Drive>>) {
    let current = match enumerate_bot_devices().await {
        Ok(devices) => devices,
        Err(err) => {
            warn!("device enumeration failed: {err}");
            return;
        }
    };
    let mut present: HashMap<DeviceId, (nusb::DeviceInfo, u8)> = current
        .into_iter()
        .map(|(device_info, interface)| (device_info.id(), (device_info, interface)))
        .collect();

    let gone: Vec<DeviceId> = drives
        .keys()
        .filter(|id| !present.contains_key(id))
        .copied()
        .collect();
    for id in gone {
        if let Some(drive) = drives.remove(&id) {
            info!(product = %drive.product, "device removed");
            detach(shared, drive, true).await;
        }
    }

    let fresh: Vec<DeviceId> = present
        .keys()
        .filter(|id| !drives.contains_key(id))
        .copied()
        .collect();
    for id in fresh {
        let Some((device_info, interface)) = present.remove(&id) else {
            continue;
        };
        let conservative = shared.host_flags.contains(HostFlags::CONSERVATIVE_PROBE);
        match Drive::attach(&device_info, interface, conservative).await {
            Ok(drive) => {
                let drive = Arc::new(drive);
                mount_drive(shared, &drive).await;
                drives.insert(id, drive);
            }
            Err(err) => {
                // The drive simply does not appear in the mounted list;
                // the status event below still fires.
                warn!("drive failed to initialize: {err}");
            }
        }
    }

    shared.signal_status();
    shared.notify_populate();
}

/// Mounts every recognized partition of a freshly attached drive.
/// Filesystem mounts do blocking reads, so each one runs on the blocking
/// pool.
async fn mount_drive(shared: &Arc<HostShared>, drive: &Arc<Drive>) {
    let flags = *shared.default_mount_flags.lock().expect("flags poisoned");
    for lun in &drive.luns {
        for partition in &lun.partitions {
            if !partition.kind.is_mountable() {
                debug!(
                    lun = lun.info.lun,
                    index = partition.index,
                    kind = %partition.kind,
                    "partition left unmounted"
                );
                continue;
            }
            let shared = shared.clone();
            let drive = drive.clone();
            let lun = lun.clone();
            let partition_for_task = partition.clone();
            let mounted = tokio::task::spawn_blocking(move || {
                mount::mount_partition(
                    &shared.mounts,
                    &shared.runtime,
                    &drive,
                    &lun,
                    &partition_for_task,
                    flags,
                )
            })
            .await;
            match mounted {
                Ok(Ok(entry)) => info!(name = %entry.name, fs = %entry.info.fs, "volume mounted"),
                Ok(Err(err)) => warn!(index = partition.index, "mount failed: {err}"),
                Err(err) => warn!("mount task panicked: {err}"),
            }
        }
    }
}

/// Tears one drive down: registry entries out first, then the SCSI
/// goodbye (skipped when the hardware is already gone).
pub(crate) async fn detach(shared: &Arc<HostShared>, drive: Arc<Drive>, surprise: bool) {
    let entries = shared
        .mounts
        .lock()
        .expect("mount table poisoned")
        .remove_device(drive.usb_id);
    for entry in entries {
        info!(name = %entry.name, "unmounting");
        if !surprise {
            flush_volume(&entry).await;
        }
        release_entry(entry);
    }
    drive.shutdown(surprise).await;
}

/// Explicit single-volume unmount from the public API.
pub(crate) async fn unmount_by_name(
    shared: &Arc<HostShared>,
    name: &str,
    signal_status_change: bool,
) -> Result<()> {
    let entry = shared
        .mounts
        .lock()
        .expect("mount table poisoned")
        .remove(name)
        .ok_or_else(|| Error::NoSuchDevice(name.to_string()))?;
    flush_volume(&entry).await;
    release_entry(entry);
    if signal_status_change {
        shared.signal_status();
        shared.notify_populate();
    }
    Ok(())
}

/// Flushes a volume front to back: filesystem sync on the blocking pool,
/// then Synchronize Cache toward the device.
async fn flush_volume(entry: &Arc<MountEntry>) {
    let blocking_entry = entry.clone();
    let synced = tokio::task::spawn_blocking(move || {
        blocking_entry
            .volume
            .lock()
            .expect("volume poisoned")
            .sync()
    })
    .await;
    match synced {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(name = %entry.name, "volume sync failed: {err}"),
        Err(err) => warn!(name = %entry.name, "volume sync task panicked: {err}"),
    }
    if let Err(err) = entry.store.flush().await {
        warn!(name = %entry.name, "device cache flush failed: {err}");
    }
}

/// Drops our reference on the blocking pool: the filesystem object's own
/// drop may issue device I/O, which must not run on an async worker.
fn release_entry(entry: Arc<MountEntry>) {
    tokio::task::spawn_blocking(move || drop(entry));
}
