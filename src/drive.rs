//! Drive and LUN lifecycle: everything between "an interface appeared"
//! and "these partitions are ready to mount", plus the teardown path.

use std::sync::Arc;

use nusb::{DeviceId, DeviceInfo};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::part::{self, FsKind, PartitionEntry};
use crate::scsi::{LunInfo, ProbeOutcome, ScsiChannel};
use crate::usb::bot::BotChannel;
use crate::usb::UsbTransport;

/// Self-referencing extended-partition chains exist in the wild; stop
/// following links after this many EBRs.
const MAX_EBR_LINKS: usize = 64;

/// One probed logical unit and the partitions found on it.
#[derive(Debug, Clone)]
pub struct Lun {
    pub info: LunInfo,
    pub partitions: Vec<PartitionEntry>,
}

/// One attached drive: USB identity, its serialized command channel, and
/// every LUN that probed successfully. LUNs that reported an absent
/// medium stay listed with an empty partition table.
pub struct Drive {
    pub usb_id: DeviceId,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: String,
    pub product: String,
    pub serial: String,
    pub channel: Arc<Mutex<ScsiChannel>>,
    pub luns: Vec<Lun>,
}

impl Drive {
    /// Brings up one freshly reported interface: claim, endpoints, LUN
    /// count, per-LUN probe, partition scan. A LUN that fails its probe is
    /// skipped; a drive with usable transport but zero ready LUNs still
    /// attaches (an empty card reader looks exactly like that).
    pub async fn attach(device_info: &DeviceInfo, interface_number: u8, conservative: bool) -> Result<Self> {
        info!(
            vendor_id = format_args!("{:04x}", device_info.vendor_id()),
            product_id = format_args!("{:04x}", device_info.product_id()),
            "attaching mass storage device"
        );
        let device = device_info.open().await?;
        let transport = UsbTransport::open(&device, interface_number).await?;
        let mut channel = ScsiChannel::new(BotChannel::new(transport));

        let lun_count = channel.lun_count().await?;
        let mut luns = Vec::new();
        for lun in 0..lun_count {
            match channel.probe_lun(lun, conservative).await {
                Ok(ProbeOutcome::Ready(lun_info)) => {
                    let partitions = scan_partitions(&mut channel, &lun_info).await;
                    luns.push(Lun {
                        info: *lun_info,
                        partitions,
                    });
                }
                Ok(ProbeOutcome::MediumAbsent) => {
                    // The slot is real (think card readers); the drive
                    // stays attached, just without this unit.
                    info!(lun, "no medium present; skipping lun");
                }
                Err(err) => {
                    warn!(lun, "lun probe failed: {err}");
                }
            }
        }

        Ok(Self {
            usb_id: device_info.id(),
            vendor_id: device_info.vendor_id(),
            product_id: device_info.product_id(),
            manufacturer: device_info
                .manufacturer_string()
                .unwrap_or_default()
                .to_string(),
            product: device_info.product_string().unwrap_or_default().to_string(),
            serial: device_info.serial_number().unwrap_or_default().to_string(),
            channel: Arc::new(Mutex::new(channel)),
            luns,
        })
    }

    /// Graceful teardown, for library exit or explicit unmount of the
    /// last volume: flush write caches, then hand each removable unit
    /// back. `surprise` means the hardware is already gone and there is
    /// no one left to talk to.
    pub async fn shutdown(&self, surprise: bool) {
        if surprise {
            debug!("device already removed; skipping scsi teardown");
            return;
        }
        let mut channel = self.channel.lock().await;
        for lun in &self.luns {
            if !lun.info.write_protect {
                if let Err(err) = channel.flush_cache(&lun.info).await {
                    warn!(lun = lun.info.lun, "cache flush on shutdown failed: {err}");
                }
            }
            if lun.info.removable {
                channel.release_unit(lun.info.lun, lun.info.eject_supported).await;
            }
        }
    }
}

/// Reads one or more whole blocks off a LUN into a fresh buffer.
async fn read_lba(
    channel: &mut ScsiChannel,
    info: &LunInfo,
    lba: u64,
    blocks: u64,
) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; (blocks * info.block_len as u64) as usize];
    channel.read_blocks(info, lba, &mut buf).await?;
    Ok(buf)
}

/// Reads the partition table of one LUN and tags each partition by magic
/// probe. Table trouble degrades to "no partitions", never to a failed
/// drive.
pub async fn scan_partitions(channel: &mut ScsiChannel, info: &LunInfo) -> Vec<PartitionEntry> {
    match scan_partitions_inner(channel, info).await {
        Ok(partitions) => partitions,
        Err(err) => {
            warn!(lun = info.lun, "partition scan failed: {err}");
            Vec::new()
        }
    }
}

async fn scan_partitions_inner(
    channel: &mut ScsiChannel,
    info: &LunInfo,
) -> Result<Vec<PartitionEntry>> {
    let sector0 = read_lba(channel, info, 0, 1).await?;
    let mbr = part::Mbr::parse(&sector0)?;

    // Candidate LBA ranges, before the filesystem probe.
    let mut ranges: Vec<(u64, u64)> = Vec::new();

    if mbr.is_gpt() {
        // Protective MBR: the real table is the GPT at LBA 1.
        let header_sector = read_lba(channel, info, 1, 1).await?;
        let header = part::GptHeader::parse(&header_sector)?;
        let array_blocks =
            (header.entry_array_len() as u64).div_ceil(info.block_len as u64).max(1);
        let array = read_lba(channel, info, header.partition_entry_lba, array_blocks).await?;
        for entry in part::gpt_entries(&array, &header) {
            ranges.push((entry.start_lba, entry.size_blocks()));
        }
    } else {
        for entry in mbr.entries.iter().filter(|e| e.is_used()) {
            if entry.is_extended() {
                // Walk the EBR chain. Logical partition starts are
                // relative to their own EBR; chain links are relative to
                // the extended container.
                let container = entry.start_lba as u64;
                let mut link = 0u64;
                for _ in 0..MAX_EBR_LINKS {
                    let sector = read_lba(channel, info, container + link, 1).await?;
                    let ebr = part::Ebr::parse(&sector)?;
                    if let Some(logical) = ebr.partition {
                        ranges.push((
                            container + link + logical.start_lba as u64,
                            logical.num_sectors as u64,
                        ));
                    }
                    match ebr.next {
                        Some(next) => link = next.start_lba as u64,
                        None => break,
                    }
                }
            } else {
                ranges.push((entry.start_lba as u64, entry.num_sectors as u64));
            }
        }
    }

    let mut partitions = Vec::new();
    for (start_lba, size_blocks) in ranges {
        if size_blocks == 0 || start_lba + size_blocks > info.block_count {
            warn!(
                lun = info.lun,
                start_lba, size_blocks, "partition exceeds unit bounds; skipping"
            );
            continue;
        }

        // The magic probe wants the partition's boot sector and, for EXT,
        // the superblock at partition byte offset 1024.
        let probe_blocks = (2048u64.div_ceil(info.block_len as u64)).min(size_blocks);
        let kind = match read_lba(channel, info, start_lba, probe_blocks).await {
            Ok(bytes) => {
                let boot = &bytes[..512.min(bytes.len())];
                let superblock = if bytes.len() >= 2048 { &bytes[1024..2048] } else { &[][..] };
                part::probe_fs(boot, superblock)
            }
            Err(err) => {
                warn!(lun = info.lun, start_lba, "filesystem probe read failed: {err}");
                FsKind::Unknown
            }
        };

        debug!(lun = info.lun, start_lba, size_blocks, %kind, "partition found");
        partitions.push(PartitionEntry {
            index: partitions.len() as u8,
            kind,
            start_lba,
            size_blocks,
        });
    }

    Ok(partitions)
}
