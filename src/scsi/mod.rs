//! The SCSI command layer: issues commands through the BOT sequencer,
//! interprets sense data, and owns the retry policy for flaky units.
//!
//! Protocol references:
//! - SCSI Primary Commands - 2 (SPC-2):
//!   <https://www.rockbox.org/wiki/pub/Main/DataSheets/spc2r20.pdf>
//! - SCSI Block Commands - 2 (SBC-2):
//!   <https://raw.githubusercontent.com/carmark/papers/master/storage/scsi/sbc2r16.pdf>
//!
//! The probe sequence in [`ScsiChannel::probe_lun`] follows the order
//! described at
//! <https://www.downtowndougbrown.com/2018/12/usb-mass-storage-with-embedded-devices-tips-and-quirks/>;
//! it is not formally documented anywhere, so it was reverse engineered
//! from what the major operating systems actually send.

pub mod command;
pub mod command_descriptor;
pub mod response;

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::usb::bot::{BotChannel, DataPhase};
use crate::usb::cbw::CswStatus;
use command::CommandBlock;
use command_descriptor::OpCode;
use response::{
    Capacity, ModeParameterHeader, SenseData, SenseKey, StandardInquiry, UnitSerialPage,
    CAPACITY10_OVERFLOW,
};

/// How long to let a NOT READY unit spin up before the single retry.
const NOT_READY_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Everything the probe learned about one logical unit.
#[derive(Debug, Clone)]
pub struct LunInfo {
    pub lun: u8,
    pub removable: bool,
    /// The unit accepted Prevent Medium Removal + Start Unit, so teardown
    /// should hand the medium back with the mirror-image sequence.
    pub eject_supported: bool,
    pub write_protect: bool,
    pub fua_supported: bool,
    /// Unit is addressed with the 16-byte command forms.
    pub long_lba: bool,
    pub vendor: String,
    pub product: String,
    pub revision: String,
    pub serial: String,
    pub block_count: u64,
    pub block_len: u32,
}

impl LunInfo {
    pub fn capacity_bytes(&self) -> u64 {
        self.block_count * self.block_len as u64
    }

    /// Per-command ceiling in blocks; the data phase below this is still
    /// split into bulk posts by the BOT layer.
    pub fn max_blocks_per_command(&self) -> u64 {
        if self.long_lba {
            command::MAX_BLOCKS_PER_RW16
        } else {
            command::MAX_BLOCKS_PER_RW10
        }
    }
}

/// What probing one LUN concluded. `MediumAbsent` is an explicit outcome,
/// not an error: the slot exists, there is just nothing in it (think card
/// readers), and the rest of the drive is still worth probing.
#[derive(Debug)]
pub enum ProbeOutcome {
    Ready(Box<LunInfo>),
    MediumAbsent,
}

/// Result of issuing one command through the sense policy.
#[derive(Debug, Clone, Copy)]
pub enum CommandOutcome {
    /// Command is complete; carries the data-phase byte count.
    Done(usize),
    /// The unit reported NOT READY / MEDIUM NOT PRESENT.
    MediumAbsent,
}

/// One device's SCSI face, wrapping its BOT channel. Commands go one at a
/// time; the owning drive's mutex enforces that.
pub struct ScsiChannel {
    bot: BotChannel,
}

impl ScsiChannel {
    pub fn new(bot: BotChannel) -> Self {
        Self { bot }
    }

    pub fn bot_mut(&mut self) -> &mut BotChannel {
        &mut self.bot
    }

    pub async fn lun_count(&mut self) -> Result<u8> {
        self.bot.lun_count().await
    }

    /// Issues one command and applies the sense-key policy:
    ///
    /// - NO SENSE / RECOVERED ERROR / UNIT ATTENTION / COMPLETED pass;
    /// - NOT READY with MEDIUM NOT PRESENT becomes
    ///   [`CommandOutcome::MediumAbsent`];
    /// - any other NOT READY earns one retry after a second's sleep;
    /// - ABORTED COMMAND earns one immediate retry;
    /// - everything else is unrecoverable and surfaces the sense data.
    pub async fn issue(
        &mut self,
        lun: u8,
        cmd: &CommandBlock,
        mut data: DataPhase<'_>,
    ) -> Result<CommandOutcome> {
        debug_assert_ne!(cmd.opcode(), OpCode::RequestSense as u8);

        let mut retried = false;
        loop {
            let status = match self.bot.execute(lun, cmd, data.reborrow()).await {
                Ok(status) => status,
                // A phase error has already triggered reset recovery in the
                // BOT layer; the unit may still have sense data explaining
                // itself, so fall through to the same policy.
                Err(Error::PhaseError) => match self.fetch_sense(lun).await {
                    Ok(sense) => {
                        warn!(lun, %sense, "sense data after phase error");
                        return Err(Error::CheckCondition(sense));
                    }
                    Err(_) => return Err(Error::PhaseError),
                },
                Err(err) => return Err(err),
            };

            if status.status == CswStatus::Passed {
                return Ok(CommandOutcome::Done(status.transferred));
            }

            let sense = self.fetch_sense(lun).await?;
            debug!(lun, opcode = format_args!("{:#04x}", cmd.opcode()), %sense, "command failed");
            match sense.key {
                SenseKey::NoSense
                | SenseKey::RecoveredError
                | SenseKey::UnitAttention
                | SenseKey::Completed => return Ok(CommandOutcome::Done(status.transferred)),
                SenseKey::NotReady if sense.medium_not_present() => {
                    return Ok(CommandOutcome::MediumAbsent);
                }
                SenseKey::NotReady if !retried => {
                    tokio::time::sleep(NOT_READY_RETRY_DELAY).await;
                    retried = true;
                }
                SenseKey::AbortedCommand if !retried => {
                    retried = true;
                }
                _ => return Err(Error::CheckCondition(sense)),
            }
        }
    }

    /// Request Sense (6) outside the policy loop; a unit that cannot even
    /// produce sense data is treated as broken.
    async fn fetch_sense(&mut self, lun: u8) -> Result<SenseData> {
        let cmd = command::request_sense();
        let mut buf = [0u8; command::SENSE_LEN];
        let status = self
            .bot
            .execute(lun, &cmd, DataPhase::In(&mut buf))
            .await?;
        if status.status != CswStatus::Passed {
            return Err(Error::BadCsw);
        }
        SenseData::parse(&buf[..status.transferred])
    }

    /// Runs the probe ladder against one LUN and reports what lives there.
    ///
    /// `conservative` skips the Prevent Removal / Start Unit step for hosts
    /// that must not spin up media behind the user's back.
    pub async fn probe_lun(&mut self, lun: u8, conservative: bool) -> Result<ProbeOutcome> {
        // 1. Standard INQUIRY: only connected direct-access block devices
        //    go any further.
        let mut buf = vec![0u8; command::INQUIRY_LEN];
        let transferred = match self.issue(lun, &command::inquiry(), DataPhase::In(&mut buf)).await? {
            CommandOutcome::Done(transferred) => transferred,
            CommandOutcome::MediumAbsent => return Ok(ProbeOutcome::MediumAbsent),
        };
        let inquiry = StandardInquiry::parse(&buf[..transferred])?;
        if !inquiry.is_direct_access() {
            return Err(Error::UnsupportedPeripheral {
                qualifier: inquiry.peripheral_qualifier,
                device_type: inquiry.peripheral_device_type,
            });
        }
        debug!(
            lun,
            vendor = %inquiry.vendor,
            product = %inquiry.product,
            removable = inquiry.removable,
            "inquiry ok"
        );

        // 2. Unit Serial Number VPD page, with the vendor-specific subfield
        //    of the standard data as fallback. Best-effort throughout.
        let serial = match self.fetch_vpd_serial(lun).await {
            Ok(Some(serial)) if !serial.is_empty() => serial,
            _ => inquiry.vendor_serial.clone(),
        };

        // 3. Claim the medium and spin it up. Advisory: plenty of units
        //    fail Prevent Medium Removal, and that is fine.
        let mut eject_supported = false;
        if inquiry.removable && !conservative {
            let prevented = matches!(
                self.issue(lun, &command::prevent_allow_medium_removal(true), DataPhase::None)
                    .await,
                Ok(CommandOutcome::Done(_))
            );
            if prevented {
                match self.issue(lun, &command::start_stop_unit(true, false), DataPhase::None).await {
                    Ok(CommandOutcome::Done(_)) => eject_supported = true,
                    Ok(CommandOutcome::MediumAbsent) => {
                        self.release_unit(lun, false).await;
                        return Ok(ProbeOutcome::MediumAbsent);
                    }
                    Err(err) => warn!(lun, "start unit failed: {err}"),
                }
            }
        }

        // A started unit gets handed back (allow removal, stop) when any
        // later probe step fails for good.
        match self.finish_probe(lun, inquiry, serial, eject_supported).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.release_unit(lun, eject_supported).await;
                Err(err)
            }
        }
    }

    /// Probe steps after the unit claim: mode bits, readiness, geometry.
    async fn finish_probe(
        &mut self,
        lun: u8,
        inquiry: StandardInquiry,
        serial: String,
        eject_supported: bool,
    ) -> Result<ProbeOutcome> {
        // 4. Write protection and FUA support from the mode parameter
        //    header; MODE SENSE (10) is the fallback form. Units that
        //    reject both get conservative defaults.
        let mode = self.fetch_mode_header(lun).await;
        let (write_protect, fua_supported) = match mode {
            Some(header) => (header.write_protect, header.fua_supported),
            None => {
                warn!(lun, "mode sense rejected in both forms; assuming writable, no FUA");
                (false, false)
            }
        };

        // 5. The unit must answer TEST UNIT READY before capacity is
        //    trustworthy.
        match self.issue(lun, &command::test_unit_ready(), DataPhase::None).await? {
            CommandOutcome::Done(_) => {}
            CommandOutcome::MediumAbsent => {
                self.release_unit(lun, eject_supported).await;
                return Ok(ProbeOutcome::MediumAbsent);
            }
        }

        // 6. Geometry, upgrading to the 16-byte form past the 32-bit line.
        let mut long_lba = false;
        let mut buf = [0u8; 8];
        let capacity = match self.issue(lun, &command::read_capacity10(), DataPhase::In(&mut buf)).await? {
            CommandOutcome::MediumAbsent => {
                self.release_unit(lun, eject_supported).await;
                return Ok(ProbeOutcome::MediumAbsent);
            }
            CommandOutcome::Done(transferred) => {
                let (last_lba, block_len) = Capacity::parse10_raw(&buf[..transferred])?;
                if last_lba == CAPACITY10_OVERFLOW {
                    long_lba = true;
                    let mut buf = [0u8; 32];
                    match self.issue(lun, &command::read_capacity16(), DataPhase::In(&mut buf)).await? {
                        CommandOutcome::MediumAbsent => {
                            self.release_unit(lun, eject_supported).await;
                            return Ok(ProbeOutcome::MediumAbsent);
                        }
                        CommandOutcome::Done(transferred) => Capacity::parse16(&buf[..transferred])?,
                    }
                } else {
                    Capacity {
                        block_count: last_lba as u64 + 1,
                        block_len,
                    }
                }
            }
        };

        if capacity.block_count == 0
            || capacity.block_len == 0
            || capacity.block_len % 512 != 0
            || capacity.block_len > 4096
        {
            return Err(Error::BadGeometry {
                block_count: capacity.block_count,
                block_len: capacity.block_len,
            });
        }

        let info = LunInfo {
            lun,
            removable: inquiry.removable,
            eject_supported,
            write_protect,
            fua_supported,
            long_lba,
            vendor: inquiry.vendor,
            product: inquiry.product,
            revision: inquiry.revision,
            serial,
            block_count: capacity.block_count,
            block_len: capacity.block_len,
        };
        info!(
            lun,
            blocks = info.block_count,
            block_len = info.block_len,
            long_lba,
            write_protect,
            fua = fua_supported,
            "lun ready"
        );
        Ok(ProbeOutcome::Ready(Box::new(info)))
    }

    async fn fetch_vpd_serial(&mut self, lun: u8) -> Result<Option<String>> {
        // Header first to learn the page length, then the full page.
        let mut header = [0u8; 4];
        let transferred = match self
            .issue(lun, &command::inquiry_vpd(0x80, 4), DataPhase::In(&mut header))
            .await?
        {
            CommandOutcome::Done(transferred) => transferred,
            CommandOutcome::MediumAbsent => return Ok(None),
        };
        let page_len = UnitSerialPage::page_length(&header[..transferred])?;
        if page_len == 0 {
            return Ok(None);
        }

        // Allocation length is a single byte in the 6-byte CDB.
        let total = (4 + page_len as usize).min(255);
        let mut page = vec![0u8; total];
        let transferred = match self
            .issue(lun, &command::inquiry_vpd(0x80, total as u8), DataPhase::In(&mut page))
            .await?
        {
            CommandOutcome::Done(transferred) => transferred,
            CommandOutcome::MediumAbsent => return Ok(None),
        };
        Ok(Some(UnitSerialPage::parse(&page[..transferred])?.serial))
    }

    async fn fetch_mode_header(&mut self, lun: u8) -> Option<ModeParameterHeader> {
        let mut buf = [0u8; 192];
        if let Ok(CommandOutcome::Done(transferred)) = self
            .issue(lun, &command::mode_sense6(0x3F, 192), DataPhase::In(&mut buf))
            .await
        {
            if let Ok(header) = ModeParameterHeader::parse6(&buf[..transferred]) {
                return Some(header);
            }
        }

        let mut buf = [0u8; 256];
        if let Ok(CommandOutcome::Done(transferred)) = self
            .issue(lun, &command::mode_sense10(0x3F, 256), DataPhase::In(&mut buf))
            .await
        {
            if let Ok(header) = ModeParameterHeader::parse10(&buf[..transferred]) {
                return Some(header);
            }
        }
        None
    }

    /// Mirror image of the probe's claim step: allow removal again and,
    /// when the unit went through a successful start, stop it with eject.
    pub async fn release_unit(&mut self, lun: u8, stop: bool) {
        let _ = self
            .issue(lun, &command::prevent_allow_medium_removal(false), DataPhase::None)
            .await;
        if stop {
            let _ = self
                .issue(lun, &command::start_stop_unit(false, true), DataPhase::None)
                .await;
        }
    }

    /// Reads whole blocks. `buf` must be an exact multiple of the block
    /// length; requests beyond the per-command ceiling are split
    /// transparently.
    pub async fn read_blocks(&mut self, info: &LunInfo, lba: u64, buf: &mut [u8]) -> Result<()> {
        let block_len = info.block_len as u64;
        debug_assert_eq!(buf.len() as u64 % block_len, 0);
        let total_blocks = buf.len() as u64 / block_len;
        if lba + total_blocks > info.block_count {
            return Err(Error::OutOfRange { lba, count: total_blocks });
        }

        let fua = info.fua_supported;
        let mut done = 0u64;
        while done < total_blocks {
            let n = (total_blocks - done).min(info.max_blocks_per_command());
            let cmd = if info.long_lba {
                command::read16(lba + done, n as u32, fua)
            } else {
                command::read10((lba + done) as u32, n as u16, fua)
            };
            let start = (done * block_len) as usize;
            let end = start + (n * block_len) as usize;
            match self.issue(info.lun, &cmd, DataPhase::In(&mut buf[start..end])).await? {
                CommandOutcome::Done(transferred) if transferred == end - start => {}
                CommandOutcome::Done(transferred) => {
                    return Err(Error::ShortTransfer {
                        expected: end - start,
                        actual: transferred,
                    });
                }
                CommandOutcome::MediumAbsent => return Err(Error::MediumNotPresent),
            }
            done += n;
        }
        Ok(())
    }

    /// Writes whole blocks, honoring the FUA policy: when the unit
    /// advertises FUA the bit is set on every write, since no host-side
    /// write cache exists to make up for a lying device cache.
    pub async fn write_blocks(&mut self, info: &LunInfo, lba: u64, buf: &[u8]) -> Result<()> {
        let block_len = info.block_len as u64;
        debug_assert_eq!(buf.len() as u64 % block_len, 0);
        let total_blocks = buf.len() as u64 / block_len;
        if lba + total_blocks > info.block_count {
            return Err(Error::OutOfRange { lba, count: total_blocks });
        }

        let fua = info.fua_supported;
        let mut done = 0u64;
        while done < total_blocks {
            let n = (total_blocks - done).min(info.max_blocks_per_command());
            let cmd = if info.long_lba {
                command::write16(lba + done, n as u32, fua)
            } else {
                command::write10((lba + done) as u32, n as u16, fua)
            };
            let start = (done * block_len) as usize;
            let end = start + (n * block_len) as usize;
            match self.issue(info.lun, &cmd, DataPhase::Out(&buf[start..end])).await? {
                CommandOutcome::Done(_) => {}
                CommandOutcome::MediumAbsent => return Err(Error::MediumNotPresent),
            }
            done += n;
        }
        Ok(())
    }

    /// Synchronize Cache in the form matching the unit's addressing. Units
    /// without a cache reject this with ILLEGAL REQUEST; that is a pass.
    pub async fn flush_cache(&mut self, info: &LunInfo) -> Result<()> {
        let cmd = if info.long_lba {
            command::synchronize_cache16()
        } else {
            command::synchronize_cache10()
        };
        match self.issue(info.lun, &cmd, DataPhase::None).await {
            Ok(_) => Ok(()),
            Err(Error::CheckCondition(sense)) if sense.key == SenseKey::IllegalRequest => {
                debug!(lun = info.lun, "unit does not implement synchronize cache");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
