//! The Bulk-Only Transport sequencer: one Command/Data/Status round trip
//! per SCSI command, plus the reset-recovery dance for when a device loses
//! the plot.
//!
//! The host starts out by sending a 31-byte command block wrapper (CBW) to
//! the drive, optionally sending or receiving data depending on what
//! command it is, and then reading a 13-byte command status wrapper (CSW)
//! containing the result of the command. Devices in the field deviate from
//! that script in a handful of well-known ways -- stalling the CBW,
//! answering the data phase with an early CSW, stalling the CSW once --
//! and this module owns exactly those deviations.

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::scsi::command::CommandBlock;
use crate::usb::cbw::{CommandBlockWrapper, CommandStatusWrapper, CswStatus, CSW_LEN};
use crate::usb::UsbTransport;

/// Largest number of bytes moved by a single bulk post during the data
/// phase. Larger requests are split into posts of this size; the
/// per-command block-count limits live in the SCSI layer.
pub const MAX_DATA_CHUNK: usize = 8 * 1024 * 1024;

/// Result of one completed BOT round trip. `Failed` status means the
/// command itself was rejected and sense data is waiting; the transport is
/// fine either way.
#[derive(Debug, Clone, Copy)]
pub struct CommandStatus {
    pub status: CswStatus,
    pub residue: u32,
    /// Bytes actually moved in the data phase.
    pub transferred: usize,
}

/// Data phase of one command, from the host's point of view.
pub enum DataPhase<'a> {
    In(&'a mut [u8]),
    Out(&'a [u8]),
    None,
}

impl DataPhase<'_> {
    /// Reborrows so a retry can replay the same buffers.
    pub fn reborrow(&mut self) -> DataPhase<'_> {
        match self {
            DataPhase::In(buf) => DataPhase::In(&mut **buf),
            DataPhase::Out(buf) => DataPhase::Out(&**buf),
            DataPhase::None => DataPhase::None,
        }
    }

    fn len(&self) -> usize {
        match self {
            DataPhase::In(buf) => buf.len(),
            DataPhase::Out(buf) => buf.len(),
            DataPhase::None => 0,
        }
    }
}

/// One device's command channel. Exclusive access is assumed: the owning
/// drive serializes commands with its mutex, which also makes the fresh
/// random tag of each CBW the only one in flight.
pub struct BotChannel {
    transport: UsbTransport,
}

impl BotChannel {
    pub fn new(transport: UsbTransport) -> Self {
        Self { transport }
    }

    pub fn transport_mut(&mut self) -> &mut UsbTransport {
        &mut self.transport
    }

    pub async fn lun_count(&mut self) -> Result<u8> {
        self.transport.lun_count().await
    }

    /// Runs one full command: CBW out, data phase in buffer-sized posts,
    /// CSW in. Returns the device's verdict; transport-level trouble comes
    /// back as an error after reset-recovery has already been performed.
    pub async fn execute(
        &mut self,
        lun: u8,
        command: &CommandBlock,
        mut data: DataPhase<'_>,
    ) -> Result<CommandStatus> {
        let tag: u32 = rand::thread_rng().r#gen();
        let cbw = CommandBlockWrapper {
            tag,
            data_transfer_length: data.len() as u32,
            direction: command.direction,
            lun,
            command_len: command.len(),
            command: command.bytes(),
        };

        debug!(lun, tag, opcode = format_args!("{:#04x}", command.opcode()), "issuing command");

        // Command phase. A stall here means the device rejected the CBW
        // itself; reset-recover and give up on this command.
        match self.transport.bulk_out(&cbw.to_bytes()).await {
            Ok(_) => {}
            Err(Error::Stall) => {
                warn!(tag, "CBW stalled; performing reset recovery");
                self.reset_recovery().await;
                return Err(Error::Stall);
            }
            Err(err) => return Err(err),
        }

        // Data phase.
        let mut transferred = 0usize;
        match data.reborrow() {
            DataPhase::None => {}
            DataPhase::Out(buf) => {
                while transferred < buf.len() {
                    let end = (transferred + MAX_DATA_CHUNK).min(buf.len());
                    let chunk_len = end - transferred;
                    let sent = match self.transport.bulk_out(&buf[transferred..end]).await {
                        Ok(sent) => sent,
                        Err(Error::Stall) => {
                            warn!(tag, "bulk OUT stalled mid data phase; performing reset recovery");
                            self.reset_recovery().await;
                            return Err(Error::Stall);
                        }
                        Err(err) => return Err(err),
                    };
                    transferred += sent;
                    if sent < chunk_len {
                        // Device accepted less than posted; let the CSW's
                        // residue tell the rest of the story.
                        break;
                    }
                }
            }
            DataPhase::In(buf) => {
                while transferred < buf.len() {
                    let want = (buf.len() - transferred).min(MAX_DATA_CHUNK);
                    let chunk = match self.transport.bulk_in(want).await {
                        Ok(chunk) => chunk,
                        Err(Error::Stall) => {
                            warn!(tag, "bulk IN stalled mid data phase; performing reset recovery");
                            self.reset_recovery().await;
                            return Err(Error::Stall);
                        }
                        Err(err) => return Err(err),
                    };

                    // Some devices answer a data-IN request with the CSW
                    // straight away (typically when the command failed and
                    // there is no data to give). Accept any frame that
                    // validates as our CSW and complete the command with
                    // the status it reports.
                    if chunk.len() == CSW_LEN {
                        if let Some(csw) = CommandStatusWrapper::parse(&chunk) {
                            if csw.tag == tag {
                                debug!(tag, status = ?csw.status, "early CSW in data phase");
                                if csw.status == CswStatus::PhaseError {
                                    self.reset_recovery().await;
                                    return Err(Error::PhaseError);
                                }
                                return Ok(CommandStatus {
                                    status: csw.status,
                                    residue: csw.data_residue,
                                    transferred,
                                });
                            }
                        }
                    }

                    buf[transferred..transferred + chunk.len()].copy_from_slice(&chunk);
                    transferred += chunk.len();
                    if chunk.len() < want {
                        // Short packet terminates the transfer.
                        break;
                    }
                }
            }
        }

        // Status phase.
        let csw = self.read_csw(tag).await?;
        if csw.status == CswStatus::PhaseError {
            warn!(tag, "CSW reports phase error; performing reset recovery");
            self.reset_recovery().await;
            return Err(Error::PhaseError);
        }
        Ok(CommandStatus {
            status: csw.status,
            residue: csw.data_residue,
            transferred,
        })
    }

    /// Reads and validates the CSW. One stall is tolerated: clear the halt
    /// and ask again, per BOT spec figure 2. A generic transfer error is
    /// cross-checked against the endpoint's halt status first -- some
    /// bridges report a halted endpoint that way instead of as a STALL.
    async fn read_csw(&mut self, tag: u32) -> Result<CommandStatusWrapper> {
        let raw = match self.transport.bulk_in(CSW_LEN).await {
            Ok(raw) => raw,
            Err(err) => {
                let stalled = match &err {
                    Error::Stall => true,
                    Error::Transfer(_) => {
                        // The halt feature is authoritative; a STALL can
                        // surface as a generic fault on some stacks.
                        matches!(
                            self.transport
                                .endpoint_halted(nusb::transfer::Direction::In)
                                .await,
                            Ok(true)
                        )
                    }
                    _ => false,
                };
                if !stalled {
                    return Err(err);
                }
                debug!("CSW read hit a halted endpoint; clearing and retrying once");
                self.transport.clear_halt_in().await?;
                self.transport.bulk_in(CSW_LEN).await?
            }
        };

        let Some(csw) = CommandStatusWrapper::parse(&raw) else {
            warn!(len = raw.len(), "unparseable CSW; performing reset recovery");
            self.reset_recovery().await;
            return Err(Error::BadCsw);
        };
        if csw.tag != tag {
            warn!(sent = tag, received = csw.tag, "CSW tag mismatch; performing reset recovery");
            self.reset_recovery().await;
            return Err(Error::TagMismatch { sent: tag, received: csw.tag });
        }
        Ok(csw)
    }

    /// Reset recovery, BOT spec section 5.3.4: Bulk-Only Mass Storage
    /// Reset, then clear the halt condition on both bulk endpoints. Each
    /// step is best-effort; a device that is mid-unplug fails all three.
    pub async fn reset_recovery(&mut self) {
        if let Err(err) = self.transport.mass_storage_reset().await {
            warn!("mass storage reset failed: {err}");
        }
        if let Err(err) = self.transport.clear_halt_in().await {
            warn!("clear halt (IN) failed: {err}");
        }
        if let Err(err) = self.transport.clear_halt_out().await {
            warn!("clear halt (OUT) failed: {err}");
        }
    }
}
