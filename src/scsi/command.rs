//! Representations for SCSI commands.
//!
//! This module uses the term "command descriptor" to describe the struct
//! behind a CDB, and the term "command block" to describe a black box
//! containing a valid CDB. Commands are exposed as functions that return a
//! [`CommandBlock`]; the functions wrap the more granular descriptor
//! structs from [`command_descriptor`](super::command_descriptor).

use super::command_descriptor::*;
use crate::usb::cbw::CbwDirection;

/// Fixed-format sense data allocation, enough for key/ASC/ASCQ.
pub const SENSE_LEN: usize = 18;

/// Mandatory standard INQUIRY data is 36 bytes; the next 8 are the
/// vendor-specific field that many sticks use for a serial number, so ask
/// for those too and let the residue report what actually exists.
pub const INQUIRY_LEN: usize = 44;

/// Largest transfer a Read(10)/Write(10) can address.
pub const MAX_BLOCKS_PER_RW10: u64 = 0xFFFF;

/// Largest transfer issued per Read(16)/Write(16). The field is 32 bits
/// wide but commodity bridges fall over past 0x10000 blocks, so that is
/// the ceiling used here.
pub const MAX_BLOCKS_PER_RW16: u64 = 0x1_0000;

/// A serialized command block ready to be wrapped in a CBW.
#[derive(Debug, Clone)]
pub struct CommandBlock {
    bytes: [u8; 16],
    len: u8,
    pub direction: CbwDirection,
    /// Expected data-phase length for commands with a fixed-size response;
    /// zero where the caller's buffer is authoritative (block I/O).
    pub data_transfer_len: u32,
}

impl CommandBlock {
    fn from_cdb(cdb: &[u8], direction: CbwDirection, data_transfer_len: u32) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..cdb.len()].copy_from_slice(cdb);
        Self {
            bytes,
            len: cdb.len() as u8,
            direction,
            data_transfer_len,
        }
    }

    /// Significant CDB length; always 6, 10, or 16 here.
    pub fn len(&self) -> u8 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The command block padded to the 16 bytes a CBW carries, per USB
    /// Mass Storage Class - Bulk Only Transport section 5.1 (CBWCB).
    pub fn bytes(&self) -> [u8; 16] {
        self.bytes
    }

    pub fn opcode(&self) -> u8 {
        self.bytes[0]
    }
}

/// "The TEST UNIT READY command provides a means to check if the logical
/// unit is ready. If the logical unit is able to accept an appropriate
/// medium access command without returning CHECK CONDITION status, this
/// command shall return a GOOD status."
///
/// SPC-2 7.25
pub fn test_unit_ready() -> CommandBlock {
    let cdb = X6CommandDescriptor {
        operation_code: OpCode::TestUnitReady,
        fields: [0; 3],
        length: 0,
        control: 0,
    }
    .encode();
    CommandBlock::from_cdb(&cdb, CbwDirection::NonDirectional, 0)
}

/// "The REQUEST SENSE command requests that the device server transfer
/// sense data to the application client."
///
/// SPC-2 7.20; fixed format, 18 bytes requested.
pub fn request_sense() -> CommandBlock {
    let cdb = X6CommandDescriptor {
        operation_code: OpCode::RequestSense,
        fields: [0; 3],
        length: SENSE_LEN as u8,
        control: 0,
    }
    .encode();
    CommandBlock::from_cdb(&cdb, CbwDirection::DataIn, SENSE_LEN as u32)
}

/// "The INQUIRY command requests that information regarding parameters of
/// the target and a component logical unit be sent to the application
/// client."
///
/// SPC-2 7.3.1 table 45; standard data, EVPD clear.
pub fn inquiry() -> CommandBlock {
    let cdb = X6CommandDescriptor {
        operation_code: OpCode::Inquiry,
        fields: [0; 3],
        length: INQUIRY_LEN as u8,
        control: 0,
    }
    .encode();
    CommandBlock::from_cdb(&cdb, CbwDirection::DataIn, INQUIRY_LEN as u32)
}

/// INQUIRY with EVPD set, fetching one vital product data page.
/// Page 0x80 is Unit Serial Number (SPC-2 8.4.6).
pub fn inquiry_vpd(page: u8, allocation: u8) -> CommandBlock {
    let cdb = X6CommandDescriptor {
        operation_code: OpCode::Inquiry,
        fields: [0x01, page, 0],
        length: allocation,
        control: 0,
    }
    .encode();
    CommandBlock::from_cdb(&cdb, CbwDirection::DataIn, allocation as u32)
}

/// MODE SENSE (6), SPC-2 7.8. DBD is set: the block descriptors would sit
/// between the header and the pages and nothing here wants them. The
/// interesting part of the response is the device-specific byte in the
/// 4-byte header (WP and DPOFUA bits).
pub fn mode_sense6(page_code: u8, allocation: u8) -> CommandBlock {
    let cdb = X6CommandDescriptor {
        operation_code: OpCode::ModeSense6,
        fields: [0x08, page_code & 0x3F, 0],
        length: allocation,
        control: 0,
    }
    .encode();
    CommandBlock::from_cdb(&cdb, CbwDirection::DataIn, allocation as u32)
}

/// MODE SENSE (10), SPC-2 7.10; fallback for units that reject the 6-byte
/// form. Header grows to 8 bytes, same device-specific bits.
pub fn mode_sense10(page_code: u8, allocation: u16) -> CommandBlock {
    let cdb = X10CommandDescriptor {
        operation_code: OpCode::ModeSense10,
        flags: 0x08,
        logical_block_address: (page_code as u32 & 0x3F) << 24,
        group: 0,
        length: allocation,
        control: 0,
    }
    .encode();
    CommandBlock::from_cdb(&cdb, CbwDirection::DataIn, allocation as u32)
}

/// "The START STOP UNIT command requests that the device server enable or
/// disable the logical unit for media access operations."
///
/// SBC-2 5.1.14. `load_eject` asks removable media to physically eject on
/// stop.
pub fn start_stop_unit(start: bool, load_eject: bool) -> CommandBlock {
    let mut op = 0u8;
    if start {
        op |= 0x01;
    }
    if load_eject {
        op |= 0x02;
    }
    let cdb = X6CommandDescriptor {
        operation_code: OpCode::StartStopUnit,
        fields: [0, 0, 0],
        length: op,
        control: 0,
    }
    .encode();
    CommandBlock::from_cdb(&cdb, CbwDirection::NonDirectional, 0)
}

/// "The PREVENT ALLOW MEDIUM REMOVAL command requests that the target
/// enable or disable the removal of the medium in the logical unit."
///
/// SPC-2 7.12. Advisory on most sticks; plenty of them fail it outright.
pub fn prevent_allow_medium_removal(prevent: bool) -> CommandBlock {
    let cdb = X6CommandDescriptor {
        operation_code: OpCode::PreventAllowMediumRemoval,
        fields: [0, 0, 0],
        length: prevent as u8,
        control: 0,
    }
    .encode();
    CommandBlock::from_cdb(&cdb, CbwDirection::NonDirectional, 0)
}

/// "The READ CAPACITY command provides a means for the application client
/// to request information regarding the capacity of the block device."
///
/// SBC-2 5.1.10; 8-byte response. A unit past the 32-bit line answers
/// 0xFFFFFFFF blocks and must be re-queried with [`read_capacity16`].
pub fn read_capacity10() -> CommandBlock {
    let cdb = X10CommandDescriptor {
        operation_code: OpCode::ReadCapacity10,
        flags: 0,
        logical_block_address: 0,
        group: 0,
        length: 0,
        control: 0,
    }
    .encode();
    CommandBlock::from_cdb(&cdb, CbwDirection::DataIn, 8)
}

/// READ CAPACITY (16), carried as SERVICE ACTION IN (16) with service
/// action 0x10. SBC-3 5.15; 32-byte response including the full 64-bit
/// block count.
pub fn read_capacity16() -> CommandBlock {
    let cdb = X16CommandDescriptor {
        operation_code: OpCode::ServiceActionIn16,
        flags: 0x10,
        logical_block_address: 0,
        length: 32,
        group: 0,
        control: 0,
    }
    .encode();
    CommandBlock::from_cdb(&cdb, CbwDirection::DataIn, 32)
}

fn rw_flags(fua: bool) -> u8 {
    if fua { 0x08 } else { 0x00 }
}

/// READ (10), SBC-2 5.1.5. At most [`MAX_BLOCKS_PER_RW10`] blocks.
pub fn read10(lba: u32, blocks: u16, fua: bool) -> CommandBlock {
    let cdb = X10CommandDescriptor {
        operation_code: OpCode::Read10,
        flags: rw_flags(fua),
        logical_block_address: lba,
        group: 0,
        length: blocks,
        control: 0,
    }
    .encode();
    CommandBlock::from_cdb(&cdb, CbwDirection::DataIn, 0)
}

/// WRITE (10), SBC-2 5.1.21.
pub fn write10(lba: u32, blocks: u16, fua: bool) -> CommandBlock {
    let cdb = X10CommandDescriptor {
        operation_code: OpCode::Write10,
        flags: rw_flags(fua),
        logical_block_address: lba,
        group: 0,
        length: blocks,
        control: 0,
    }
    .encode();
    CommandBlock::from_cdb(&cdb, CbwDirection::DataOut, 0)
}

/// READ (16), SBC-2 5.1.7; the long-LBA form for units past 2 TiB.
pub fn read16(lba: u64, blocks: u32, fua: bool) -> CommandBlock {
    let cdb = X16CommandDescriptor {
        operation_code: OpCode::Read16,
        flags: rw_flags(fua),
        logical_block_address: lba,
        length: blocks,
        group: 0,
        control: 0,
    }
    .encode();
    CommandBlock::from_cdb(&cdb, CbwDirection::DataIn, 0)
}

/// WRITE (16), SBC-2 5.1.23.
pub fn write16(lba: u64, blocks: u32, fua: bool) -> CommandBlock {
    let cdb = X16CommandDescriptor {
        operation_code: OpCode::Write16,
        flags: rw_flags(fua),
        logical_block_address: lba,
        length: blocks,
        group: 0,
        control: 0,
    }
    .encode();
    CommandBlock::from_cdb(&cdb, CbwDirection::DataOut, 0)
}

/// SYNCHRONIZE CACHE (10), SBC-2 5.1.15, whole-unit form (LBA 0, count 0).
pub fn synchronize_cache10() -> CommandBlock {
    let cdb = X10CommandDescriptor {
        operation_code: OpCode::SynchronizeCache10,
        flags: 0,
        logical_block_address: 0,
        group: 0,
        length: 0,
        control: 0,
    }
    .encode();
    CommandBlock::from_cdb(&cdb, CbwDirection::NonDirectional, 0)
}

/// SYNCHRONIZE CACHE (16), SBC-3 5.19, whole-unit form.
pub fn synchronize_cache16() -> CommandBlock {
    let cdb = X16CommandDescriptor {
        operation_code: OpCode::SynchronizeCache16,
        flags: 0,
        logical_block_address: 0,
        length: 0,
        group: 0,
        control: 0,
    }
    .encode();
    CommandBlock::from_cdb(&cdb, CbwDirection::NonDirectional, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inquiry_is_a_6_byte_data_in_command() {
        let cmd = inquiry();
        assert_eq!(cmd.len(), 6);
        assert_eq!(cmd.opcode(), 0x12);
        assert_eq!(cmd.direction, CbwDirection::DataIn);
        assert_eq!(cmd.data_transfer_len, INQUIRY_LEN as u32);
        assert!(cmd.bytes()[6..].iter().all(|&b| b == 0));
    }

    #[test]
    fn read10_encodes_lba_count_and_fua() {
        let cmd = read10(0x0076_1FFF, 0x0040, true);
        let bytes = cmd.bytes();
        assert_eq!(bytes[0], 0x28);
        assert_eq!(bytes[1], 0x08);
        assert_eq!(&bytes[2..6], &[0x00, 0x76, 0x1F, 0xFF]);
        assert_eq!(&bytes[7..9], &[0x00, 0x40]);
    }

    #[test]
    fn write16_addresses_past_the_32_bit_line() {
        let cmd = write16(0x1_0000_0000, 0x1_0000, false);
        let bytes = cmd.bytes();
        assert_eq!(bytes[0], 0x8A);
        assert_eq!(&bytes[2..10], &0x1_0000_0000u64.to_be_bytes());
        assert_eq!(&bytes[10..14], &0x1_0000u32.to_be_bytes());
        assert_eq!(cmd.direction, CbwDirection::DataOut);
    }

    #[test]
    fn start_stop_unit_bits() {
        assert_eq!(start_stop_unit(true, false).bytes()[4], 0x01);
        assert_eq!(start_stop_unit(false, true).bytes()[4], 0x02);
        assert_eq!(start_stop_unit(false, false).bytes()[4], 0x00);
    }

    #[test]
    fn read_capacity16_is_service_action_in() {
        let cmd = read_capacity16();
        let bytes = cmd.bytes();
        assert_eq!(bytes[0], 0x9E);
        assert_eq!(bytes[1], 0x10);
        assert_eq!(&bytes[10..14], &32u32.to_be_bytes());
    }
}
