//! Underlying structures that commands are issued in.
//!
//! Every multi-byte SCSI field is big-endian on the wire, the opposite of
//! the BOT framing around it, so descriptors serialize themselves with
//! explicit `to_be_bytes` conversions rather than relying on an in-memory
//! layout.

/// Operation codes for a Command Descriptor Block, specifying what
/// operation is requested, as described in 7.1 of SPC-2 and the command
/// clauses of SBC-2/SBC-3.
#[repr(u8)]
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// SPC-2 7.25
    TestUnitReady = 0x00,
    /// SPC-2 7.20
    RequestSense = 0x03,
    /// SPC-2 7.3
    Inquiry = 0x12,
    /// SPC-2 7.8
    ModeSense6 = 0x1A,
    /// SBC-2 5.1.14
    StartStopUnit = 0x1B,
    /// SPC-2 7.12
    PreventAllowMediumRemoval = 0x1E,
    /// SBC-2 5.1.10
    ReadCapacity10 = 0x25,
    /// SBC-2 5.1.5
    Read10 = 0x28,
    /// SBC-2 5.1.21
    Write10 = 0x2A,
    /// SBC-2 5.1.15
    SynchronizeCache10 = 0x35,
    /// SPC-2 7.10
    ModeSense10 = 0x5A,
    /// SBC-2 5.1.7
    Read16 = 0x88,
    /// SBC-2 5.1.23
    Write16 = 0x8A,
    /// SBC-3 5.19
    SynchronizeCache16 = 0x91,
    /// SERVICE ACTION IN (16); READ CAPACITY (16) is service action 0x10,
    /// SBC-3 5.15
    ServiceActionIn16 = 0x9E,
}

/// A typical CDB for 6-byte commands, SPC-2 4.3.2 table 1.
///
/// The three middle bytes carry whatever the command clause says they do:
/// a 21-bit logical block address, a page code, or nothing at all. The
/// last payload byte is one of `TRANSFER LENGTH`, `PARAMETER LIST LENGTH`
/// or `ALLOCATION LENGTH` depending on the opcode.
pub struct X6CommandDescriptor {
    pub operation_code: OpCode,
    pub fields: [u8; 3],
    pub length: u8,
    pub control: u8,
}

impl X6CommandDescriptor {
    pub fn encode(&self) -> [u8; 6] {
        [
            self.operation_code as u8,
            self.fields[0],
            self.fields[1],
            self.fields[2],
            self.length,
            self.control,
        ]
    }
}

/// A typical CDB for 10-byte commands, SPC-2 4.3.2 table 2.
pub struct X10CommandDescriptor {
    pub operation_code: OpCode,
    /// Byte 1: per-command flags (FUA, DPO) or a service action.
    pub flags: u8,
    /// Bytes 2..6, big-endian. The logical block address for block
    /// commands; reused as page-code bits by Mode Sense (10).
    pub logical_block_address: u32,
    /// Byte 6, group number / reserved.
    pub group: u8,
    /// Bytes 7..9, big-endian: transfer, parameter-list, or allocation
    /// length.
    pub length: u16,
    pub control: u8,
}

impl X10CommandDescriptor {
    pub fn encode(&self) -> [u8; 10] {
        let lba = self.logical_block_address.to_be_bytes();
        let len = self.length.to_be_bytes();
        [
            self.operation_code as u8,
            self.flags,
            lba[0],
            lba[1],
            lba[2],
            lba[3],
            self.group,
            len[0],
            len[1],
            self.control,
        ]
    }
}

/// A typical CDB for 16-byte commands, SPC-2 4.3.2 table 4. Carries the
/// full 64-bit logical block address used past the 2 TiB line.
pub struct X16CommandDescriptor {
    pub operation_code: OpCode,
    /// Byte 1: per-command flags, or the service action for
    /// `ServiceActionIn16`.
    pub flags: u8,
    /// Bytes 2..10, big-endian.
    pub logical_block_address: u64,
    /// Bytes 10..14, big-endian.
    pub length: u32,
    /// Byte 14, group number / reserved.
    pub group: u8,
    pub control: u8,
}

impl X16CommandDescriptor {
    pub fn encode(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0] = self.operation_code as u8;
        out[1] = self.flags;
        out[2..10].copy_from_slice(&self.logical_block_address.to_be_bytes());
        out[10..14].copy_from_slice(&self.length.to_be_bytes());
        out[14] = self.group;
        out[15] = self.control;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x10_fields_are_big_endian() {
        let cdb = X10CommandDescriptor {
            operation_code: OpCode::Read10,
            flags: 0x08,
            logical_block_address: 0x0102_0304,
            group: 0,
            length: 0xA0B0,
            control: 0,
        }
        .encode();
        assert_eq!(cdb, [0x28, 0x08, 0x01, 0x02, 0x03, 0x04, 0x00, 0xA0, 0xB0, 0x00]);
    }

    #[test]
    fn x16_fields_are_big_endian() {
        let cdb = X16CommandDescriptor {
            operation_code: OpCode::Write16,
            flags: 0x00,
            logical_block_address: 0x0000_0001_0000_0000,
            length: 0x0001_0000,
            group: 0,
            control: 0,
        }
        .encode();
        assert_eq!(
            cdb,
            [
                0x8A, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00,
                0x00, 0x00, 0x00
            ]
        );
    }
}
