//! The two fixed frames that bracket every Bulk-Only Transport command:
//! the Command Block Wrapper and the Command Status Wrapper.
//!
//! Both frames are little-endian on the wire, per USB Mass Storage Class -
//! Bulk Only Transport sections 5.1 and 5.2. SCSI fields *inside* the
//! command block are big-endian; that distinction is kept out of this
//! module on purpose.

/// "The signature field shall contain the value 43425355h (little endian),
/// indicating a CBW."
///
/// See USB Mass Storage Class - Bulk Only Transport, section 5.1.
pub const CBW_SIGNATURE: u32 = 0x43425355;

/// "Signature that helps identify this packet as a CSW. The signature field
/// shall contain the value 53425355h (little endian)."
///
/// See USB Mass Storage Class - Bulk Only Transport, section 5.2.
pub const CSW_SIGNATURE: u32 = 0x53425355;

/// A CBW is always exactly 31 bytes out.
pub const CBW_LEN: usize = 31;

/// A CSW is always exactly 13 bytes in.
pub const CSW_LEN: usize = 13;

/// Direction of the data phase, encoded in bit 7 of the CBW flags byte.
///
/// `NonDirectional` commands carry no data phase at all; the flags bit is
/// left clear for them, matching what every surveyed OS stack sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbwDirection {
    DataIn,
    DataOut,
    NonDirectional,
}

impl CbwDirection {
    fn flags(self) -> u8 {
        match self {
            CbwDirection::DataIn => 0x80,
            CbwDirection::DataOut | CbwDirection::NonDirectional => 0x00,
        }
    }
}

/// The 31-byte frame that opens a command, built fresh for each submission.
///
/// "The device shall echo the contents of [the tag] field back to the host
/// in the dCSWTag field of the associated CSW. The tag positively
/// associates a CSW with the corresponding CBW."
#[derive(Debug, Clone)]
pub struct CommandBlockWrapper {
    pub tag: u32,
    /// Number of bytes the host expects to move in the data phase.
    pub data_transfer_length: u32,
    pub direction: CbwDirection,
    /// Target logical unit, low 4 bits of byte 13.
    pub lun: u8,
    /// Significant length of `command`, 1..=16.
    pub command_len: u8,
    /// The command block (CBWCB); trailing bytes are zero.
    pub command: [u8; 16],
}

impl CommandBlockWrapper {
    pub fn to_bytes(&self) -> [u8; CBW_LEN] {
        let mut out = [0u8; CBW_LEN];
        out[0..4].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
        out[4..8].copy_from_slice(&self.tag.to_le_bytes());
        out[8..12].copy_from_slice(&self.data_transfer_length.to_le_bytes());
        out[12] = self.direction.flags();
        out[13] = self.lun & 0x0F;
        out[14] = self.command_len & 0x1F;
        out[15..31].copy_from_slice(&self.command);
        out
    }
}

/// Command outcome reported in byte 12 of the CSW.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CswStatus {
    /// 00h - command passed.
    Passed,
    /// 01h - command failed; sense data describes why.
    Failed,
    /// 02h - phase error; the transport itself is out of step and the host
    /// shall perform a reset recovery.
    PhaseError,
}

/// The 13-byte frame that closes a command.
#[derive(Debug, Clone, Copy)]
pub struct CommandStatusWrapper {
    pub tag: u32,
    /// "The difference between the amount of data expected
    /// (dCBWDataTransferLength) and the actual amount of relevant data
    /// processed by the device."
    pub data_residue: u32,
    pub status: CswStatus,
}

impl CommandStatusWrapper {
    /// Parses a received frame. `None` when the buffer is not exactly 13
    /// bytes, the signature is wrong, or the status byte is reserved; the
    /// caller decides whether that means garbage or a mid-data frame.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() != CSW_LEN {
            return None;
        }
        let signature = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if signature != CSW_SIGNATURE {
            return None;
        }
        let status = match buf[12] {
            0x00 => CswStatus::Passed,
            0x01 => CswStatus::Failed,
            0x02 => CswStatus::PhaseError,
            _ => return None,
        };
        Some(Self {
            tag: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            data_residue: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbw_wire_layout() {
        let cbw = CommandBlockWrapper {
            tag: 0xDEAD_BEEF,
            data_transfer_length: 0x24,
            direction: CbwDirection::DataIn,
            lun: 2,
            command_len: 6,
            command: {
                let mut cb = [0u8; 16];
                cb[0] = 0x12;
                cb[4] = 0x24;
                cb
            },
        };
        let bytes = cbw.to_bytes();
        assert_eq!(bytes.len(), CBW_LEN);
        // 'USBC', little-endian.
        assert_eq!(&bytes[0..4], &[0x55, 0x53, 0x42, 0x43]);
        assert_eq!(&bytes[4..8], &[0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(&bytes[8..12], &[0x24, 0x00, 0x00, 0x00]);
        assert_eq!(bytes[12], 0x80);
        assert_eq!(bytes[13], 2);
        assert_eq!(bytes[14], 6);
        assert_eq!(bytes[15], 0x12);
        assert_eq!(bytes[19], 0x24);
        assert!(bytes[21..].iter().all(|&b| b == 0));
    }

    #[test]
    fn lun_and_length_are_masked() {
        let cbw = CommandBlockWrapper {
            tag: 1,
            data_transfer_length: 0,
            direction: CbwDirection::NonDirectional,
            lun: 0xF2,
            command_len: 0xFF,
            command: [0u8; 16],
        };
        let bytes = cbw.to_bytes();
        assert_eq!(bytes[13], 0x02);
        assert_eq!(bytes[14], 0x1F);
    }

    #[test]
    fn csw_roundtrip() {
        let mut wire = [0u8; CSW_LEN];
        wire[0..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        wire[4..8].copy_from_slice(&0xCAFE_F00Du32.to_le_bytes());
        wire[8..12].copy_from_slice(&7u32.to_le_bytes());
        wire[12] = 0x01;

        let csw = CommandStatusWrapper::parse(&wire).expect("valid CSW");
        assert_eq!(csw.tag, 0xCAFE_F00D);
        assert_eq!(csw.data_residue, 7);
        assert_eq!(csw.status, CswStatus::Failed);
    }

    #[test]
    fn csw_rejects_bad_signature_length_and_status() {
        let mut wire = [0u8; CSW_LEN];
        wire[0..4].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
        assert!(CommandStatusWrapper::parse(&wire).is_none());

        let mut wire = [0u8; CSW_LEN];
        wire[0..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        assert!(CommandStatusWrapper::parse(&wire[..12]).is_none());

        let mut wire = [0u8; CSW_LEN];
        wire[0..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        wire[12] = 0x03;
        assert!(CommandStatusWrapper::parse(&wire).is_none());
    }
}
