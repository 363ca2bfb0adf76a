//! Representations for responses to SCSI commands.
//!
//! Parsers take the raw data-phase bytes and validate lengths themselves;
//! devices routinely return less than the allocation length, so every
//! parser states its own minimum. All multi-byte fields are big-endian.

use std::fmt;

use crate::error::{Error, Result};

/// ADDITIONAL SENSE CODE for "MEDIUM NOT PRESENT" (SPC-2 annex C).
pub const ASC_MEDIUM_NOT_PRESENT: u8 = 0x3A;

/// Standard INQUIRY data, SPC-2 7.3.2 table 46.
#[derive(Debug, Clone)]
pub struct StandardInquiry {
    /// Bits 7:5 of byte 0. "0b000 - the specified device type is currently
    /// connected" (table 47); anything else is not a usable unit here.
    pub peripheral_qualifier: u8,
    /// Bits 4:0 of byte 0; 0x00 is a direct-access block device (table 48).
    pub peripheral_device_type: u8,
    /// RMB, bit 7 of byte 1.
    pub removable: bool,
    pub vendor: String,
    pub product: String,
    pub revision: String,
    /// Bytes 36..44 are formally vendor-specific, but in practice that is
    /// where sticks without a VPD page keep their serial number.
    pub vendor_serial: String,
}

impl StandardInquiry {
    /// "The standard INQUIRY data shall contain at least 36 bytes"
    /// (SPC-2 7.3.2).
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 36 {
            return Err(Error::ShortTransfer {
                expected: 36,
                actual: buf.len(),
            });
        }
        let vendor_serial = if buf.len() >= 44 {
            ascii_field(&buf[36..44])
        } else {
            String::new()
        };
        Ok(Self {
            peripheral_qualifier: buf[0] >> 5,
            peripheral_device_type: buf[0] & 0x1F,
            removable: buf[1] & 0x80 != 0,
            vendor: ascii_field(&buf[8..16]),
            product: ascii_field(&buf[16..32]),
            revision: ascii_field(&buf[32..36]),
            vendor_serial,
        })
    }

    /// A usable unit is a connected direct-access block device.
    pub fn is_direct_access(&self) -> bool {
        self.peripheral_qualifier == 0 && self.peripheral_device_type == 0
    }
}

/// Unit Serial Number VPD page (0x80), SPC-2 8.4.6.
#[derive(Debug, Clone)]
pub struct UnitSerialPage {
    pub serial: String,
}

impl UnitSerialPage {
    /// Returns the page length advertised in a 4-byte header fetch, so the
    /// caller can come back for the full page.
    pub fn page_length(header: &[u8]) -> Result<u8> {
        if header.len() < 4 || header[1] != 0x80 {
            return Err(Error::ShortTransfer {
                expected: 4,
                actual: header.len(),
            });
        }
        Ok(header[3])
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        let length = Self::page_length(buf)? as usize;
        let end = (4 + length).min(buf.len());
        Ok(Self {
            serial: ascii_field(&buf[4..end]),
        })
    }
}

/// The device-specific parameter bits common to both mode parameter
/// headers: WP (bit 7) and DPOFUA (bit 4). SBC-2 table 66.
#[derive(Debug, Clone, Copy)]
pub struct ModeParameterHeader {
    pub write_protect: bool,
    pub fua_supported: bool,
}

impl ModeParameterHeader {
    /// MODE SENSE (6) header, 4 bytes; device-specific byte is byte 2.
    pub fn parse6(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(Error::ShortTransfer {
                expected: 4,
                actual: buf.len(),
            });
        }
        Ok(Self::from_device_specific(buf[2]))
    }

    /// MODE SENSE (10) header, 8 bytes; device-specific byte is byte 3.
    pub fn parse10(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(Error::ShortTransfer {
                expected: 8,
                actual: buf.len(),
            });
        }
        Ok(Self::from_device_specific(buf[3]))
    }

    fn from_device_specific(byte: u8) -> Self {
        Self {
            write_protect: byte & 0x80 != 0,
            fua_supported: byte & 0x10 != 0,
        }
    }
}

/// Unit geometry as reported by READ CAPACITY. The wire carries the *last*
/// LBA; this struct carries the count.
#[derive(Debug, Clone, Copy)]
pub struct Capacity {
    pub block_count: u64,
    pub block_len: u32,
}

/// READ CAPACITY (10) answers with this when the unit has more than 2^32
/// blocks, meaning the 16-byte form must be used instead.
pub const CAPACITY10_OVERFLOW: u32 = 0xFFFF_FFFF;

impl Capacity {
    /// 8-byte READ CAPACITY (10) response, SBC-2 table 28. The caller must
    /// check for [`CAPACITY10_OVERFLOW`] *before* converting, via
    /// [`Capacity::parse10_raw`].
    pub fn parse10_raw(buf: &[u8]) -> Result<(u32, u32)> {
        if buf.len() < 8 {
            return Err(Error::ShortTransfer {
                expected: 8,
                actual: buf.len(),
            });
        }
        let last_lba = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let block_len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        Ok((last_lba, block_len))
    }

    /// 32-byte READ CAPACITY (16) response, SBC-3 table 39.
    pub fn parse16(buf: &[u8]) -> Result<Self> {
        if buf.len() < 12 {
            return Err(Error::ShortTransfer {
                expected: 12,
                actual: buf.len(),
            });
        }
        let last_lba = u64::from_be_bytes([
            buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
        ]);
        let block_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        Ok(Self {
            block_count: last_lba + 1,
            block_len,
        })
    }
}

/// Sense keys, SPC-2 table 107.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenseKey {
    NoSense,
    RecoveredError,
    NotReady,
    MediumError,
    HardwareError,
    IllegalRequest,
    UnitAttention,
    DataProtect,
    BlankCheck,
    VendorSpecific,
    CopyAborted,
    AbortedCommand,
    VolumeOverflow,
    Miscompare,
    Completed,
    Reserved(u8),
}

impl From<u8> for SenseKey {
    fn from(value: u8) -> Self {
        match value & 0x0F {
            0x0 => SenseKey::NoSense,
            0x1 => SenseKey::RecoveredError,
            0x2 => SenseKey::NotReady,
            0x3 => SenseKey::MediumError,
            0x4 => SenseKey::HardwareError,
            0x5 => SenseKey::IllegalRequest,
            0x6 => SenseKey::UnitAttention,
            0x7 => SenseKey::DataProtect,
            0x8 => SenseKey::BlankCheck,
            0x9 => SenseKey::VendorSpecific,
            0xA => SenseKey::CopyAborted,
            0xB => SenseKey::AbortedCommand,
            0xD => SenseKey::VolumeOverflow,
            0xE => SenseKey::Miscompare,
            0xF => SenseKey::Completed,
            other => SenseKey::Reserved(other),
        }
    }
}

/// Fixed-format sense data, SPC-2 7.20.2 table 102: key in byte 2,
/// additional sense code and qualifier in bytes 12 and 13.
#[derive(Debug, Clone, Copy)]
pub struct SenseData {
    pub key: SenseKey,
    pub asc: u8,
    pub ascq: u8,
}

impl SenseData {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 3 {
            return Err(Error::ShortTransfer {
                expected: 3,
                actual: buf.len(),
            });
        }
        // Response codes 0x70/0x71 are current/deferred fixed format;
        // anything else gets a best-effort read of the same offsets.
        let (asc, ascq) = if buf.len() >= 14 {
            (buf[12], buf[13])
        } else {
            (0, 0)
        };
        Ok(Self {
            key: SenseKey::from(buf[2]),
            asc,
            ascq,
        })
    }

    pub fn medium_not_present(&self) -> bool {
        self.key == SenseKey::NotReady && self.asc == ASC_MEDIUM_NOT_PRESENT
    }
}

impl fmt::Display for SenseData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} asc/ascq {:#04x}/{:#04x}",
            self.key, self.asc, self.ascq
        )
    }
}

/// Strips padding and anything non-printable from a fixed-width ASCII
/// field. Devices pad with spaces, NULs, or garbage, sometimes all three.
fn ascii_field(raw: &[u8]) -> String {
    raw.iter()
        .map(|&b| if (0x20..0x7F).contains(&b) { b as char } else { ' ' })
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_inquiry() -> Vec<u8> {
        let mut buf = vec![0u8; 44];
        buf[0] = 0x00; // connected, direct-access
        buf[1] = 0x80; // removable
        buf[8..16].copy_from_slice(b"Generic ");
        buf[16..32].copy_from_slice(b"Mass Storage    ");
        buf[32..36].copy_from_slice(b"1.00");
        buf[36..44].copy_from_slice(b"00000001");
        buf
    }

    #[test]
    fn inquiry_parses_identity_strings() {
        let inquiry = StandardInquiry::parse(&sample_inquiry()).unwrap();
        assert!(inquiry.is_direct_access());
        assert!(inquiry.removable);
        assert_eq!(inquiry.vendor, "Generic");
        assert_eq!(inquiry.product, "Mass Storage");
        assert_eq!(inquiry.revision, "1.00");
        assert_eq!(inquiry.vendor_serial, "00000001");
    }

    #[test]
    fn inquiry_rejects_non_block_devices() {
        let mut buf = sample_inquiry();
        buf[0] = 0x05; // CD/DVD
        let inquiry = StandardInquiry::parse(&buf).unwrap();
        assert!(!inquiry.is_direct_access());

        buf[0] = 0x20; // qualifier 1: supported but not connected
        let inquiry = StandardInquiry::parse(&buf).unwrap();
        assert!(!inquiry.is_direct_access());
    }

    #[test]
    fn inquiry_without_serial_subfield() {
        let inquiry = StandardInquiry::parse(&sample_inquiry()[..36]).unwrap();
        assert_eq!(inquiry.vendor_serial, "");
    }

    #[test]
    fn vpd_serial_page() {
        let mut page = vec![0x00, 0x80, 0x00, 0x0C];
        page.extend_from_slice(b"000000000001");
        let parsed = UnitSerialPage::parse(&page).unwrap();
        assert_eq!(parsed.serial, "000000000001");
        assert_eq!(UnitSerialPage::page_length(&page).unwrap(), 12);
    }

    #[test]
    fn mode_header_bits() {
        // MODE SENSE (6): WP set, DPOFUA clear.
        let hdr = ModeParameterHeader::parse6(&[0x03, 0, 0x80, 0]).unwrap();
        assert!(hdr.write_protect);
        assert!(!hdr.fua_supported);

        // MODE SENSE (10): DPOFUA set.
        let hdr = ModeParameterHeader::parse10(&[0, 0x06, 0, 0x10, 0, 0, 0, 0]).unwrap();
        assert!(!hdr.write_protect);
        assert!(hdr.fua_supported);
    }

    #[test]
    fn capacity10_reports_overflow_marker() {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&0xFFFF_FFFFu32.to_be_bytes());
        buf[4..8].copy_from_slice(&512u32.to_be_bytes());
        let (last_lba, block_len) = Capacity::parse10_raw(&buf).unwrap();
        assert_eq!(last_lba, CAPACITY10_OVERFLOW);
        assert_eq!(block_len, 512);
    }

    #[test]
    fn capacity16_counts_blocks() {
        let mut buf = [0u8; 32];
        buf[0..8].copy_from_slice(&0x1_D1C0_BEAEu64.to_be_bytes());
        buf[8..12].copy_from_slice(&512u32.to_be_bytes());
        let capacity = Capacity::parse16(&buf).unwrap();
        assert_eq!(capacity.block_count, 0x1_D1C0_BEAF);
        assert_eq!(capacity.block_len, 512);
    }

    #[test]
    fn sense_medium_not_present() {
        let mut buf = [0u8; 18];
        buf[0] = 0x70;
        buf[2] = 0x02;
        buf[12] = 0x3A;
        let sense = SenseData::parse(&buf).unwrap();
        assert_eq!(sense.key, SenseKey::NotReady);
        assert!(sense.medium_not_present());
    }
}
