//! Partition table parsing: MBR (with the extended-partition chain) and
//! GPT, plus the magic-byte probe that tags each partition's filesystem.
//!
//! Everything here is a pure function over sector bytes; the drive layer
//! owns the actual reads. Partition-table fields are little-endian.

use crate::error::{Error, Result};

/// Filesystem detected inside a partition by the magic probe. The type
/// byte in the MBR is advisory at best, so tagging always goes by what the
/// first sectors of the partition actually contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Fat12,
    Fat16,
    Fat32,
    ExFat,
    Ntfs,
    Ext2,
    Ext3,
    Ext4,
    Unknown,
}

impl FsKind {
    /// Whether a driver exists for this filesystem. Unknown and exFAT
    /// partitions stay in the list but are never mounted.
    pub fn is_mountable(self) -> bool {
        !matches!(self, FsKind::Unknown | FsKind::ExFat)
    }

    pub fn name(self) -> &'static str {
        match self {
            FsKind::Fat12 => "fat12",
            FsKind::Fat16 => "fat16",
            FsKind::Fat32 => "fat32",
            FsKind::ExFat => "exfat",
            FsKind::Ntfs => "ntfs",
            FsKind::Ext2 => "ext2",
            FsKind::Ext3 => "ext3",
            FsKind::Ext4 => "ext4",
            FsKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FsKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One filesystem-bearing LBA range inside a logical unit, as handed to
/// the mounter. `start_lba` is relative to the unit, not to any extended
/// container it was found in.
#[derive(Debug, Clone)]
pub struct PartitionEntry {
    /// Position within the unit's partition list.
    pub index: u8,
    pub kind: FsKind,
    pub start_lba: u64,
    pub size_blocks: u64,
}

/// MBR boot signature at offset 0x1FE.
const MBR_SIGNATURE: u16 = 0xAA55;

/// Partition type byte marking a GPT protective MBR.
const MBR_TYPE_GPT_PROTECTIVE: u8 = 0xEE;

/// CHS and LBA extended-container types.
const MBR_TYPE_EXTENDED: u8 = 0x05;
const MBR_TYPE_EXTENDED_LBA: u8 = 0x0F;

/// One 16-byte slot of an MBR/EBR partition table.
#[derive(Debug, Clone, Copy)]
pub struct MbrEntry {
    pub partition_type: u8,
    pub start_lba: u32,
    pub num_sectors: u32,
}

impl MbrEntry {
    fn parse(raw: &[u8]) -> Self {
        Self {
            partition_type: raw[4],
            start_lba: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            num_sectors: u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]),
        }
    }

    pub fn is_used(&self) -> bool {
        self.partition_type != 0 && self.num_sectors > 0
    }

    pub fn is_extended(&self) -> bool {
        matches!(self.partition_type, MBR_TYPE_EXTENDED | MBR_TYPE_EXTENDED_LBA)
    }

    pub fn is_gpt_protective(&self) -> bool {
        self.partition_type == MBR_TYPE_GPT_PROTECTIVE
    }
}

/// The four primary slots of the MBR at LBA 0.
#[derive(Debug, Clone)]
pub struct Mbr {
    pub entries: [MbrEntry; 4],
}

impl Mbr {
    pub fn parse(sector: &[u8]) -> Result<Self> {
        if sector.len() < 512 {
            return Err(Error::BadTable("MBR"));
        }
        if u16::from_le_bytes([sector[510], sector[511]]) != MBR_SIGNATURE {
            return Err(Error::BadTable("MBR"));
        }
        let entry = |i: usize| MbrEntry::parse(&sector[446 + i * 16..446 + (i + 1) * 16]);
        Ok(Self {
            entries: [entry(0), entry(1), entry(2), entry(3)],
        })
    }

    /// A protective 0xEE entry means the real table is GPT at LBA 1.
    pub fn is_gpt(&self) -> bool {
        self.entries.iter().any(|e| e.is_used() && e.is_gpt_protective())
    }
}

/// An Extended Boot Record: slot 0 describes one logical partition
/// (relative to this EBR), slot 1 links to the next EBR (relative to the
/// start of the extended container).
#[derive(Debug, Clone)]
pub struct Ebr {
    pub partition: Option<MbrEntry>,
    pub next: Option<MbrEntry>,
}

impl Ebr {
    pub fn parse(sector: &[u8]) -> Result<Self> {
        let table = Mbr::parse(sector)?;
        let used = |e: MbrEntry| e.is_used().then_some(e);
        Ok(Self {
            partition: used(table.entries[0]).filter(|e| !e.is_extended()),
            next: used(table.entries[1]).filter(|e| e.is_extended()),
        })
    }
}

/// GPT header, always at LBA 1 of the unit. Little-endian throughout.
#[derive(Debug, Clone)]
pub struct GptHeader {
    pub partition_entry_lba: u64,
    pub num_partition_entries: u32,
    pub partition_entry_size: u32,
}

impl GptHeader {
    pub const SIGNATURE: &'static [u8; 8] = b"EFI PART";

    pub fn parse(sector: &[u8]) -> Result<Self> {
        if sector.len() < 92 || &sector[0..8] != Self::SIGNATURE {
            return Err(Error::BadTable("GPT header"));
        }
        let header = Self {
            partition_entry_lba: u64::from_le_bytes(sector[72..80].try_into().unwrap()),
            num_partition_entries: u32::from_le_bytes(sector[80..84].try_into().unwrap()),
            partition_entry_size: u32::from_le_bytes(sector[84..88].try_into().unwrap()),
        };
        // 128 is what everything in the field uses; larger power-of-two
        // sizes are legal and still parse, anything else is garbage.
        if header.partition_entry_size < 128 || header.num_partition_entries > 1024 {
            return Err(Error::BadTable("GPT header"));
        }
        Ok(header)
    }

    /// Bytes occupied by the whole entry array.
    pub fn entry_array_len(&self) -> usize {
        self.num_partition_entries as usize * self.partition_entry_size as usize
    }
}

/// One GPT partition entry's LBA range. The type GUID only gates "used or
/// not"; the filesystem tag still comes from the magic probe.
#[derive(Debug, Clone, Copy)]
pub struct GptEntry {
    pub start_lba: u64,
    pub end_lba: u64,
}

impl GptEntry {
    pub fn size_blocks(&self) -> u64 {
        if self.end_lba >= self.start_lba {
            self.end_lba - self.start_lba + 1
        } else {
            0
        }
    }
}

/// Walks a raw GPT entry array, yielding used entries.
pub fn gpt_entries(array: &[u8], header: &GptHeader) -> Vec<GptEntry> {
    let size = header.partition_entry_size as usize;
    let mut out = Vec::new();
    for i in 0..header.num_partition_entries as usize {
        let Some(raw) = array.get(i * size..i * size + 128) else {
            break;
        };
        if raw[0..16].iter().all(|&b| b == 0) {
            continue;
        }
        out.push(GptEntry {
            start_lba: u64::from_le_bytes(raw[32..40].try_into().unwrap()),
            end_lba: u64::from_le_bytes(raw[40..48].try_into().unwrap()),
        });
    }
    out
}

/// EXT superblock: magic at byte 56 of the superblock, which itself sits
/// 1024 bytes into the partition (absolute offset 0x438).
const EXT_MAGIC: u16 = 0xEF53;
const EXT_FEATURE_COMPAT_HAS_JOURNAL: u32 = 0x0004;
const EXT_FEATURE_INCOMPAT_EXTENTS: u32 = 0x0040;
const EXT_FEATURE_INCOMPAT_64BIT: u32 = 0x0080;
const EXT_FEATURE_INCOMPAT_FLEX_BG: u32 = 0x0200;

/// Tags a partition by what its first bytes actually contain.
///
/// `boot` is the partition's first sector; `superblock` is the 1024 bytes
/// at partition offset 1024 (may be empty when the partition is too small
/// to have one).
pub fn probe_fs(boot: &[u8], superblock: &[u8]) -> FsKind {
    if boot.len() >= 512 {
        let oem = &boot[3..11];
        if oem == b"EXFAT   " {
            return FsKind::ExFat;
        }
        if oem == b"NTFS    " {
            return FsKind::Ntfs;
        }
        if u16::from_le_bytes([boot[510], boot[511]]) == MBR_SIGNATURE {
            // FAT boot sectors name their variant in the BPB's filesystem
            // type field: offset 82 for FAT32, 54 for FAT12/16.
            if &boot[82..87] == b"FAT32" {
                return FsKind::Fat32;
            }
            if &boot[54..59] == b"FAT16" {
                return FsKind::Fat16;
            }
            if &boot[54..59] == b"FAT12" {
                return FsKind::Fat12;
            }
            if &boot[54..57] == b"FAT" {
                return FsKind::Fat16;
            }
        }
    }

    if superblock.len() >= 104 && u16::from_le_bytes([superblock[56], superblock[57]]) == EXT_MAGIC {
        let compat = u32::from_le_bytes(superblock[92..96].try_into().unwrap());
        let incompat = u32::from_le_bytes(superblock[96..100].try_into().unwrap());
        if incompat
            & (EXT_FEATURE_INCOMPAT_EXTENTS | EXT_FEATURE_INCOMPAT_64BIT | EXT_FEATURE_INCOMPAT_FLEX_BG)
            != 0
        {
            return FsKind::Ext4;
        }
        if compat & EXT_FEATURE_COMPAT_HAS_JOURNAL != 0 {
            return FsKind::Ext3;
        }
        return FsKind::Ext2;
    }

    FsKind::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mbr_with_entry(slot: usize, ptype: u8, start: u32, sectors: u32) -> Vec<u8> {
        let mut sector = vec![0u8; 512];
        let off = 446 + slot * 16;
        sector[off + 4] = ptype;
        sector[off + 8..off + 12].copy_from_slice(&start.to_le_bytes());
        sector[off + 12..off + 16].copy_from_slice(&sectors.to_le_bytes());
        sector[510] = 0x55;
        sector[511] = 0xAA;
        sector
    }

    #[test]
    fn mbr_single_fat32_partition() {
        let sector = mbr_with_entry(0, 0x0C, 0x800, 0x76_17FF);
        let mbr = Mbr::parse(&sector).unwrap();
        assert!(!mbr.is_gpt());
        let entry = mbr.entries[0];
        assert!(entry.is_used());
        assert_eq!(entry.start_lba, 0x800);
        assert_eq!(entry.num_sectors, 0x76_17FF);
        assert!(!mbr.entries[1].is_used());
    }

    #[test]
    fn mbr_requires_signature() {
        let mut sector = mbr_with_entry(0, 0x0C, 0x800, 100);
        sector[510] = 0;
        assert!(Mbr::parse(&sector).is_err());
    }

    #[test]
    fn protective_entry_flags_gpt() {
        let sector = mbr_with_entry(0, 0xEE, 1, 0xFFFF_FFFF);
        assert!(Mbr::parse(&sector).unwrap().is_gpt());
    }

    #[test]
    fn ebr_links() {
        let mut sector = mbr_with_entry(0, 0x0B, 0x3F, 0x1000);
        let off = 446 + 16;
        sector[off + 4] = 0x05;
        sector[off + 8..off + 12].copy_from_slice(&0x2000u32.to_le_bytes());
        sector[off + 12..off + 16].copy_from_slice(&0x1000u32.to_le_bytes());

        let ebr = Ebr::parse(&sector).unwrap();
        let part = ebr.partition.unwrap();
        assert_eq!(part.start_lba, 0x3F);
        let next = ebr.next.unwrap();
        assert_eq!(next.start_lba, 0x2000);
    }

    #[test]
    fn gpt_header_and_entries() {
        let mut sector = vec![0u8; 512];
        sector[0..8].copy_from_slice(GptHeader::SIGNATURE);
        sector[72..80].copy_from_slice(&2u64.to_le_bytes());
        sector[80..84].copy_from_slice(&2u32.to_le_bytes());
        sector[84..88].copy_from_slice(&128u32.to_le_bytes());
        let header = GptHeader::parse(&sector).unwrap();
        assert_eq!(header.partition_entry_lba, 2);
        assert_eq!(header.entry_array_len(), 256);

        let mut array = vec![0u8; 256];
        // Entry 0 used, entry 1 empty.
        array[0] = 0xA2;
        array[32..40].copy_from_slice(&0x800u64.to_le_bytes());
        array[40..48].copy_from_slice(&0x8FFu64.to_le_bytes());
        let entries = gpt_entries(&array, &header);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].start_lba, 0x800);
        assert_eq!(entries[0].size_blocks(), 0x100);
    }

    fn fat_boot(label: &[u8], offset: usize) -> Vec<u8> {
        let mut boot = vec![0u8; 512];
        boot[offset..offset + label.len()].copy_from_slice(label);
        boot[510] = 0x55;
        boot[511] = 0xAA;
        boot
    }

    #[test]
    fn probes_fat_variants() {
        assert_eq!(probe_fs(&fat_boot(b"FAT32   ", 82), &[]), FsKind::Fat32);
        assert_eq!(probe_fs(&fat_boot(b"FAT16   ", 54), &[]), FsKind::Fat16);
        assert_eq!(probe_fs(&fat_boot(b"FAT12   ", 54), &[]), FsKind::Fat12);
    }

    #[test]
    fn probes_ntfs_and_exfat_by_oem_id() {
        let mut boot = vec![0u8; 512];
        boot[3..11].copy_from_slice(b"NTFS    ");
        assert_eq!(probe_fs(&boot, &[]), FsKind::Ntfs);

        let mut boot = vec![0u8; 512];
        boot[3..11].copy_from_slice(b"EXFAT   ");
        assert_eq!(probe_fs(&boot, &[]), FsKind::ExFat);
        assert!(!FsKind::ExFat.is_mountable());
    }

    #[test]
    fn probes_ext_generations() {
        let mut sb = vec![0u8; 1024];
        sb[56..58].copy_from_slice(&EXT_MAGIC.to_le_bytes());
        assert_eq!(probe_fs(&[], &sb), FsKind::Ext2);

        sb[92..96].copy_from_slice(&EXT_FEATURE_COMPAT_HAS_JOURNAL.to_le_bytes());
        assert_eq!(probe_fs(&[], &sb), FsKind::Ext3);

        sb[96..100].copy_from_slice(&EXT_FEATURE_INCOMPAT_EXTENTS.to_le_bytes());
        assert_eq!(probe_fs(&[], &sb), FsKind::Ext4);
    }

    #[test]
    fn unknown_without_any_magic() {
        assert_eq!(probe_fs(&vec![0u8; 512], &vec![0u8; 1024]), FsKind::Unknown);
    }
}
