//! NTFS volume adapter over the `ntfs` library.
//!
//! The library is read-oriented, so the mutating half of the op table
//! reports `EROFS` -- the same mapping a library-level "volume is
//! read-only" rejection gets. Reparse points (symlinks and junctions) are
//! resolved during path walks, to a depth of 10, after which `ELOOP` is
//! reported.

use std::io::SeekFrom;

use ntfs::indexes::NtfsFileNameIndex;
use ntfs::structured_values::{NtfsFileAttributeFlags, NtfsFileNamespace};
use ntfs::{Ntfs, NtfsAttributeType, NtfsReadSeek};
use tracing::debug;

use crate::block::PartitionIo;
use crate::fs::{
    apply_seek, DirEntry, Errno, Fd, FileStat, HandleTable, OpenFile, OpenFlags, VfsStat,
    VolumeOps,
};
use crate::MountFlags;

/// Reparse tag values, from the Windows SDK.
const REPARSE_TAG_MOUNT_POINT: u32 = 0xA000_0003;
const REPARSE_TAG_SYMLINK: u32 = 0xA000_000C;

/// Symlink chains longer than this report ELOOP.
const MAX_REPARSE_DEPTH: u32 = 10;

fn map_err(err: ntfs::NtfsError) -> Errno {
    match err {
        ntfs::NtfsError::Io(err) => crate::fs::io_errno(&err),
        _ => Errno::Io,
    }
}

/// What a path walk found: the MFT record plus the index entry's view of
/// it.
#[derive(Debug, Clone, Copy)]
struct Located {
    record: u64,
    stat: FileStat,
}

pub struct NtfsVolume {
    ntfs: Ntfs,
    io: PartitionIo,
    handles: HandleTable,
    show_hidden: bool,
    show_system: bool,
}

impl NtfsVolume {
    pub fn mount(mut io: PartitionIo, flags: MountFlags) -> Result<Self, Errno> {
        let mut ntfs = Ntfs::new(&mut io).map_err(map_err)?;
        // Case-insensitive index lookups need the volume's upcase table.
        ntfs.read_upcase_table(&mut io).map_err(map_err)?;
        debug!(cluster_size = ntfs.cluster_size(), "ntfs volume mounted");
        Ok(Self {
            ntfs,
            io,
            handles: HandleTable::default(),
            show_hidden: flags.contains(MountFlags::SHOW_HIDDEN_FILES),
            show_system: flags.contains(MountFlags::SHOW_SYSTEM_FILES),
        })
    }

    fn root(&mut self) -> Result<Located, Errno> {
        let root = self.ntfs.root_directory(&mut self.io).map_err(map_err)?;
        Ok(Located {
            record: root.file_record_number(),
            stat: FileStat {
                size: 0,
                is_dir: true,
                read_only: true,
            },
        })
    }

    /// Looks `name` up in the directory at `dir_record`. Returns the
    /// located child and, when the child is a reparse point, its target.
    fn lookup_child(
        &mut self,
        dir_record: u64,
        name: &str,
    ) -> Result<(Located, Option<String>), Errno> {
        let dir = self.ntfs.file(&mut self.io, dir_record).map_err(map_err)?;
        let index = dir.directory_index(&mut self.io).map_err(|_| Errno::NotDir)?;
        let mut finder = index.finder();
        let entry = NtfsFileNameIndex::find(&mut finder, &self.ntfs, &mut self.io, name)
            .ok_or(Errno::NoEnt)?
            .map_err(map_err)?;
        let file_name = entry.key().ok_or(Errno::Io)?.map_err(map_err)?;
        let attrs = file_name.file_attributes();
        let located = Located {
            record: entry.file_reference().file_record_number(),
            stat: FileStat {
                size: file_name.data_size(),
                is_dir: file_name.is_directory(),
                read_only: attrs.contains(NtfsFileAttributeFlags::READ_ONLY),
            },
        };

        let target = if attrs.contains(NtfsFileAttributeFlags::REPARSE_POINT) {
            self.reparse_target(located.record)?
        } else {
            None
        };
        Ok((located, target))
    }

    /// Reads and decodes the `$REPARSE_POINT` attribute of a file, when
    /// it carries a symlink or junction target.
    fn reparse_target(&mut self, record: u64) -> Result<Option<String>, Errno> {
        let file = self.ntfs.file(&mut self.io, record).map_err(map_err)?;
        let mut attributes = file.attributes();
        while let Some(item) = attributes.next(&mut self.io) {
            let item = item.map_err(map_err)?;
            let attribute = item.to_attribute().map_err(map_err)?;
            if attribute.ty().map_err(map_err)? != NtfsAttributeType::ReparsePoint {
                continue;
            }
            let mut value = attribute.value(&mut self.io).map_err(map_err)?;
            let len = (value.len() as usize).min(4096);
            let mut data = vec![0u8; len];
            let n = value.read(&mut self.io, &mut data).map_err(map_err)?;
            data.truncate(n);
            return Ok(decode_reparse_buffer(&data));
        }
        Ok(None)
    }

    /// Walks an absolute volume path, chasing reparse points up to
    /// [`MAX_REPARSE_DEPTH`] times.
    fn resolve(&mut self, path: &str) -> Result<Located, Errno> {
        let mut depth = 0u32;
        let mut pending: Vec<String> = path
            .split('/')
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        pending.reverse();

        let mut walked: Vec<String> = Vec::new();
        let mut current = self.root()?;
        while let Some(component) = pending.pop() {
            if !current.stat.is_dir {
                return Err(Errno::NotDir);
            }
            let (child, target) = self.lookup_child(current.record, &component)?;
            match target {
                None => {
                    walked.push(component);
                    current = child;
                }
                Some(target) => {
                    depth += 1;
                    if depth > MAX_REPARSE_DEPTH {
                        return Err(Errno::Loop);
                    }
                    // Restart the walk from the link target with the
                    // unconsumed components appended.
                    let base: Vec<String> = if target.starts_with('/') {
                        Vec::new()
                    } else {
                        walked.clone()
                    };
                    let mut rebuilt: Vec<String> = base;
                    for piece in target.split('/').filter(|c| !c.is_empty()) {
                        if piece == ".." {
                            rebuilt.pop();
                        } else if piece != "." {
                            rebuilt.push(piece.to_string());
                        }
                    }
                    let mut rest: Vec<String> = pending.drain(..).collect();
                    rest.reverse();
                    rebuilt.extend(rest);
                    pending = rebuilt;
                    pending.reverse();
                    walked.clear();
                    current = self.root()?;
                }
            }
        }
        Ok(current)
    }

    /// Reads from the unnamed `$DATA` attribute at a byte position.
    fn read_at(&mut self, record: u64, pos: u64, buf: &mut [u8]) -> Result<usize, Errno> {
        let file = self.ntfs.file(&mut self.io, record).map_err(map_err)?;
        let data_item = file
            .data(&mut self.io, "")
            .ok_or(Errno::NoEnt)?
            .map_err(map_err)?;
        let attribute = data_item.to_attribute().map_err(map_err)?;
        let mut value = attribute.value(&mut self.io).map_err(map_err)?;
        if pos >= value.len() {
            return Ok(0);
        }
        value.seek(&mut self.io, SeekFrom::Start(pos)).map_err(map_err)?;
        value.read(&mut self.io, buf).map_err(map_err)
    }
}

/// Decodes a Microsoft reparse buffer into a slash-separated target path.
/// Absolute NT targets (`\??\C:\dir`) come back volume-absolute; relative
/// symlink targets stay relative.
fn decode_reparse_buffer(data: &[u8]) -> Option<String> {
    if data.len() < 8 {
        return None;
    }
    let tag = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let (header, relative) = match tag {
        // Symlink: substitute/print offsets at 8, flags at 16, path
        // buffer from 20. Flag bit 0 marks a relative target.
        REPARSE_TAG_SYMLINK => {
            if data.len() < 20 {
                return None;
            }
            let flags = u32::from_le_bytes([data[16], data[17], data[18], data[19]]);
            (20usize, flags & 1 != 0)
        }
        // Junction: same layout without the flags word.
        REPARSE_TAG_MOUNT_POINT => (16usize, false),
        _ => return None,
    };

    let sub_off = u16::from_le_bytes([data[8], data[9]]) as usize;
    let sub_len = u16::from_le_bytes([data[10], data[11]]) as usize;
    let start = header + sub_off;
    let end = start + sub_len;
    if end > data.len() || sub_len % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = data[start..end]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let mut target = String::from_utf16_lossy(&units).replace('\\', "/");

    if !relative {
        // "\??\C:\dir" or "\??\Volume{...}\dir" -> "/dir".
        if let Some(stripped) = target.strip_prefix("/??/") {
            target = stripped.to_string();
        }
        if target.len() >= 2 && target.as_bytes()[1] == b':' {
            target = target[2..].to_string();
        }
        if !target.starts_with('/') {
            target = format!("/{target}");
        }
    }
    Some(target)
}

impl VolumeOps for NtfsVolume {
    fn open(&mut self, path: &str, flags: OpenFlags) -> Result<Fd, Errno> {
        if flags.writable() || flags.contains(OpenFlags::CREATE) {
            return Err(Errno::Rofs);
        }
        let located = self.resolve(path)?;
        if located.stat.is_dir {
            return Err(Errno::IsDir);
        }
        Ok(self.handles.insert(OpenFile {
            path: path.to_string(),
            pos: 0,
            flags,
        }))
    }

    fn close(&mut self, fd: Fd) -> Result<(), Errno> {
        self.handles.remove(fd).map(|_| ())
    }

    fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize, Errno> {
        let handle = self.handles.get_mut(fd)?.clone();
        let located = self.resolve(&handle.path)?;
        let n = self.read_at(located.record, handle.pos, buf)?;
        self.handles.get_mut(fd)?.pos = handle.pos + n as u64;
        Ok(n)
    }

    fn write(&mut self, _fd: Fd, _buf: &[u8]) -> Result<usize, Errno> {
        Err(Errno::Rofs)
    }

    fn seek(&mut self, fd: Fd, pos: SeekFrom) -> Result<u64, Errno> {
        let handle = self.handles.get_mut(fd)?.clone();
        let size = self.resolve(&handle.path)?.stat.size;
        let new_pos = apply_seek(handle.pos, size, pos)?;
        self.handles.get_mut(fd)?.pos = new_pos;
        Ok(new_pos)
    }

    fn fstat(&mut self, fd: Fd) -> Result<FileStat, Errno> {
        let path = self.handles.get_mut(fd)?.path.clone();
        self.resolve(&path).map(|located| located.stat)
    }

    fn truncate(&mut self, _fd: Fd, _len: u64) -> Result<(), Errno> {
        Err(Errno::Rofs)
    }

    fn fsync(&mut self, fd: Fd) -> Result<(), Errno> {
        self.handles.get_mut(fd).map(|_| ())
    }

    fn stat(&mut self, path: &str) -> Result<FileStat, Errno> {
        self.resolve(path).map(|located| located.stat)
    }

    fn unlink(&mut self, _path: &str) -> Result<(), Errno> {
        Err(Errno::Rofs)
    }

    fn rename(&mut self, _from: &str, _to: &str) -> Result<(), Errno> {
        Err(Errno::Rofs)
    }

    fn mkdir(&mut self, _path: &str) -> Result<(), Errno> {
        Err(Errno::Rofs)
    }

    fn rmdir(&mut self, _path: &str) -> Result<(), Errno> {
        Err(Errno::Rofs)
    }

    fn read_dir(&mut self, path: &str) -> Result<Vec<DirEntry>, Errno> {
        let located = self.resolve(path)?;
        if !located.stat.is_dir {
            return Err(Errno::NotDir);
        }
        let dir = self.ntfs.file(&mut self.io, located.record).map_err(map_err)?;
        let index = dir.directory_index(&mut self.io).map_err(|_| Errno::NotDir)?;
        let mut entries = Vec::new();
        let mut iter = index.entries();
        while let Some(entry) = iter.next(&mut self.io) {
            let entry = entry.map_err(map_err)?;
            let Some(file_name) = entry.key() else {
                continue;
            };
            let file_name = file_name.map_err(map_err)?;
            // Every file also carries a DOS 8.3 name; listing both would
            // duplicate entries.
            if file_name.namespace() == NtfsFileNamespace::Dos {
                continue;
            }
            let name = file_name.name().to_string_lossy();
            if name == "." || name.starts_with('$') {
                continue;
            }
            let attrs = file_name.file_attributes();
            if attrs.contains(NtfsFileAttributeFlags::HIDDEN) && !self.show_hidden {
                continue;
            }
            if attrs.contains(NtfsFileAttributeFlags::SYSTEM) && !self.show_system {
                continue;
            }
            entries.push(DirEntry {
                name,
                is_dir: file_name.is_directory(),
                size: file_name.data_size(),
            });
        }
        Ok(entries)
    }

    fn statvfs(&mut self) -> Result<VfsStat, Errno> {
        let cluster_size = self.ntfs.cluster_size();
        Ok(VfsStat {
            block_size: cluster_size,
            total_blocks: self.ntfs.size() / cluster_size as u64,
            // Free-space accounting would need the $Bitmap file; not
            // tracked by this adapter.
            free_blocks: 0,
        })
    }

    fn sync(&mut self) -> Result<(), Errno> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symlink_buffer(target: &str, relative: bool) -> Vec<u8> {
        let units: Vec<u8> = target
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect();
        let mut buf = Vec::new();
        buf.extend_from_slice(&REPARSE_TAG_SYMLINK.to_le_bytes());
        buf.extend_from_slice(&(units.len() as u16 + 12).to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes()); // reserved
        buf.extend_from_slice(&0u16.to_le_bytes()); // substitute offset
        buf.extend_from_slice(&(units.len() as u16).to_le_bytes());
        buf.extend_from_slice(&(units.len() as u16).to_le_bytes()); // print offset
        buf.extend_from_slice(&0u16.to_le_bytes()); // print length
        buf.extend_from_slice(&(relative as u32).to_le_bytes());
        buf.extend_from_slice(&units);
        buf
    }

    #[test]
    fn decodes_absolute_symlink_target() {
        let buf = symlink_buffer("\\??\\C:\\shared\\file.txt", false);
        assert_eq!(decode_reparse_buffer(&buf).unwrap(), "/shared/file.txt");
    }

    #[test]
    fn decodes_relative_symlink_target() {
        let buf = symlink_buffer("..\\sibling", true);
        assert_eq!(decode_reparse_buffer(&buf).unwrap(), "../sibling");
    }

    #[test]
    fn rejects_unknown_reparse_tags() {
        let mut buf = symlink_buffer("x", false);
        buf[0..4].copy_from_slice(&0x8000_0017u32.to_le_bytes()); // WOF
        assert!(decode_reparse_buffer(&buf).is_none());
    }

    #[test]
    fn rejects_truncated_buffers() {
        assert!(decode_reparse_buffer(&[0u8; 4]).is_none());
        let mut buf = symlink_buffer("target", false);
        buf.truncate(buf.len() - 2);
        assert!(decode_reparse_buffer(&buf).is_none());
    }
}
