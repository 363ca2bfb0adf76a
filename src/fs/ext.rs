//! EXT2/3/4 volume adapter over the `ext4-view` library.
//!
//! `ext4-view` is a pure reader, so every mutating operation reports
//! `EROFS`, matching the mapping used for an explicit "filesystem is
//! read-only" rejection. Symlink resolution happens inside the library.

use std::io::{Read, Seek, SeekFrom};

use ext4_view::{Ext4, Ext4Read};
use tracing::debug;

use crate::block::PartitionIo;
use crate::fs::{
    apply_seek, DirEntry, Errno, Fd, FileStat, HandleTable, OpenFile, OpenFlags, VfsStat,
    VolumeOps,
};
use crate::MountFlags;

/// `Ext4Read` face of the partition window: positioned byte reads.
struct ExtReader(PartitionIo);

impl Ext4Read for ExtReader {
    fn read(
        &mut self,
        start_byte: u64,
        dst: &mut [u8],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
        self.0.seek(SeekFrom::Start(start_byte))?;
        self.0.read_exact(dst)?;
        Ok(())
    }
}

pub struct ExtVolume {
    fs: Ext4,
    handles: HandleTable,
    /// Partition size, kept for statvfs; the library does not expose its
    /// superblock accounting.
    size_bytes: u64,
    block_len: u32,
}

impl ExtVolume {
    pub fn mount(io: PartitionIo, _flags: MountFlags) -> Result<Self, Errno> {
        let size_bytes = io.size_bytes();
        let block_len = io.block_len();
        let fs = Ext4::load(Box::new(ExtReader(io))).map_err(|_| Errno::Io)?;
        debug!(size_bytes, "ext volume mounted");
        Ok(Self {
            fs,
            handles: HandleTable::default(),
            size_bytes,
            block_len,
        })
    }

    fn metadata(&self, path: &str) -> Result<FileStat, Errno> {
        let metadata = self.fs.metadata(path).map_err(|_| Errno::NoEnt)?;
        Ok(FileStat {
            size: metadata.len(),
            is_dir: metadata.is_dir(),
            // The whole volume is read-only through this adapter.
            read_only: true,
        })
    }

    fn exists(&self, path: &str) -> bool {
        self.fs.exists(path).unwrap_or(false)
    }
}

impl VolumeOps for ExtVolume {
    fn open(&mut self, path: &str, flags: OpenFlags) -> Result<Fd, Errno> {
        if flags.writable() || flags.contains(OpenFlags::CREATE) {
            return Err(Errno::Rofs);
        }
        let stat = self.metadata(path)?;
        if stat.is_dir {
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
        let data = self.fs.read(handle.path.as_str()).map_err(|_| Errno::Io)?;
        let pos = handle.pos.min(data.len() as u64) as usize;
        let n = buf.len().min(data.len() - pos);
        buf[..n].copy_from_slice(&data[pos..pos + n]);
        self.handles.get_mut(fd)?.pos = (pos + n) as u64;
        Ok(n)
    }

    fn write(&mut self, _fd: Fd, _buf: &[u8]) -> Result<usize, Errno> {
        Err(Errno::Rofs)
    }

    fn seek(&mut self, fd: Fd, pos: SeekFrom) -> Result<u64, Errno> {
        let handle = self.handles.get_mut(fd)?.clone();
        let size = self.metadata(&handle.path)?.size;
        let new_pos = apply_seek(handle.pos, size, pos)?;
        self.handles.get_mut(fd)?.pos = new_pos;
        Ok(new_pos)
    }

    fn fstat(&mut self, fd: Fd) -> Result<FileStat, Errno> {
        let path = self.handles.get_mut(fd)?.path.clone();
        self.metadata(&path)
    }

    fn truncate(&mut self, _fd: Fd, _len: u64) -> Result<(), Errno> {
        Err(Errno::Rofs)
    }

    fn fsync(&mut self, fd: Fd) -> Result<(), Errno> {
        self.handles.get_mut(fd).map(|_| ())
    }

    fn stat(&mut self, path: &str) -> Result<FileStat, Errno> {
        self.metadata(path)
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
        if !self.exists(path) {
            return Err(Errno::NoEnt);
        }
        let stat = self.metadata(path)?;
        if !stat.is_dir {
            return Err(Errno::NotDir);
        }
        let mut entries = Vec::new();
        for entry in self.fs.read_dir(path).map_err(|_| Errno::Io)? {
            let entry = entry.map_err(|_| Errno::Io)?;
            let name = String::from_utf8_lossy(entry.file_name().as_ref()).into_owned();
            if name == "." || name == ".." {
                continue;
            }
            let child = if path == "/" {
                format!("/{name}")
            } else {
                format!("{path}/{name}")
            };
            let (size, is_dir) = self
                .fs
                .metadata(child.as_str())
                .map(|m| (m.len(), m.is_dir()))
                .unwrap_or((0, false));
            entries.push(DirEntry { name, is_dir, size });
        }
        Ok(entries)
    }

    fn statvfs(&mut self) -> Result<VfsStat, Errno> {
        // Free-block accounting lives in the superblock, which the
        // library keeps to itself; report geometry only.
        Ok(VfsStat {
            block_size: self.block_len,
            total_blocks: self.size_bytes / self.block_len as u64,
            free_blocks: 0,
        })
    }

    fn sync(&mut self) -> Result<(), Errno> {
        Ok(())
    }
}
