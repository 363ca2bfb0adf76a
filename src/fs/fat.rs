//! FAT12/16/32 volume adapter over the `fatfs` library.
//!
//! This is the one fully read-write driver. Handles are stateless towards
//! the library: each operation walks to the file by path and drops it
//! again, which keeps the adapter free of self-referential borrows and
//! lets `fatfs` flush through on every drop.

use std::io::{Read, Seek, SeekFrom, Write};

use tracing::debug;

use crate::block::PartitionIo;
use crate::fs::{
    apply_seek, DirEntry, Errno, Fd, FileStat, HandleTable, OpenFile, OpenFlags, VfsStat,
    VolumeOps,
};
use crate::MountFlags;

type FatFs = fatfs::FileSystem<PartitionIo>;
type FatFile<'a> = fatfs::File<'a, PartitionIo>;

/// `fatfs` reports everything as `std::io::Error`; the interesting cases
/// carry a meaningful `ErrorKind`.
fn map_err(err: std::io::Error) -> Errno {
    crate::fs::io_errno(&err)
}

/// Volume-absolute path to the relative form `fatfs` paths use.
fn rel(path: &str) -> &str {
    path.trim_start_matches('/')
}

fn split_parent(path: &str) -> (&str, &str) {
    let path = rel(path);
    match path.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", path),
    }
}

pub struct FatVolume {
    fs: FatFs,
    handles: HandleTable,
    read_only: bool,
    show_hidden: bool,
    show_system: bool,
}

impl FatVolume {
    pub fn mount(io: PartitionIo, flags: MountFlags) -> Result<Self, Errno> {
        let options = fatfs::FsOptions::new()
            .update_accessed_date(flags.contains(MountFlags::UPDATE_ACCESS_TIMES));
        let fs = fatfs::FileSystem::new(io, options).map_err(map_err)?;
        debug!(fat_type = ?fs.fat_type(), "fat volume mounted");
        Ok(Self {
            fs,
            handles: HandleTable::default(),
            read_only: flags.contains(MountFlags::READ_ONLY),
            show_hidden: flags.contains(MountFlags::SHOW_HIDDEN_FILES),
            show_system: flags.contains(MountFlags::SHOW_SYSTEM_FILES),
        })
    }

    fn open_file_at(&self, path: &str) -> Result<FatFile<'_>, Errno> {
        self.fs.root_dir().open_file(rel(path)).map_err(map_err)
    }

    /// Finds the directory entry for `path` in its parent, which is the
    /// only way `fatfs` exposes attributes and sizes without opening.
    fn lookup(&self, path: &str) -> Result<FileStat, Errno> {
        if rel(path).is_empty() {
            return Ok(FileStat {
                size: 0,
                is_dir: true,
                read_only: self.read_only,
            });
        }
        let (parent, name) = split_parent(path);
        let root = self.fs.root_dir();
        let dir = if parent.is_empty() {
            root
        } else {
            root.open_dir(parent).map_err(map_err)?
        };
        for entry in dir.iter() {
            let entry = entry.map_err(map_err)?;
            if entry.file_name().eq_ignore_ascii_case(name) {
                return Ok(FileStat {
                    size: entry.len(),
                    is_dir: entry.is_dir(),
                    read_only: self.read_only
                        || entry.attributes().contains(fatfs::FileAttributes::READ_ONLY),
                });
            }
        }
        Err(Errno::NoEnt)
    }

    fn check_writable(&self, flags: OpenFlags) -> Result<(), Errno> {
        if flags.writable() && self.read_only {
            return Err(Errno::Rofs);
        }
        Ok(())
    }
}

impl VolumeOps for FatVolume {
    fn open(&mut self, path: &str, flags: OpenFlags) -> Result<Fd, Errno> {
        self.check_writable(flags)?;
        let existing = self.lookup(path);
        if let Ok(stat) = &existing {
            if stat.is_dir {
                return Err(Errno::IsDir);
            }
        }

        if flags.contains(OpenFlags::CREATE) {
            if self.read_only {
                return Err(Errno::Rofs);
            }
            if flags.contains(OpenFlags::EXCLUSIVE) && existing.is_ok() {
                return Err(Errno::Exist);
            }
            // create_file opens an existing file as well.
            self.fs.root_dir().create_file(rel(path)).map_err(map_err)?;
        } else if let Err(err) = existing {
            return Err(err);
        }

        if flags.contains(OpenFlags::TRUNCATE) && flags.writable() {
            let mut file = self.open_file_at(path)?;
            file.truncate().map_err(map_err)?;
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
        if !handle.flags.readable() {
            return Err(Errno::BadFd);
        }
        let mut file = self.fs.root_dir().open_file(rel(&handle.path)).map_err(map_err)?;
        file.seek(SeekFrom::Start(handle.pos)).map_err(map_err)?;
        let n = file.read(buf).map_err(map_err)?;
        self.handles.get_mut(fd)?.pos = handle.pos + n as u64;
        Ok(n)
    }

    fn write(&mut self, fd: Fd, buf: &[u8]) -> Result<usize, Errno> {
        let handle = self.handles.get_mut(fd)?.clone();
        if !handle.flags.writable() {
            return Err(Errno::BadFd);
        }
        if self.read_only {
            return Err(Errno::Rofs);
        }
        let mut file = self.fs.root_dir().open_file(rel(&handle.path)).map_err(map_err)?;
        let pos = if handle.flags.contains(OpenFlags::APPEND) {
            file.seek(SeekFrom::End(0)).map_err(map_err)?
        } else {
            file.seek(SeekFrom::Start(handle.pos)).map_err(map_err)?
        };
        let n = file.write(buf).map_err(map_err)?;
        file.flush().map_err(map_err)?;
        self.handles.get_mut(fd)?.pos = pos + n as u64;
        Ok(n)
    }

    fn seek(&mut self, fd: Fd, pos: SeekFrom) -> Result<u64, Errno> {
        let handle = self.handles.get_mut(fd)?.clone();
        let size = self.lookup(&handle.path)?.size;
        let new_pos = apply_seek(handle.pos, size, pos)?;
        self.handles.get_mut(fd)?.pos = new_pos;
        Ok(new_pos)
    }

    fn fstat(&mut self, fd: Fd) -> Result<FileStat, Errno> {
        let path = self.handles.get_mut(fd)?.path.clone();
        self.lookup(&path)
    }

    fn truncate(&mut self, fd: Fd, len: u64) -> Result<(), Errno> {
        let handle = self.handles.get_mut(fd)?.clone();
        if !handle.flags.writable() {
            return Err(Errno::BadFd);
        }
        if self.read_only {
            return Err(Errno::Rofs);
        }
        let mut file = self.open_file_at(&handle.path)?;
        file.seek(SeekFrom::Start(len)).map_err(map_err)?;
        file.truncate().map_err(map_err)?;
        Ok(())
    }

    fn fsync(&mut self, fd: Fd) -> Result<(), Errno> {
        // Every operation reopens and drops its file, so data has already
        // written through by the time fsync is called.
        self.handles.get_mut(fd).map(|_| ())
    }

    fn stat(&mut self, path: &str) -> Result<FileStat, Errno> {
        self.lookup(path)
    }

    fn unlink(&mut self, path: &str) -> Result<(), Errno> {
        if self.read_only {
            return Err(Errno::Rofs);
        }
        let stat = self.lookup(path)?;
        if stat.is_dir {
            return Err(Errno::IsDir);
        }
        self.fs.root_dir().remove(rel(path)).map_err(map_err)
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), Errno> {
        if self.read_only {
            return Err(Errno::Rofs);
        }
        let root = self.fs.root_dir();
        root.rename(rel(from), &self.fs.root_dir(), rel(to)).map_err(map_err)
    }

    fn mkdir(&mut self, path: &str) -> Result<(), Errno> {
        if self.read_only {
            return Err(Errno::Rofs);
        }
        if self.lookup(path).is_ok() {
            return Err(Errno::Exist);
        }
        self.fs.root_dir().create_dir(rel(path)).map(|_| ()).map_err(map_err)
    }

    fn rmdir(&mut self, path: &str) -> Result<(), Errno> {
        if self.read_only {
            return Err(Errno::Rofs);
        }
        let stat = self.lookup(path)?;
        if !stat.is_dir {
            return Err(Errno::NotDir);
        }
        // fatfs folds "not empty" into a generic error; check first so the
        // caller gets the right errno.
        let dir = self.fs.root_dir().open_dir(rel(path)).map_err(map_err)?;
        for entry in dir.iter() {
            let entry = entry.map_err(map_err)?;
            let name = entry.file_name();
            if name != "." && name != ".." {
                return Err(Errno::NotEmpty);
            }
        }
        self.fs.root_dir().remove(rel(path)).map_err(map_err)
    }

    fn read_dir(&mut self, path: &str) -> Result<Vec<DirEntry>, Errno> {
        let root = self.fs.root_dir();
        let dir = if rel(path).is_empty() {
            root
        } else {
            root.open_dir(rel(path)).map_err(map_err)?
        };
        let mut entries = Vec::new();
        for entry in dir.iter() {
            let entry = entry.map_err(map_err)?;
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let attrs = entry.attributes();
            if attrs.contains(fatfs::FileAttributes::HIDDEN) && !self.show_hidden {
                continue;
            }
            if attrs.contains(fatfs::FileAttributes::SYSTEM) && !self.show_system {
                continue;
            }
            entries.push(DirEntry {
                name,
                is_dir: entry.is_dir(),
                size: entry.len(),
            });
        }
        Ok(entries)
    }

    fn statvfs(&mut self) -> Result<VfsStat, Errno> {
        let stats = self.fs.stats().map_err(map_err)?;
        Ok(VfsStat {
            block_size: stats.cluster_size(),
            total_blocks: stats.total_clusters() as u64,
            free_blocks: stats.free_clusters() as u64,
        })
    }

    fn sync(&mut self) -> Result<(), Errno> {
        // fatfs writes metadata through on file drop; the dirty FS-info
        // sector goes out when the filesystem object itself drops at
        // unmount.
        Ok(())
    }
}
