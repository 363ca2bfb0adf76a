//! The POSIX-like device-operations surface presented per mounted volume,
//! and the errno-style error codes filesystem drivers report through.
//!
//! Each driver module adapts one external filesystem library to
//! [`VolumeOps`]. The adapters are deliberately thin: flag translation,
//! error mapping, and an open-file handle table; the libraries do the
//! actual filesystem work.

pub mod ext;
pub mod fat;
pub mod ntfs;

use std::collections::HashMap;
use std::io::SeekFrom;

use bitflags::bitflags;
use thiserror::Error;

/// Errno-style codes surfaced by every volume operation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    #[error("EEXIST: file exists")]
    Exist,
    #[error("ENOENT: no such file or directory")]
    NoEnt,
    #[error("EINVAL: invalid argument")]
    Inval,
    #[error("ENODEV: no such device")]
    NoDev,
    #[error("EROFS: read-only file system")]
    Rofs,
    #[error("EIO: input/output error")]
    Io,
    #[error("ENOSPC: no space left on device")]
    NoSpc,
    #[error("ENAMETOOLONG: file name too long")]
    NameTooLong,
    #[error("ELOOP: too many levels of symbolic links")]
    Loop,
    #[error("ENOTDIR: not a directory")]
    NotDir,
    #[error("EISDIR: is a directory")]
    IsDir,
    #[error("ENOTEMPTY: directory not empty")]
    NotEmpty,
    #[error("EBADF: bad file descriptor")]
    BadFd,
}

bitflags! {
    /// Open flags, one bit per POSIX flag the drivers understand.
    /// `READ`/`WRITE` stand in for the O_RDONLY/O_WRONLY/O_RDWR triple.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const CREATE = 1 << 2;
        const APPEND = 1 << 3;
        const TRUNCATE = 1 << 4;
        const EXCLUSIVE = 1 << 5;
    }
}

impl OpenFlags {
    pub fn readable(self) -> bool {
        self.contains(OpenFlags::READ)
    }

    pub fn writable(self) -> bool {
        self.contains(OpenFlags::WRITE)
    }
}

/// What `stat`/`fstat` report. Deliberately small: the three filesystems
/// agree on very little beyond this.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub size: u64,
    pub is_dir: bool,
    pub read_only: bool,
}

/// One directory listing row.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// `statvfs`-shaped volume numbers.
#[derive(Debug, Clone, Copy)]
pub struct VfsStat {
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
}

/// Open-file handle, volume-scoped.
pub type Fd = u64;

/// The operations table every mounted volume implements. Paths are
/// volume-absolute (`/foo/bar`), already stripped of the `umsN:` prefix
/// and normalized by the registry.
///
/// Methods take `&mut self` because the backing filesystem objects are
/// single-threaded; the mount entry wraps each volume in a mutex.
pub trait VolumeOps: Send {
    fn open(&mut self, path: &str, flags: OpenFlags) -> Result<Fd, Errno>;
    fn close(&mut self, fd: Fd) -> Result<(), Errno>;
    fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize, Errno>;
    fn write(&mut self, fd: Fd, buf: &[u8]) -> Result<usize, Errno>;
    fn seek(&mut self, fd: Fd, pos: SeekFrom) -> Result<u64, Errno>;
    fn fstat(&mut self, fd: Fd) -> Result<FileStat, Errno>;
    fn truncate(&mut self, fd: Fd, len: u64) -> Result<(), Errno>;
    fn fsync(&mut self, fd: Fd) -> Result<(), Errno>;

    fn stat(&mut self, path: &str) -> Result<FileStat, Errno>;
    fn unlink(&mut self, path: &str) -> Result<(), Errno>;
    fn rename(&mut self, from: &str, to: &str) -> Result<(), Errno>;
    fn mkdir(&mut self, path: &str) -> Result<(), Errno>;
    fn rmdir(&mut self, path: &str) -> Result<(), Errno>;
    fn read_dir(&mut self, path: &str) -> Result<Vec<DirEntry>, Errno>;
    fn statvfs(&mut self) -> Result<VfsStat, Errno>;

    /// Volume-level flush, called before unmount.
    fn sync(&mut self) -> Result<(), Errno>;
}

/// Position/flags bookkeeping for one open file. The adapters are
/// stateless towards their libraries -- every operation re-opens the file
/// by path -- so this is the only per-handle state that exists.
#[derive(Debug, Clone)]
pub struct OpenFile {
    pub path: String,
    pub pos: u64,
    pub flags: OpenFlags,
}

/// Fd allocator + table shared by the three adapters.
#[derive(Debug, Default)]
pub struct HandleTable {
    next: Fd,
    open: HashMap<Fd, OpenFile>,
}

impl HandleTable {
    pub fn insert(&mut self, file: OpenFile) -> Fd {
        let fd = self.next;
        self.next += 1;
        self.open.insert(fd, file);
        fd
    }

    pub fn get_mut(&mut self, fd: Fd) -> Result<&mut OpenFile, Errno> {
        self.open.get_mut(&fd).ok_or(Errno::BadFd)
    }

    pub fn remove(&mut self, fd: Fd) -> Result<OpenFile, Errno> {
        self.open.remove(&fd).ok_or(Errno::BadFd)
    }
}

/// Shared seek arithmetic for the per-handle cursor.
pub(crate) fn apply_seek(pos: u64, size: u64, seek: SeekFrom) -> Result<u64, Errno> {
    let target = match seek {
        SeekFrom::Start(offset) => offset as i128,
        SeekFrom::End(offset) => size as i128 + offset as i128,
        SeekFrom::Current(offset) => pos as i128 + offset as i128,
    };
    if target < 0 || target > u64::MAX as i128 {
        return Err(Errno::Inval);
    }
    Ok(target as u64)
}

/// Generic mapping for I/O errors bubbling out of a driver library.
pub(crate) fn io_errno(err: &std::io::Error) -> Errno {
    match err.kind() {
        std::io::ErrorKind::NotFound => Errno::NoEnt,
        std::io::ErrorKind::AlreadyExists => Errno::Exist,
        std::io::ErrorKind::PermissionDenied => Errno::Rofs,
        std::io::ErrorKind::InvalidInput => Errno::Inval,
        std::io::ErrorKind::UnexpectedEof => Errno::Io,
        _ => Errno::Io,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_table_allocates_and_reclaims() {
        let mut table = HandleTable::default();
        let fd = table.insert(OpenFile {
            path: "/a".into(),
            pos: 0,
            flags: OpenFlags::READ,
        });
        assert!(table.get_mut(fd).is_ok());
        assert!(table.remove(fd).is_ok());
        assert_eq!(table.get_mut(fd).err(), Some(Errno::BadFd));
        assert_eq!(table.remove(fd).err(), Some(Errno::BadFd));
    }

    #[test]
    fn seek_arithmetic() {
        assert_eq!(apply_seek(0, 100, SeekFrom::Start(10)).unwrap(), 10);
        assert_eq!(apply_seek(50, 100, SeekFrom::Current(-10)).unwrap(), 40);
        assert_eq!(apply_seek(0, 100, SeekFrom::End(-1)).unwrap(), 99);
        assert_eq!(apply_seek(0, 100, SeekFrom::End(5)).unwrap(), 105);
        assert!(apply_seek(0, 0, SeekFrom::Current(-1)).is_err());
    }
}
