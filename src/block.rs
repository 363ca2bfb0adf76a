//! The block-device adapter between filesystem drivers and the SCSI
//! layer: per-partition LBA translation, bounds, the write-protect gate,
//! and a byte-granular `std::io` window for libraries that think in
//! seek-and-read terms.
//!
//! Filesystem libraries provide their own buffers with no particular
//! alignment; the transport's DMA buffers absorb that, so sector payloads
//! are simply copied through.

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::scsi::{LunInfo, ScsiChannel};

/// One partition's sector window onto its logical unit. Every call
/// serializes on the owning device's command mutex.
pub struct PartitionStore {
    channel: Arc<Mutex<ScsiChannel>>,
    lun: LunInfo,
    start_lba: u64,
    size_blocks: u64,
    read_only: bool,
}

impl PartitionStore {
    pub fn new(
        channel: Arc<Mutex<ScsiChannel>>,
        lun: LunInfo,
        start_lba: u64,
        size_blocks: u64,
        read_only: bool,
    ) -> Self {
        Self {
            channel,
            lun,
            start_lba,
            size_blocks,
            read_only,
        }
    }

    pub fn block_len(&self) -> u32 {
        self.lun.block_len
    }

    pub fn size_blocks(&self) -> u64 {
        self.size_blocks
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_blocks * self.lun.block_len as u64
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    fn check_range(&self, lba: u64, blocks: u64) -> Result<()> {
        if lba + blocks > self.size_blocks {
            return Err(Error::OutOfRange { lba, count: blocks });
        }
        Ok(())
    }

    /// Reads whole sectors at a partition-relative LBA.
    pub async fn read_sectors(&self, lba: u64, buf: &mut [u8]) -> Result<()> {
        let blocks = buf.len() as u64 / self.lun.block_len as u64;
        self.check_range(lba, blocks)?;
        let mut channel = self.channel.lock().await;
        channel.read_blocks(&self.lun, self.start_lba + lba, buf).await
    }

    /// Writes whole sectors. A read-only volume refuses here, before any
    /// command is built.
    pub async fn write_sectors(&self, lba: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::WriteProtected);
        }
        let blocks = buf.len() as u64 / self.lun.block_len as u64;
        self.check_range(lba, blocks)?;
        let mut channel = self.channel.lock().await;
        channel.write_blocks(&self.lun, self.start_lba + lba, buf).await
    }

    /// Synchronize Cache passthrough for unmount.
    pub async fn flush(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let mut channel = self.channel.lock().await;
        channel.flush_cache(&self.lun).await
    }
}

/// Byte-granular `Read + Write + Seek` view over a [`PartitionStore`],
/// which is what the filesystem libraries consume. Unaligned edges go
/// through read-modify-write on the boundary sectors.
///
/// The filesystem libraries are synchronous and run on caller threads;
/// this bridge re-enters the async core with `Handle::block_on`, so it
/// must never be driven from a runtime worker thread.
pub struct PartitionIo {
    store: Arc<PartitionStore>,
    runtime: Handle,
    pos: u64,
}

impl PartitionIo {
    pub fn new(store: Arc<PartitionStore>, runtime: Handle) -> Self {
        Self {
            store,
            runtime,
            pos: 0,
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.store.size_bytes()
    }

    pub fn block_len(&self) -> u32 {
        self.store.block_len()
    }
}

impl Read for PartitionIo {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let size = self.store.size_bytes();
        if self.pos >= size {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(size - self.pos) as usize;
        let block_len = self.store.block_len() as u64;

        let first = self.pos / block_len;
        let last = (self.pos + want as u64 - 1) / block_len;
        let span = ((last - first + 1) * block_len) as usize;

        let mut sectors = vec![0u8; span];
        self.runtime
            .block_on(self.store.read_sectors(first, &mut sectors))
            .map_err(std::io::Error::from)?;

        let offset = (self.pos % block_len) as usize;
        buf[..want].copy_from_slice(&sectors[offset..offset + want]);
        self.pos += want as u64;
        Ok(want)
    }
}

impl Write for PartitionIo {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let size = self.store.size_bytes();
        if self.pos >= size {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(size - self.pos) as usize;
        let block_len = self.store.block_len() as u64;

        let first = self.pos / block_len;
        let last = (self.pos + want as u64 - 1) / block_len;
        let span = ((last - first + 1) * block_len) as usize;
        let offset = (self.pos % block_len) as usize;

        let mut sectors = vec![0u8; span];
        let aligned = offset == 0 && want == span;
        if !aligned {
            // Preserve the partial boundary sectors.
            self.runtime
                .block_on(self.store.read_sectors(first, &mut sectors))
                .map_err(std::io::Error::from)?;
        }
        sectors[offset..offset + want].copy_from_slice(&buf[..want]);
        self.runtime
            .block_on(self.store.write_sectors(first, &sectors))
            .map_err(std::io::Error::from)?;

        self.pos += want as u64;
        Ok(want)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Seek for PartitionIo {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let size = self.store.size_bytes() as i128;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(offset) => size + offset as i128,
            SeekFrom::Current(offset) => self.pos as i128 + offset as i128,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of partition",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}
