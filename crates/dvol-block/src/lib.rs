#![forbid(unsafe_code)]
//! Block I/O layer for dvol.
//!
//! Provides the `ByteDevice`/`BlockDevice` traits, file- and memory-backed
//! implementations, and the fixed-capacity VIO pool that carries metadata
//! reads and writes for a single zone thread.

pub mod vio_pool;

pub use vio_pool::{VioHandle, VioPool, VioPoolEntry};

use dvol_error::{DvolError, Result};
use dvol_types::{BLOCK_SIZE, BlockCount, PhysicalBlockNumber};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

// ── Block buffer ────────────────────────────────────────────────────────────

/// Owned block buffer, cheaply clonable; copy-on-write via `make_mut`.
///
/// Invariant: length == `BLOCK_SIZE` for buffers originating from a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Arc<Vec<u8>>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }

    #[must_use]
    pub fn zeroed() -> Self {
        Self::new(vec![0_u8; BLOCK_SIZE])
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn make_mut(&mut self) -> &mut [u8] {
        Arc::make_mut(&mut self.bytes).as_mut_slice()
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        match Arc::try_unwrap(self.bytes) {
            Ok(bytes) => bytes,
            Err(shared) => shared.as_ref().clone(),
        }
    }
}

// ── Device traits ───────────────────────────────────────────────────────────

/// Byte-addressed device with pread/pwrite semantics.
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `data` at `offset`.
    fn write_all_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Flush device caches.
    fn sync(&self) -> Result<()>;
}

/// 4 KiB block-addressed device.
pub trait BlockDevice: Send + Sync {
    /// Number of addressable blocks.
    fn block_count(&self) -> BlockCount;

    /// Read one block.
    fn read_block(&self, pbn: PhysicalBlockNumber) -> Result<BlockBuf>;

    /// Write one block; `data` must be exactly `BLOCK_SIZE` bytes.
    fn write_block(&self, pbn: PhysicalBlockNumber, data: &[u8]) -> Result<()>;

    /// Flush device caches.
    fn flush(&self) -> Result<()>;

    /// Read `count` consecutive blocks starting at `start`.
    fn read_blocks(&self, start: PhysicalBlockNumber, count: BlockCount) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(
            usize::try_from(count).unwrap_or(usize::MAX).saturating_mul(BLOCK_SIZE),
        );
        for i in 0..count {
            let pbn = start
                .checked_add(i)
                .ok_or(DvolError::OutOfRange { pbn: u64::MAX })?;
            out.extend_from_slice(self.read_block(pbn)?.as_slice());
        }
        Ok(out)
    }
}

// ── File-backed byte device ─────────────────────────────────────────────────

/// A `ByteDevice` over a regular file or block special file.
#[derive(Debug)]
pub struct FileByteDevice {
    file: std::fs::File,
    len: u64,
}

impl FileByteDevice {
    /// Open read-write.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        debug!(target: "dvol::block", path = %path.display(), len, "opened device");
        Ok(Self { file, len })
    }

    /// Open read-only (audit path).
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let len = file.metadata()?.len();
        debug!(target: "dvol::block", path = %path.display(), len, "opened device read-only");
        Ok(Self { file, len })
    }

    /// Create a fresh file of `len` bytes, truncating any existing content.
    pub fn create(path: &Path, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;
        Ok(Self { file, len })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

// ── Memory-backed byte device ───────────────────────────────────────────────

/// An in-memory `ByteDevice` for tests and scratch volumes.
#[derive(Debug)]
pub struct MemByteDevice {
    bytes: Mutex<Vec<u8>>,
    len: u64,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: u64) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; usize::try_from(len).unwrap_or(0)]),
            len,
        }
    }

    /// Snapshot the raw contents (test helper).
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Overwrite raw contents without bounds bookkeeping (test helper for
    /// simulating torn writes).
    pub fn patch(&self, offset: usize, data: &[u8]) {
        let mut bytes = self.bytes.lock();
        bytes[offset..offset + data.len()].copy_from_slice(data);
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .filter(|end| *end <= self.len)
            .ok_or(DvolError::OutOfRange {
                pbn: offset / BLOCK_SIZE as u64,
            })?;
        let bytes = self.bytes.lock();
        let start = usize::try_from(offset).map_err(|_| DvolError::OutOfRange {
            pbn: offset / BLOCK_SIZE as u64,
        })?;
        let end = usize::try_from(end).map_err(|_| DvolError::OutOfRange {
            pbn: offset / BLOCK_SIZE as u64,
        })?;
        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= self.len)
            .ok_or(DvolError::OutOfRange {
                pbn: offset / BLOCK_SIZE as u64,
            })?;
        let mut bytes = self.bytes.lock();
        let start = usize::try_from(offset).map_err(|_| DvolError::OutOfRange {
            pbn: offset / BLOCK_SIZE as u64,
        })?;
        let end = usize::try_from(end).map_err(|_| DvolError::OutOfRange {
            pbn: offset / BLOCK_SIZE as u64,
        })?;
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Byte-to-block adapter ───────────────────────────────────────────────────

/// Adapts any `ByteDevice` to the 4 KiB `BlockDevice` interface.
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_count: BlockCount,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    #[must_use]
    pub fn new(inner: D) -> Self {
        let block_count = inner.len_bytes() / BLOCK_SIZE as u64;
        Self { inner, block_count }
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn offset_of(&self, pbn: PhysicalBlockNumber) -> Result<u64> {
        if pbn.0 >= self.block_count {
            return Err(DvolError::OutOfRange { pbn: pbn.0 });
        }
        pbn.to_byte_offset()
            .ok_or(DvolError::OutOfRange { pbn: pbn.0 })
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn block_count(&self) -> BlockCount {
        self.block_count
    }

    fn read_block(&self, pbn: PhysicalBlockNumber) -> Result<BlockBuf> {
        let offset = self.offset_of(pbn)?;
        let mut buf = vec![0_u8; BLOCK_SIZE];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, pbn: PhysicalBlockNumber, data: &[u8]) -> Result<()> {
        if data.len() != BLOCK_SIZE {
            return Err(DvolError::Assertion("block write must be exactly one block"));
        }
        let offset = self.offset_of(pbn)?;
        self.inner.write_all_at(offset, data)
    }

    fn flush(&self) -> Result<()> {
        self.inner.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_round_trip() {
        let dev = MemByteDevice::new(4 * BLOCK_SIZE as u64);
        let block = ByteBlockDevice::new(dev);
        assert_eq!(block.block_count(), 4);

        let mut data = vec![0_u8; BLOCK_SIZE];
        data[0] = 0xAB;
        data[BLOCK_SIZE - 1] = 0xCD;
        block.write_block(PhysicalBlockNumber(2), &data).unwrap();

        let read = block.read_block(PhysicalBlockNumber(2)).unwrap();
        assert_eq!(read.as_slice(), data.as_slice());
        assert_eq!(block.read_block(PhysicalBlockNumber(1)).unwrap().as_slice()[0], 0);
    }

    #[test]
    fn out_of_range_block_is_rejected() {
        let block = ByteBlockDevice::new(MemByteDevice::new(2 * BLOCK_SIZE as u64));
        assert!(matches!(
            block.read_block(PhysicalBlockNumber(2)),
            Err(DvolError::OutOfRange { pbn: 2 })
        ));
        assert!(matches!(
            block.write_block(PhysicalBlockNumber(7), &[0_u8; BLOCK_SIZE]),
            Err(DvolError::OutOfRange { pbn: 7 })
        ));
    }

    #[test]
    fn short_write_is_an_assertion() {
        let block = ByteBlockDevice::new(MemByteDevice::new(2 * BLOCK_SIZE as u64));
        assert!(matches!(
            block.write_block(PhysicalBlockNumber(0), &[0_u8; 100]),
            Err(DvolError::Assertion(_))
        ));
    }

    #[test]
    fn read_blocks_spans_consecutively() {
        let block = ByteBlockDevice::new(MemByteDevice::new(4 * BLOCK_SIZE as u64));
        let mut data = vec![0x11_u8; BLOCK_SIZE];
        block.write_block(PhysicalBlockNumber(1), &data).unwrap();
        data.fill(0x22);
        block.write_block(PhysicalBlockNumber(2), &data).unwrap();

        let combined = block.read_blocks(PhysicalBlockNumber(1), 2).unwrap();
        assert_eq!(combined.len(), 2 * BLOCK_SIZE);
        assert_eq!(combined[0], 0x11);
        assert_eq!(combined[BLOCK_SIZE], 0x22);
    }

    #[test]
    fn file_device_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.img");
        let dev = FileByteDevice::create(&path, 8 * BLOCK_SIZE as u64).unwrap();
        assert_eq!(dev.len_bytes(), 8 * BLOCK_SIZE as u64);

        let block = ByteBlockDevice::new(dev);
        let data = vec![0x5A_u8; BLOCK_SIZE];
        block.write_block(PhysicalBlockNumber(3), &data).unwrap();
        block.flush().unwrap();

        let reopened = ByteBlockDevice::new(FileByteDevice::open_read_only(&path).unwrap());
        assert_eq!(
            reopened.read_block(PhysicalBlockNumber(3)).unwrap().as_slice(),
            data.as_slice()
        );
    }
}
