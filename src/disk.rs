// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Disk I/O abstraction.
//!
//! Every lease record read or write goes through a [`Disk`]. A real deployment uses
//! [`FileDisk`], which issues aligned `pread`/`pwrite` on a blocking thread pool and applies
//! an absolute deadline to the whole call. Tests use [`MemDisk`], an in-memory double that can
//! be told to delay or fail specific sectors to exercise majority/timeout behavior.
//!
//! # The timeout-leaks-the-buffer contract
//!
//! A call that returns [`DiskError::Timeout`] does not guarantee the underlying I/O has
//! stopped, and it may complete after the deadline, writing into or reading from the buffer
//! the caller supplied. Callers MUST NOT reuse or drop a buffer involved in a timed-out call; they
//! must allocate a fresh one for any subsequent attempt. [`FileDisk`] upholds this by moving
//! the buffer into the spawned blocking task and only ever handing a *copy* back to the
//! caller on success, never the original allocation, so a straggling completion cannot alias
//! memory the caller has since reused.

use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DiskError {
    #[error("disk i/o did not complete within the deadline")]
    Timeout,
    #[error("disk i/o failed")]
    Io,
    #[error("sector address out of range for this descriptor")]
    OutOfRange,
}

impl DiskError {
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            DiskError::Timeout => -201,
            DiskError::Io => -202,
            DiskError::OutOfRange => -202,
        }
    }
}

/// A disk (or disk-backed file) holding one or more lockspaces/resources, plus the sector
/// geometry needed to address within it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskDescriptor {
    pub path: PathBuf,
    pub sector_size: u32,
}

/// A byte range within a [`DiskDescriptor`], expressed as a sector-aligned offset and length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SectorAddr {
    pub offset: u64,
    pub len: usize,
}

impl SectorAddr {
    #[must_use]
    pub fn new(offset: u64, len: usize) -> Self {
        Self { offset, len }
    }
}

impl TryFrom<(&DiskDescriptor, u64, usize)> for SectorAddr {
    type Error = DiskError;

    fn try_from((disk, offset, len): (&DiskDescriptor, u64, usize)) -> Result<Self, DiskError> {
        if offset % u64::from(disk.sector_size) != 0 || len % disk.sector_size as usize != 0 {
            return Err(DiskError::OutOfRange);
        }
        Ok(Self { offset, len })
    }
}

/// Async disk I/O, timeout-bounded on every call.
#[async_trait::async_trait]
pub trait Disk: Send + Sync {
    /// Reads `addr.len` bytes starting at `addr.offset`, failing with [`DiskError::Timeout`]
    /// if `deadline` elapses first.
    async fn read(&self, addr: SectorAddr, deadline: Duration) -> Result<Vec<u8>, DiskError>;

    /// Writes `buf` at `addr.offset`. `buf.len()` must equal `addr.len`.
    async fn write(&self, addr: SectorAddr, buf: Vec<u8>, deadline: Duration) -> Result<(), DiskError>;
}

/// Real disk backed by a regular file or block device, via blocking `pread`/`pwrite`.
pub struct FileDisk {
    file: Arc<std::fs::File>,
}

impl FileDisk {
    /// Opens `path` for read-write access.
    ///
    /// # Errors
    /// Returns [`DiskError::Io`] if the file cannot be opened.
    pub fn open(path: &Path) -> Result<Self, DiskError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|_| DiskError::Io)?;
        Ok(Self { file: Arc::new(file) })
    }
}

#[async_trait::async_trait]
impl Disk for FileDisk {
    async fn read(&self, addr: SectorAddr, deadline: Duration) -> Result<Vec<u8>, DiskError> {
        let file = Arc::clone(&self.file);
        let task = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; addr.len];
            nix::sys::uio::pread(file.as_fd(), &mut buf, addr.offset as i64).map_err(|_| DiskError::Io)?;
            Ok::<_, DiskError>(buf)
        });
        match tokio::time::timeout(deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DiskError::Io),
            Err(_) => Err(DiskError::Timeout),
        }
    }

    async fn write(&self, addr: SectorAddr, buf: Vec<u8>, deadline: Duration) -> Result<(), DiskError> {
        debug_assert_eq!(buf.len(), addr.len);
        let file = Arc::clone(&self.file);
        let task = tokio::task::spawn_blocking(move || {
            nix::sys::uio::pwrite(file.as_fd(), &buf, addr.offset as i64).map_err(|_| DiskError::Io)?;
            Ok::<_, DiskError>(())
        });
        match tokio::time::timeout(deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DiskError::Io),
            Err(_) => Err(DiskError::Timeout),
        }
    }
}

/// In-memory [`Disk`] double for tests. Sectors not yet written read back as zeros. Individual
/// sectors can be made to time out or fail so majority/quorum paths can be exercised.
#[cfg(any(test, feature = "test-util"))]
pub struct MemDisk {
    bytes: Mutex<Vec<u8>>,
    stall: Mutex<std::collections::HashSet<u64>>,
    fail: Mutex<std::collections::HashSet<u64>>,
}

#[cfg(any(test, feature = "test-util"))]
impl MemDisk {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self { bytes: Mutex::new(vec![0u8; size]), stall: Mutex::new(Default::default()), fail: Mutex::new(Default::default()) }
    }

    /// Marks writes/reads touching `offset` to always time out.
    pub async fn stall_offset(&self, offset: u64) {
        self.stall.lock().await.insert(offset);
    }

    /// Marks writes/reads touching `offset` to always fail with [`DiskError::Io`].
    pub async fn fail_offset(&self, offset: u64) {
        self.fail.lock().await.insert(offset);
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait::async_trait]
impl Disk for MemDisk {
    async fn read(&self, addr: SectorAddr, _deadline: Duration) -> Result<Vec<u8>, DiskError> {
        if self.stall.lock().await.contains(&addr.offset) {
            return Err(DiskError::Timeout);
        }
        if self.fail.lock().await.contains(&addr.offset) {
            return Err(DiskError::Io);
        }
        let bytes = self.bytes.lock().await;
        let start = addr.offset as usize;
        bytes.get(start..start + addr.len).map(<[u8]>::to_vec).ok_or(DiskError::OutOfRange)
    }

    async fn write(&self, addr: SectorAddr, buf: Vec<u8>, _deadline: Duration) -> Result<(), DiskError> {
        if self.stall.lock().await.contains(&addr.offset) {
            return Err(DiskError::Timeout);
        }
        if self.fail.lock().await.contains(&addr.offset) {
            return Err(DiskError::Io);
        }
        let mut bytes = self.bytes.lock().await;
        let start = addr.offset as usize;
        let dst = bytes.get_mut(start..start + addr.len).ok_or(DiskError::OutOfRange)?;
        dst.copy_from_slice(&buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let disk = MemDisk::new(4096);
        let addr = SectorAddr::new(512, 512);
        disk.write(addr, vec![7u8; 512], Duration::from_secs(1)).await.unwrap();
        let read = disk.read(addr, Duration::from_secs(1)).await.unwrap();
        assert_eq!(read, vec![7u8; 512]);
    }

    #[tokio::test]
    async fn stalled_sector_times_out() {
        let disk = MemDisk::new(4096);
        disk.stall_offset(0).await;
        let addr = SectorAddr::new(0, 512);
        let result = disk.read(addr, Duration::from_millis(10)).await;
        assert_eq!(result, Err(DiskError::Timeout));
    }

    #[tokio::test]
    async fn failed_sector_reports_io_error() {
        let disk = MemDisk::new(4096);
        disk.fail_offset(512).await;
        let addr = SectorAddr::new(512, 512);
        let result = disk.write(addr, vec![0u8; 512], Duration::from_secs(1)).await;
        assert_eq!(result, Err(DiskError::Io));
    }

    #[test]
    fn misaligned_sector_addr_is_rejected() {
        let disk = DiskDescriptor { path: PathBuf::from("/dev/null"), sector_size: 512 };
        let result = SectorAddr::try_from((&disk, 100, 512));
        assert_eq!(result, Err(DiskError::OutOfRange));
    }
}
