//! The volume handle (C1): synchronous positioned I/O over the raw device,
//! wrapped so callers can `.await` it without blocking the async runtime.
//!
//! The trait shape (an async-trait abstraction with a production impl) is
//! grounded on `vector_buffers::disk_v2::io::Filesystem`/`ProductionFilesystem`.
//! The exact synchronous read/write semantics — retry-until-done positioned
//! I/O, `eof` on a zero-byte read, `null_write` on a zero-byte write — are
//! ported from `examples/original_source/xproxy-beta/cache/volume_fd.cpp`.
//!
//! `O_DIRECT` is Linux-specific and requires page-aligned buffers of a
//! size the allocator does not guarantee in safe Rust without a dedicated
//! aligned-allocation helper; this port keeps the portable subset of the
//! original's durability guarantee (`O_DSYNC`) by opening the file
//! normally and calling `sync_data` after every write, and records the
//! `O_DIRECT` omission in `DESIGN.md` rather than silently dropping it.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use snafu::ResultExt;

use crate::error::{EofSnafu, IoSnafu, NullWriteSnafu, VolumeError};

/// Positioned, page-aligned I/O over one physical volume (§4.1). All
/// buffers passed in are expected to already be sized in multiples of the
/// device's logical block size; this trait does not validate alignment
/// itself; `config::VolumeConfig` is responsible for choosing aligned
/// sizes.
#[async_trait]
pub trait Volume: Send + Sync {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), VolumeError>;
    async fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), VolumeError>;
    async fn truncate(&self, size: u64) -> Result<(), VolumeError>;
    async fn close(&self) -> Result<(), VolumeError>;
    fn size(&self) -> u64;
}

/// A real volume backed by a regular file or block device, opened for
/// read-write positioned I/O with data-synchronous writes.
pub struct ProductionVolume {
    file: Arc<std::fs::File>,
    size: u64,
}

impl ProductionVolume {
    pub async fn open(path: &Path) -> io::Result<Self> {
        let path = path.to_owned();
        let file = tokio::task::spawn_blocking(move || {
            OpenOptions::new().read(true).write(true).open(&path)
        })
        .await
        .expect("open task panicked")?;
        let size = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            size,
        })
    }

    #[cfg(test)]
    pub async fn create(path: &Path, size: u64) -> io::Result<Self> {
        let path_for_create = path.to_owned();
        let file = tokio::task::spawn_blocking(move || {
            let f = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path_for_create)?;
            f.set_len(size)?;
            Ok::<_, io::Error>(f)
        })
        .await
        .expect("create task panicked")?;
        Ok(Self {
            file: Arc::new(file),
            size,
        })
    }
}

#[async_trait]
impl Volume for ProductionVolume {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), VolumeError> {
        let file = Arc::clone(&self.file);
        let len = buf.len();
        let mut owned = vec![0u8; len];
        let owned = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, VolumeError> {
            let mut pos = offset;
            let mut filled = 0usize;
            while filled < owned.len() {
                let read = file
                    .read_at(&mut owned[filled..], pos)
                    .context(IoSnafu { offset: pos })?;
                if read == 0 {
                    return EofSnafu {
                        offset: pos,
                        requested: owned.len() - filled,
                    }
                    .fail();
                }
                filled += read;
                pos += read as u64;
            }
            Ok(owned)
        })
        .await
        .expect("read task panicked")?;
        buf.copy_from_slice(&owned);
        Ok(())
    }

    async fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), VolumeError> {
        let file = Arc::clone(&self.file);
        let owned = buf.to_vec();
        tokio::task::spawn_blocking(move || -> Result<(), VolumeError> {
            let mut pos = offset;
            let mut written_total = 0usize;
            while written_total < owned.len() {
                let written = file
                    .write_at(&owned[written_total..], pos)
                    .context(IoSnafu { offset: pos })?;
                if written == 0 {
                    return NullWriteSnafu {
                        offset: pos,
                        requested: owned.len() - written_total,
                    }
                    .fail();
                }
                written_total += written;
                pos += written as u64;
            }
            file.sync_data().context(IoSnafu { offset })?;
            Ok(())
        })
        .await
        .expect("write task panicked")
    }

    async fn truncate(&self, size: u64) -> Result<(), VolumeError> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.set_len(size))
            .await
            .expect("truncate task panicked")
            .context(IoSnafu { offset: 0 })
    }

    async fn close(&self) -> Result<(), VolumeError> {
        // `std::fs::File`'s `Drop` closes the fd; nothing to flush beyond
        // the per-write `sync_data` already performed.
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// An in-memory volume used by tests (`index.rs`/`metadata.rs`/`aggregate.rs`
/// test modules and the `tests/` integration suite). Mirrors the
/// production semantics: a zero-length region read past EOF is an error,
/// not a short read.
pub struct MemoryVolume {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemoryVolume {
    pub fn new(size: u64) -> Self {
        Self {
            data: Arc::new(Mutex::new(vec![0u8; size as usize])),
        }
    }

    /// A second handle backed by the same underlying buffer, so a test can
    /// keep poking at a volume's bytes directly (e.g. to corrupt a
    /// metadata slot) after handing one handle off to a [`CacheFs`](crate::orchestrator::CacheFs)
    /// that takes ownership of its `Box<dyn Volume>`.
    pub fn shared_handle(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
        }
    }
}

#[async_trait]
impl Volume for MemoryVolume {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), VolumeError> {
        let data = self.data.lock();
        let offset = offset as usize;
        if offset + buf.len() > data.len() {
            return EofSnafu {
                offset: offset as u64,
                requested: buf.len(),
            }
            .fail();
        }
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        Ok(())
    }

    async fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), VolumeError> {
        let mut data = self.data.lock();
        let offset = offset as usize;
        if offset + buf.len() > data.len() {
            return EofSnafu {
                offset: offset as u64,
                requested: buf.len(),
            }
            .fail();
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    async fn truncate(&self, size: u64) -> Result<(), VolumeError> {
        self.data.lock().resize(size as usize, 0);
        Ok(())
    }

    async fn close(&self) -> Result<(), VolumeError> {
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_volume_round_trips() {
        let vol = MemoryVolume::new(4096);
        let data = vec![0xAB; 512];
        vol.write_at(&data, 1024).await.unwrap();
        let mut out = vec![0u8; 512];
        vol.read_at(&mut out, 1024).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn memory_volume_read_past_end_is_eof() {
        let vol = MemoryVolume::new(100);
        let mut out = vec![0u8; 50];
        let err = vol.read_at(&mut out, 80).await.unwrap_err();
        assert!(matches!(err, VolumeError::Eof { .. }));
    }

    #[tokio::test]
    async fn production_volume_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.bin");
        let vol = ProductionVolume::create(&path, 1 << 20).await.unwrap();
        let data = vec![0xCD; 4096];
        vol.write_at(&data, 8192).await.unwrap();
        let mut out = vec![0u8; 4096];
        vol.read_at(&mut out, 8192).await.unwrap();
        assert_eq!(out, data);
    }
}
