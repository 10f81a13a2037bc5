//! File-based block device for persistent logs.

use crate::device::{check_alignment, BlockDevice};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A file-backed block device.
///
/// The file is locked exclusively for the lifetime of the device so two
/// processes can never mount the same log. Blocking file calls run on the
/// tokio blocking pool; async callers never block a worker thread.
///
/// # Durability
///
/// - `write_at()` hands data to the OS
/// - `flush()` calls `File::sync_data()` to make it durable
///
/// # Example
///
/// ```no_run
/// use ringlog_storage::{BlockDevice, FileDevice, BLOCK_SIZE};
/// use std::path::Path;
///
/// # async fn demo() -> ringlog_storage::StorageResult<()> {
/// let device = FileDevice::create(Path::new("log.dat"), 64 * BLOCK_SIZE as u64)?;
/// device.write_at(0, &[0u8; BLOCK_SIZE]).await?;
/// device.flush().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct FileDevice {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl FileDevice {
    /// Creates a new file of `len` bytes, failing if it already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists, cannot be created, or is locked.
    pub fn create(path: &Path, len: u64) -> StorageResult<Self> {
        check_alignment(0, len as usize)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Self::lock(&file)?;
        file.set_len(len)?;
        file.sync_all()?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Opens an existing file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist or is locked.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::lock(&file)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Deletes the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be removed.
    pub fn remove(path: &Path) -> StorageResult<()> {
        std::fs::remove_file(path)?;
        Ok(())
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(file: &File) -> StorageResult<()> {
        file.try_lock_exclusive().map_err(|e| {
            if e.kind() == io::ErrorKind::WouldBlock {
                StorageError::Locked
            } else {
                StorageError::Io(e)
            }
        })
    }

    async fn blocking<T, F>(&self, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut File) -> StorageResult<T> + Send + 'static,
    {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || {
            let mut file = file.lock();
            op(&mut file)
        })
        .await
        .map_err(|e| StorageError::Io(io::Error::new(io::ErrorKind::Other, e)))?
    }
}

#[async_trait]
impl BlockDevice for FileDevice {
    async fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        check_alignment(offset, len)?;
        if len == 0 {
            return Ok(Vec::new());
        }
        self.blocking(move |file| {
            let size = file.metadata()?.len();
            if offset.saturating_add(len as u64) > size {
                return Err(StorageError::ReadPastEnd { offset, len, size });
            }
            file.seek(SeekFrom::Start(offset))?;
            let mut buffer = vec![0u8; len];
            file.read_exact(&mut buffer)?;
            Ok(buffer)
        })
        .await
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> StorageResult<()> {
        check_alignment(offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        let data = data.to_vec();
        self.blocking(move |file| {
            let size = file.metadata()?.len();
            let len = data.len();
            if offset.saturating_add(len as u64) > size {
                return Err(StorageError::ReadPastEnd { offset, len, size });
            }
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&data)?;
            Ok(())
        })
        .await
    }

    async fn flush(&self) -> StorageResult<()> {
        self.blocking(|file| {
            file.flush()?;
            file.sync_data()?;
            Ok(())
        })
        .await
    }

    async fn size(&self) -> StorageResult<u64> {
        self.blocking(|file| Ok(file.metadata()?.len())).await
    }

    async fn set_len(&self, len: u64) -> StorageResult<()> {
        check_alignment(0, len as usize)?;
        self.blocking(move |file| {
            file.set_len(len)?;
            file.sync_all()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_SIZE;
    use tempfile::tempdir;

    const LEN: u64 = 8 * BLOCK_SIZE as u64;

    #[tokio::test]
    async fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.dat");

        let device = FileDevice::create(&path, LEN).unwrap();
        assert_eq!(device.size().await.unwrap(), LEN);
        assert!(path.exists());
        assert_eq!(device.path(), path);
    }

    #[tokio::test]
    async fn file_create_existing_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.dat");

        drop(FileDevice::create(&path, LEN).unwrap());
        assert!(FileDevice::create(&path, LEN).is_err());
    }

    #[tokio::test]
    async fn file_write_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.dat");
        let device = FileDevice::create(&path, LEN).unwrap();

        let block = vec![0xAB; BLOCK_SIZE];
        device.write_at(BLOCK_SIZE as u64, &block).await.unwrap();

        let data = device.read_at(BLOCK_SIZE as u64, BLOCK_SIZE).await.unwrap();
        assert_eq!(data, block);

        let untouched = device.read_at(0, BLOCK_SIZE).await.unwrap();
        assert!(untouched.iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn file_read_past_end_fails() {
        let dir = tempdir().unwrap();
        let device = FileDevice::create(&dir.path().join("log.dat"), LEN).unwrap();

        let result = device.read_at(LEN, BLOCK_SIZE).await;
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
    }

    #[tokio::test]
    async fn file_misaligned_write_fails() {
        let dir = tempdir().unwrap();
        let device = FileDevice::create(&dir.path().join("log.dat"), LEN).unwrap();

        let result = device.write_at(10, &[0u8; BLOCK_SIZE]).await;
        assert!(matches!(result, Err(StorageError::Misaligned { .. })));
    }

    #[tokio::test]
    async fn file_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.dat");

        {
            let device = FileDevice::create(&path, LEN).unwrap();
            device.write_at(0, &[0x5A; BLOCK_SIZE]).await.unwrap();
            device.flush().await.unwrap();
        }

        let device = FileDevice::open(&path).unwrap();
        assert_eq!(device.size().await.unwrap(), LEN);
        let data = device.read_at(0, BLOCK_SIZE).await.unwrap();
        assert!(data.iter().all(|b| *b == 0x5A));
    }

    #[tokio::test]
    async fn file_second_open_is_locked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.dat");

        let _device = FileDevice::create(&path, LEN).unwrap();
        assert!(matches!(FileDevice::open(&path), Err(StorageError::Locked)));
    }

    #[tokio::test]
    async fn file_set_len_and_remove() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.dat");

        let device = FileDevice::create(&path, LEN).unwrap();
        device.set_len(2 * LEN).await.unwrap();
        assert_eq!(device.size().await.unwrap(), 2 * LEN);
        drop(device);

        FileDevice::remove(&path).unwrap();
        assert!(!path.exists());
    }
}
