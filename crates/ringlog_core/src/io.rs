//! LSN-addressed device I/O.
//!
//! Translates LSN ranges to one or two file extents and issues them against
//! the block device. A range that runs past the end of the LSN space wraps
//! to its start and costs two I/Os.

use crate::error::LogResult;
use crate::format::LogGeometry;
use crate::types::Lsn;
use ringlog_storage::BlockDevice;

/// Reads `len` bytes of LSN space starting at `lsn`.
///
/// # Errors
///
/// Returns an error if either device read fails.
pub async fn read_lsn_range(
    device: &dyn BlockDevice,
    geometry: &LogGeometry,
    lsn: Lsn,
    len: u64,
) -> LogResult<Vec<u8>> {
    let ((offset, first_len), second) = geometry.extents(lsn, len);
    let mut bytes = device.read_at(offset, first_len as usize).await?;
    if let Some((offset, second_len)) = second {
        let tail = device.read_at(offset, second_len as usize).await?;
        bytes.extend_from_slice(&tail);
    }
    Ok(bytes)
}

/// Writes `data` into LSN space at `lsn` and flushes it.
///
/// A wrapping record is written as two concurrent device writes.
///
/// # Errors
///
/// Returns an error if a write or the flush fails.
pub async fn write_lsn_range(
    device: &dyn BlockDevice,
    geometry: &LogGeometry,
    lsn: Lsn,
    data: &[u8],
) -> LogResult<()> {
    let ((offset, first_len), second) = geometry.extents(lsn, data.len() as u64);
    let split = first_len as usize;
    match second {
        None => device.write_at(offset, data).await?,
        Some((second_offset, _)) => {
            tokio::try_join!(
                device.write_at(offset, &data[..split]),
                device.write_at(second_offset, &data[split..]),
            )?;
        }
    }
    device.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringlog_storage::{InMemoryDevice, BLOCK_SIZE};

    const B: u64 = BLOCK_SIZE as u64;

    #[tokio::test]
    async fn wrapping_range_round_trips() {
        let geometry = LogGeometry::new(B * 20).unwrap();
        let device = InMemoryDevice::with_len(B * 20);
        let lsn = Lsn::new((B * 35) as i64);
        let data: Vec<u8> = (0..B * 3).map(|i| (i % 251) as u8).collect();

        write_lsn_range(&device, &geometry, lsn, &data).await.unwrap();
        assert_eq!(read_lsn_range(&device, &geometry, lsn, B * 3).await.unwrap(), data);

        let raw = device.data();
        assert_eq!(&raw[(B * 18) as usize..(B * 19) as usize], &data[..B as usize]);
        assert_eq!(&raw[B as usize..(B * 3) as usize], &data[B as usize..]);
    }
}
