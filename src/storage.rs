//! In-memory backing store

use crate::error::{IscsiError, ScsiResult};
use crate::scsi::{bounds, ScsiBlockDevice};

/// Vector-backed block device for demos and tests
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    block_size: u32,
    blocks: u64,
    data: Vec<u8>,
}

impl MemoryDevice {
    pub fn new(blocks: u64, block_size: u32) -> Self {
        MemoryDevice {
            block_size,
            blocks,
            data: vec![0u8; (blocks * block_size as u64) as usize],
        }
    }

    /// Device of at least `bytes` bytes
    pub fn with_size(bytes: u64, block_size: u32) -> Self {
        MemoryDevice::new(bytes.div_ceil(block_size as u64), block_size)
    }

    /// Byte range of an access, validated
    fn range(&self, lba: u64, len: usize) -> ScsiResult<std::ops::Range<usize>> {
        if len % self.block_size as usize != 0 {
            return Err(IscsiError::Scsi(format!(
                "buffer of {} bytes is not a multiple of the {} byte block",
                len, self.block_size
            )));
        }
        let blocks = (len / self.block_size as usize) as i64;
        let lba_signed = i64::try_from(lba).unwrap_or(-1);
        match self.check_bounds(lba_signed, i32::try_from(blocks).unwrap_or(-1)) {
            bounds::OK => {}
            code => {
                return Err(IscsiError::Scsi(format!(
                    "access of {} blocks at LBA {} out of bounds (code {})",
                    blocks, lba, code
                )))
            }
        }
        let start = (lba * self.block_size as u64) as usize;
        Ok(start..start + len)
    }
}

impl ScsiBlockDevice for MemoryDevice {
    fn read(&self, lba: u64, buf: &mut [u8]) -> ScsiResult<()> {
        let range = self.range(lba, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, lba: u64, buf: &[u8]) -> ScsiResult<()> {
        let range = self.range(lba, buf.len())?;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.blocks
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn product_id(&self) -> &str {
        "Memory Disk     "
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_codes() {
        let device = MemoryDevice::new(16, 512);
        assert_eq!(device.check_bounds(0, 16), bounds::OK);
        assert_eq!(device.check_bounds(-1, 1), bounds::BAD_LBA);
        assert_eq!(device.check_bounds(0, -1), bounds::BAD_LENGTH);
        assert_eq!(device.check_bounds(16, 0), bounds::BAD_LBA);
        assert_eq!(device.check_bounds(15, 2), bounds::BAD_LENGTH);
    }

    #[test]
    fn test_read_write() {
        let mut device = MemoryDevice::with_size(4096, 512);
        assert_eq!(device.block_count(), 8);

        let block = [0xA5u8; 512];
        device.write(3, &block).unwrap();
        let mut buf = [0u8; 1024];
        device.read(2, &mut buf).unwrap();
        assert!(buf[..512].iter().all(|&b| b == 0));
        assert_eq!(&buf[512..], &block[..]);
    }

    #[test]
    fn test_rejects_bad_access() {
        let mut device = MemoryDevice::new(4, 512);
        assert!(device.write(4, &[0u8; 512]).is_err());
        assert!(device.write(0, &[0u8; 100]).is_err());
        let mut buf = [0u8; 1024];
        assert!(device.read(3, &mut buf).is_err());
    }
}
