//! In-memory block device implementation

use crate::filesys::{BlockDevice, FsError};
use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;
use core::result::Result;

/// Block device that keeps its whole image in one heap buffer.
pub struct MemoryBlockDevice {
    image: Vec<u8>,

    /// Size of each block in bytes
    block_size: usize,
}

impl MemoryBlockDevice {
    /// Creates a zero-filled device of `total_blocks` blocks
    pub fn new(total_blocks: u64, block_size: usize) -> Self {
        Self {
            image: vec![0; total_blocks as usize * block_size],
            block_size,
        }
    }

    /// Byte range of a block, validating the block number and buffer size
    fn span(&self, block_num: u64, buf_len: usize) -> Result<Range<usize>, FsError> {
        if buf_len != self.block_size || block_num >= self.total_blocks() {
            return Err(FsError::IOError);
        }
        let start = block_num as usize * self.block_size;
        Ok(start..start + self.block_size)
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<(), FsError> {
        let span = self.span(block_num, buf.len())?;
        buf.copy_from_slice(&self.image[span]);
        Ok(())
    }

    fn write_block(&mut self, block_num: u64, buf: &[u8]) -> Result<(), FsError> {
        let span = self.span(block_num, buf.len())?;
        self.image[span].copy_from_slice(buf);
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn total_blocks(&self) -> u64 {
        (self.image.len() / self.block_size) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_are_independent() {
        let mut dev = MemoryBlockDevice::new(4, 512);
        dev.write_block(2, &[7u8; 512]).unwrap();

        let mut buf = [1u8; 512];
        dev.read_block(1, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        dev.read_block(2, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 7));
        dev.read_block(3, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_bounds_and_buffer_size() {
        let mut dev = MemoryBlockDevice::new(2, 512);
        assert_eq!(dev.total_blocks(), 2);
        let mut buf = [0u8; 512];
        assert_eq!(dev.read_block(2, &mut buf), Err(FsError::IOError));
        assert_eq!(dev.write_block(0, &[0u8; 100]), Err(FsError::IOError));
    }
}
