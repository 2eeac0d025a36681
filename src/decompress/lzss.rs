//! LZSS sliding window.
//!
//! Both LZ decoders write literals and matches into a circular window whose
//! size is a power of two. Decoded bytes stay in the window until the
//! decoder flushes them, so the window doubles as the output buffer.

use super::{DecompressError, Result};

/// Window size of the RAR 2.9 decoder (4 MiB).
pub const WINDOW_SIZE_29: usize = 0x400000;

/// Smallest window the RAR5 decoder allocates.
pub const MIN_WINDOW_SIZE_50: usize = 0x40000;

/// Circular LZSS window.
pub struct Window {
    buf: Vec<u8>,
    mask: usize,
    /// Current write position
    ptr: usize,
    /// Bytes written since the last reset, saturating at the window size
    filled: usize,
}

impl Window {
    /// Create a window of `size` bytes; `size` must be a power of two.
    pub fn new(size: usize) -> Self {
        debug_assert!(size.is_power_of_two());
        Self {
            buf: vec![0; size],
            mask: size - 1,
            ptr: 0,
            filled: 0,
        }
    }

    /// Forget all history. The buffer is not cleared; reads are validated
    /// against the fill level.
    pub fn reset(&mut self) {
        self.ptr = 0;
        self.filled = 0;
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn mask(&self) -> usize {
        self.mask
    }

    #[inline]
    pub fn ptr(&self) -> usize {
        self.ptr
    }

    /// Enlarge the window to `size` bytes (a power of two), keeping the
    /// history. The retained bytes are moved to the start of the new buffer.
    pub fn grow(&mut self, size: usize) {
        debug_assert!(size.is_power_of_two());
        if size <= self.buf.len() {
            return;
        }
        let mut buf = Vec::with_capacity(size);
        if self.filled == self.buf.len() {
            buf.extend_from_slice(&self.buf[self.ptr..]);
            buf.extend_from_slice(&self.buf[..self.ptr]);
        } else {
            let start = self.ptr.wrapping_sub(self.filled) & self.mask;
            self.copy_area(start, self.ptr, &mut buf);
        }
        self.ptr = buf.len();
        buf.resize(size, 0);
        self.buf = buf;
        self.mask = size - 1;
    }

    /// Write a literal byte.
    #[inline]
    pub fn put(&mut self, byte: u8) {
        self.buf[self.ptr] = byte;
        self.ptr = (self.ptr + 1) & self.mask;
        if self.filled < self.buf.len() {
            self.filled += 1;
        }
    }

    /// Copy `length` bytes from `distance` bytes back. Overlapping copies
    /// repeat the pattern.
    #[inline]
    pub fn copy_match(&mut self, distance: usize, length: usize) -> Result<()> {
        if distance == 0 || distance > self.filled {
            return Err(DecompressError::InvalidDistance {
                distance: distance as u64,
            });
        }

        let size = self.buf.len();
        let src = self.ptr.wrapping_sub(distance) & self.mask;
        if distance >= length && src + length <= size && self.ptr + length <= size {
            self.buf.copy_within(src..src + length, self.ptr);
            self.ptr = (self.ptr + length) & self.mask;
        } else {
            let mut src = src;
            for _ in 0..length {
                self.buf[self.ptr] = self.buf[src];
                src = (src + 1) & self.mask;
                self.ptr = (self.ptr + 1) & self.mask;
            }
        }
        self.filled = (self.filled + length).min(size);
        Ok(())
    }

    /// Append the bytes in `[start, end)` to `out`, wrapping around the end
    /// of the window. `start == end` is empty.
    pub fn copy_area(&self, start: usize, end: usize, out: &mut Vec<u8>) -> usize {
        if end >= start {
            out.extend_from_slice(&self.buf[start..end]);
            end - start
        } else {
            out.extend_from_slice(&self.buf[start..]);
            out.extend_from_slice(&self.buf[..end]);
            self.buf.len() - start + end
        }
    }

    /// Copy `length` bytes starting at `start` into a new buffer.
    pub fn read_block(&self, start: usize, length: usize) -> Vec<u8> {
        let mut block = Vec::with_capacity(length);
        let first = length.min(self.buf.len() - start);
        block.extend_from_slice(&self.buf[start..start + first]);
        if first < length {
            block.extend_from_slice(&self.buf[..length - first]);
        }
        block
    }
}
