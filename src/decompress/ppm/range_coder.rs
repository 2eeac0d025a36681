//! Carryless range coder for PPMd blocks.
//!
//! Dmitry Subbotin's coder: the range is renormalized whenever its top byte
//! is settled, or forced down to [`BOT`] when it gets too small.

use std::io::{self, Read};

use crate::decompress::BitReader;

const TOP: u32 = 1 << 24;
const BOT: u32 = 1 << 15;

/// Decoder side. `code` is kept relative to `low`.
#[derive(Debug, Default)]
pub struct RangeCoder {
    low: u32,
    code: u32,
    range: u32,
}

impl RangeCoder {
    /// Load the first four code bytes. The reader must be byte aligned.
    pub fn init<R: Read>(&mut self, bits: &mut BitReader<R>) -> io::Result<()> {
        self.low = 0;
        self.range = u32::MAX;
        self.code = 0;
        for _ in 0..4 {
            self.code = (self.code << 8) | next_byte(bits)?;
        }
        Ok(())
    }

    /// Scale the range to `total` and return the count the code falls on.
    #[inline]
    pub fn current_count(&mut self, total: u32) -> u32 {
        self.range /= total.max(1);
        self.code / self.range.max(1)
    }

    /// Consume the interval `[start, start + size)` of the scaled range.
    #[inline]
    pub fn decode<R: Read>(&mut self, start: u32, size: u32, bits: &mut BitReader<R>) -> io::Result<()> {
        let start = start.wrapping_mul(self.range);
        self.low = self.low.wrapping_add(start);
        self.code = self.code.wrapping_sub(start);
        self.range = self.range.wrapping_mul(size);
        self.normalize(bits)
    }

    fn normalize<R: Read>(&mut self, bits: &mut BitReader<R>) -> io::Result<()> {
        loop {
            if (self.low ^ self.low.wrapping_add(self.range)) >= TOP {
                if self.range >= BOT {
                    return Ok(());
                }
                self.range = self.low.wrapping_neg() & (BOT - 1);
            }
            self.code = (self.code << 8) | next_byte(bits)?;
            self.range <<= 8;
            self.low <<= 8;
        }
    }
}

fn next_byte<R: Read>(bits: &mut BitReader<R>) -> io::Result<u32> {
    bits.fill()?;
    Ok(bits.read_bits(8))
}

/// Encoder side, used to build test streams.
#[cfg(test)]
pub(crate) struct RangeEncoder {
    low: u32,
    range: u32,
    out: Vec<u8>,
}

#[cfg(test)]
impl RangeEncoder {
    pub(crate) fn new() -> Self {
        Self {
            low: 0,
            range: u32::MAX,
            out: Vec::new(),
        }
    }

    pub(crate) fn encode(&mut self, start: u32, size: u32, total: u32) {
        self.range /= total;
        self.low = self.low.wrapping_add(start * self.range);
        self.range *= size;
        loop {
            if (self.low ^ self.low.wrapping_add(self.range)) >= TOP {
                if self.range >= BOT {
                    break;
                }
                self.range = self.low.wrapping_neg() & (BOT - 1);
            }
            self.out.push((self.low >> 24) as u8);
            self.range <<= 8;
            self.low <<= 8;
        }
    }

    pub(crate) fn finish(mut self) -> Vec<u8> {
        for _ in 0..4 {
            self.out.push((self.low >> 24) as u8);
            self.low <<= 8;
        }
        self.out
    }
}
