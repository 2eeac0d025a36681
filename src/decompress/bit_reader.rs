//! Bit reader for compressed data streams.
//!
//! Reads bits MSB first from any [`Read`] source. Decoders call [`fill`]
//! once per symbol; afterwards at least [`LOOKAHEAD`] bytes can be peeked
//! unless the source is exhausted. Bits past the end of the source read as
//! zero and set [`overrun`].
//!
//! [`fill`]: BitReader::fill
//! [`overrun`]: BitReader::overrun

use std::io::{self, Read};

/// Bytes guaranteed to be buffered after [`BitReader::fill`].
pub const LOOKAHEAD: usize = 64;

/// Refill granularity.
const CHUNK_SIZE: usize = 0x8000;

/// Bit reader that pulls bytes from a `Read` source on demand.
pub struct BitReader<R> {
    inner: R,
    buf: Vec<u8>,
    /// Byte index of the cursor in `buf`
    pos: usize,
    /// Bit offset within the byte at `pos` (0-7)
    bit: u32,
    /// Stream offset of `buf[0]`
    base: u64,
    eof: bool,
}

impl<R: Read> BitReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(CHUNK_SIZE + LOOKAHEAD),
            pos: 0,
            bit: 0,
            base: 0,
            eof: false,
        }
    }

    /// Make sure [`LOOKAHEAD`] bytes are buffered, if the source has them.
    pub fn fill(&mut self) -> io::Result<()> {
        if self.eof || self.buf.len().saturating_sub(self.pos) >= LOOKAHEAD {
            return Ok(());
        }

        let consumed = self.pos.min(self.buf.len());
        self.buf.drain(..consumed);
        self.base += consumed as u64;
        self.pos -= consumed;

        let mut filled = self.buf.len();
        self.buf.resize(CHUNK_SIZE + LOOKAHEAD, 0);
        while filled.saturating_sub(self.pos) < LOOKAHEAD {
            match self.inner.read(&mut self.buf[filled..]) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.buf.truncate(filled);
                    return Err(e);
                }
            }
        }
        self.buf.truncate(filled);
        Ok(())
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R> BitReader<R> {
    #[inline]
    fn byte(&self, offset: usize) -> u32 {
        self.buf
            .get(self.pos + offset)
            .map_or(0, |&b| u32::from(b))
    }

    /// Next 16 bits, MSB aligned in the low half of the result.
    #[inline]
    pub fn getbits(&self) -> u32 {
        let field = (self.byte(0) << 16) | (self.byte(1) << 8) | self.byte(2);
        (field >> (8 - self.bit)) & 0xffff
    }

    /// Next 32 bits.
    #[inline]
    pub fn getbits32(&self) -> u32 {
        let field =
            (self.byte(0) << 24) | (self.byte(1) << 16) | (self.byte(2) << 8) | self.byte(3);
        (field << self.bit) | (self.byte(4) >> (8 - self.bit))
    }

    /// Advance by `n` bits.
    #[inline]
    pub fn addbits(&mut self, n: u32) {
        let total = self.bit + n;
        self.pos += (total >> 3) as usize;
        self.bit = total & 7;
    }

    /// Peek at the next `n` bits (`n <= 16`) without consuming them.
    #[inline]
    pub fn peek_bits(&self, n: u32) -> u32 {
        debug_assert!(n <= 16);
        self.getbits() >> (16 - n)
    }

    /// Read `n` bits (`n <= 16`).
    #[inline]
    pub fn read_bits(&mut self, n: u32) -> u32 {
        let value = self.peek_bits(n);
        self.addbits(n);
        value
    }

    /// Skip to the next byte boundary.
    #[inline]
    pub fn align_to_byte(&mut self) {
        if self.bit != 0 {
            self.pos += 1;
            self.bit = 0;
        }
    }

    /// Bits consumed since the start of the stream.
    pub fn bit_position(&self) -> u64 {
        (self.base + self.pos as u64) * 8 + u64::from(self.bit)
    }

    /// Whether more bits were consumed than the source holds.
    pub fn overrun(&self) -> bool {
        self.eof && (self.pos > self.buf.len() || (self.pos == self.buf.len() && self.bit > 0))
    }

    /// Whether every bit of the source has been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.eof && self.pos >= self.buf.len()
    }

    /// Whole bytes consumed beyond the end of the source.
    pub fn bytes_past_end(&self) -> usize {
        if self.eof {
            self.pos.saturating_sub(self.buf.len())
        } else {
            0
        }
    }
}
