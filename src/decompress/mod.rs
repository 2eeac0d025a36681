//! RAR decompression algorithms.
//!
//! This module implements the algorithms RAR archives use for compressed
//! entries, behind a streaming [`Unpacker`]: two LZ + Huffman schemes, and
//! PPMd blocks mixed into RAR 2.9 streams.
//!
//! ## Decoders
//!
//! | Decoder | Format | Algorithms |
//! |---------|--------|------------|
//! | [`Rar29Decoder`] | RAR 2.9-4.x | LZSS + Huffman or PPMd, standard VM filters |
//! | [`Rar5Decoder`] | RAR 5.0+ | LZSS + Huffman, byte filters |
//!
//! ## Compression Methods
//!
//! RAR4 headers store the method as a byte, RAR5 headers as a 3-bit level:
//!
//! | RAR4 | RAR5 | Name | Description |
//! |------|------|------|-------------|
//! | `0x30` | 0 | Store | No compression (data is stored as-is) |
//! | `0x31` | 1 | Fastest | LZSS with minimal effort |
//! | `0x32` | 2 | Fast | |
//! | `0x33` | 3 | Normal | Default level |
//! | `0x34` | 4 | Good | |
//! | `0x35` | 5 | Best | Maximum effort |
//!
//! The level only describes the encoder's effort; decoding is identical.
//!
//! ## Filter Support
//!
//! RAR applies preprocessing filters before compression to improve ratios:
//!
//! | Filter | RAR4 | RAR5 | Description |
//! |--------|------|------|-------------|
//! | Delta | ✅ | ✅ | Byte delta encoding (audio, images) |
//! | E8/E8E9 | ✅ | ✅ | x86 CALL/JMP instruction preprocessing |
//! | ARM | — | ✅ | ARM branch instruction preprocessing |
//! | Itanium | ✅ | — | IA-64 branch preprocessing |
//! | Audio | ✅ | — | Multi-channel audio predictor |
//! | RGB | ✅ | — | Predictive color filter (images) |
//!
//! RAR4 filters are VM programs; only the six standard programs are
//! recognized, by length and CRC32 of their bytecode.
//!
//! ## Architecture
//!
//! ```text
//! Packed bytes (Read)
//!       ↓
//! ┌─────────────┐
//! │ BitReader   │ ← Bit-level access, refilled on demand
//! └─────────────┘
//!       ↓
//! ┌─────────────┐
//! │ Huffman     │ ← Decode variable-length symbols
//! └─────────────┘
//!       ↓
//! ┌─────────────┐
//! │ Window      │ ← Expand literals and back-references
//! └─────────────┘
//!       ↓
//! ┌─────────────┐
//! │ Filters     │ ← Applied while flushing the window
//! └─────────────┘
//!       ↓
//! Unpacked bytes (Read)
//! ```
//!
//! Solid archives continue one decoder across entries; [`LzState`] carries
//! a decoder from one entry's [`Unpacker`] to the next.

mod bit_reader;
mod huffman;
mod lzss;
mod ppm;
pub mod rar29;
pub mod rar5;


pub use bit_reader::BitReader;
pub use huffman::HuffmanTable;
pub use lzss::Window;
pub use rar29::Rar29Decoder;
pub use rar5::Rar5Decoder;

use std::io::{self, Read};

use thiserror::Error;
use tracing::debug;

use crate::error::{ErrorKind, RarError};
use crate::parsing::MAX_DICT_SIZE;

/// Decompression errors.
#[derive(Debug, Error)]
pub enum DecompressError {
    #[error("unexpected end of compressed data")]
    UnexpectedEof,
    #[error("invalid Huffman table")]
    InvalidHuffmanTable,
    #[error("invalid block header")]
    InvalidBlockHeader,
    #[error("match distance {distance} reaches before the start of the output")]
    InvalidDistance { distance: u64 },
    #[error("invalid filter")]
    InvalidFilter,
    #[error("corrupt PPMd data")]
    InvalidPpmData,
    #[error("non-standard RAR VM filter programs are not supported")]
    CustomFilter,
    #[error("dictionary of {0} bytes exceeds the supported maximum")]
    DictionaryTooLarge(u64),
    #[error("compression method {0:?} cannot be decoded")]
    UnsupportedMethod(CompressionMethod),
    #[error("unpacked data is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<DecompressError> for RarError {
    fn from(err: DecompressError) -> Self {
        match err {
            DecompressError::Io(e) => RarError::from(e),
            DecompressError::CustomFilter
            | DecompressError::DictionaryTooLarge(_)
            | DecompressError::UnsupportedMethod(_) => {
                RarError::new(ErrorKind::UnsupportedMethod, err.to_string())
            }
            other => RarError::new(ErrorKind::DecompressionFault, other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DecompressError>;

/// Compression method of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    /// Store (no compression)
    Store,
    /// RAR 2.9 LZ, RAR4 methods 0x31-0x35 with unpack version 29
    Lz29 { level: u8 },
    /// RAR 5.0 LZ, methods 1-5 with algorithm version 0
    Lz5 { level: u8 },
    /// Anything else: RAR 1.5/2.0 unpack versions, RAR 7.0 algorithm, ...
    Unsupported { version: u8, method: u8 },
}

impl CompressionMethod {
    /// Whether this method requires decompression.
    pub fn needs_decompression(&self) -> bool {
        *self != Self::Store
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unsupported { .. })
    }
}

/// Unpacker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// Nothing read yet.
    Init,
    Streaming,
    /// The stream ended and all output was delivered.
    Done,
    /// A fault was reported; further reads fail.
    Failed,
}

pub(crate) enum Decoder {
    Rar29(Box<Rar29Decoder>),
    Rar5(Box<Rar5Decoder>),
}

impl Decoder {
    fn start<R: Read>(
        &mut self,
        bits: &mut BitReader<R>,
        solid: bool,
        limit: Option<u64>,
    ) -> Result<()> {
        match self {
            Decoder::Rar29(d) => {
                d.start(bits, solid)?;
                d.set_output_limit(limit);
            }
            Decoder::Rar5(d) => {
                d.start(solid);
                d.set_output_limit(limit);
            }
        }
        Ok(())
    }

    fn decode_chunk<R: Read>(&mut self, bits: &mut BitReader<R>, out: &mut Vec<u8>) -> Result<bool> {
        match self {
            Decoder::Rar29(d) => d.decode_chunk(bits, out),
            Decoder::Rar5(d) => d.decode_chunk(bits, out),
        }
    }
}

/// Decoder state left behind by a finished entry of a solid archive.
pub struct LzState {
    decoder: Decoder,
    entry_index: usize,
}

impl LzState {
    /// Index of the entry whose data this state has consumed.
    pub fn entry_index(&self) -> usize {
        self.entry_index
    }
}

impl std::fmt::Debug for LzState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.decoder {
            Decoder::Rar29(_) => "rar29",
            Decoder::Rar5(_) => "rar5",
        };
        f.debug_struct("LzState")
            .field("decoder", &kind)
            .field("entry_index", &self.entry_index)
            .finish()
    }
}

/// What an [`Unpacker`] needs to know about the entry it decodes.
#[derive(Debug, Clone, Copy)]
pub struct UnpackParams {
    pub method: CompressionMethod,
    pub dict_size: u64,
    /// Declared unpacked size; output is capped to it and must reach it.
    pub unpacked_size: Option<u64>,
    /// The archive is solid, so later entries may reuse this window.
    pub solid_archive: bool,
}

/// Streaming decompressor: packed bytes in, unpacked bytes out.
pub struct Unpacker<R> {
    bits: BitReader<R>,
    decoder: Decoder,
    solid: bool,
    status: DecodeStatus,
    expected: Option<u64>,
    produced: u64,
    chunk: Vec<u8>,
    chunk_pos: usize,
}

impl<R: Read> Unpacker<R> {
    /// Set up decoding of one entry. `carry` continues the decoder of the
    /// previous entry of a solid group.
    pub fn new(input: R, params: UnpackParams, carry: Option<LzState>) -> Result<Self> {
        let carried = carry.map(|state| state.decoder);
        if matches!(params.method, CompressionMethod::Lz5 { .. })
            && params.dict_size > MAX_DICT_SIZE
        {
            return Err(DecompressError::DictionaryTooLarge(params.dict_size));
        }
        let (decoder, solid) = match (params.method, carried) {
            (CompressionMethod::Lz29 { .. }, Some(Decoder::Rar29(d))) => (Decoder::Rar29(d), true),
            (CompressionMethod::Lz29 { .. }, _) => (Decoder::Rar29(Box::new(Rar29Decoder::new())), false),
            (CompressionMethod::Lz5 { .. }, Some(Decoder::Rar5(mut d))) => {
                let window = rar5_window_size(&params);
                if window > d.window_size() {
                    debug!(from = d.window_size(), to = window, "growing solid RAR5 window");
                    d.grow_window(window);
                }
                (Decoder::Rar5(d), true)
            }
            (CompressionMethod::Lz5 { .. }, _) => {
                let window = rar5_window_size(&params);
                debug!(window, "allocating RAR5 window");
                (Decoder::Rar5(Box::new(Rar5Decoder::new(window))), false)
            }
            (method, _) => return Err(DecompressError::UnsupportedMethod(method)),
        };

        Ok(Self {
            bits: BitReader::new(input),
            decoder,
            solid,
            status: DecodeStatus::Init,
            expected: params.unpacked_size,
            produced: 0,
            chunk: Vec::new(),
            chunk_pos: 0,
        })
    }

    pub fn status(&self) -> DecodeStatus {
        self.status
    }

    /// Bytes delivered so far.
    pub fn produced(&self) -> u64 {
        self.produced
    }

    /// Hand the decoder on to the next entry of a solid group.
    pub fn into_state(self, entry_index: usize) -> LzState {
        LzState {
            decoder: self.decoder,
            entry_index,
        }
    }

    fn next_chunk(&mut self) -> Result<()> {
        self.chunk.clear();
        self.chunk_pos = 0;
        if self.status == DecodeStatus::Init {
            self.bits.fill()?;
            self.decoder.start(&mut self.bits, self.solid, self.expected)?;
            self.status = DecodeStatus::Streaming;
        }

        let finished = self.decoder.decode_chunk(&mut self.bits, &mut self.chunk)?;
        if let Some(expected) = self.expected {
            let room = expected - self.produced;
            if self.chunk.len() as u64 > room {
                self.chunk.truncate(room as usize);
            }
        }
        self.produced += self.chunk.len() as u64;

        // Bits after the declared size are padding
        let complete = self.expected.is_some_and(|expected| self.produced >= expected);
        if finished || complete {
            if let Some(expected) = self.expected.filter(|_| !complete) {
                return Err(DecompressError::SizeMismatch {
                    expected,
                    actual: self.produced,
                });
            }
            self.status = DecodeStatus::Done;
        }
        Ok(())
    }
}

impl<R: Read> Read for Unpacker<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.chunk_pos < self.chunk.len() {
                let n = buf.len().min(self.chunk.len() - self.chunk_pos);
                buf[..n].copy_from_slice(&self.chunk[self.chunk_pos..self.chunk_pos + n]);
                self.chunk_pos += n;
                return Ok(n);
            }
            match self.status {
                DecodeStatus::Done => return Ok(0),
                DecodeStatus::Failed => {
                    return Err(RarError::new(
                        ErrorKind::DecompressionFault,
                        "decoder stopped after an earlier fault",
                    )
                    .into())
                }
                DecodeStatus::Init | DecodeStatus::Streaming => {}
            }
            if let Err(err) = self.next_chunk() {
                self.status = DecodeStatus::Failed;
                return Err(RarError::from(err).into());
            }
        }
    }
}

/// RAR5 window: the dictionary size, at least 256 KiB. Non-solid archives
/// never reference more than the entry itself, so small entries get a
/// window sized to them.
fn rar5_window_size(params: &UnpackParams) -> usize {
    let min = lzss::MIN_WINDOW_SIZE_50 as u64;
    let mut size = params.dict_size.max(min);
    if !params.solid_archive {
        if let Some(unpacked) = params.unpacked_size {
            let fit = unpacked.checked_next_power_of_two().unwrap_or(u64::MAX).max(min);
            size = size.min(fit);
        }
    }
    size.checked_next_power_of_two().unwrap_or(MAX_DICT_SIZE) as usize
}
