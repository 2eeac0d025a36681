//! RAR5 decompression.
//!
//! The packed stream is a sequence of blocks. Each block starts on a byte
//! boundary with a small header:
//!
//! ```text
//! flags:    u8   bits 0-2: bits used in the last byte - 1
//!                bits 3-4: size field length - 1
//!                bit 6:    last block of the entry
//!                bit 7:    Huffman tables follow
//! checksum: u8   0x5A ^ flags ^ size bytes
//! size:     1-3 bytes, little endian
//! ```
//!
//! Symbols of the main table are literals (0-255), filters (256), a repeat
//! of the last match (257), matches with one of four recent distances
//! (258-261) or new matches (262+).

pub mod filter;

use std::io::Read;

use tracing::{debug, trace};

use super::huffman::{read_code_lengths, read_precode};
use super::{BitReader, DecompressError, HuffmanTable, Result, Window};
use filter::{FilterType, UnpackFilter, MAX_FILTER_BLOCK_SIZE, MAX_UNPACK_FILTERS};

/// Main table: literals, filter, repeats and length slots.
pub const NC: usize = 306;
/// Distance slots.
pub const DC: usize = 64;
/// Low distance bits.
pub const LDC: usize = 16;
/// Repeat length slots.
pub const RC: usize = 44;
pub const HUFF_TABLE_SIZE: usize = NC + DC + LDC + RC;

/// Longest single match plus slack; the window is flushed before less
/// than this much room remains.
const MAX_INC_LZ_MATCH: usize = 0x1001 + 3;

/// Upper bound of data flushed at once.
const UNPACK_MAX_WRITE: usize = 0x400000;

struct BlockTables {
    ld: HuffmanTable,
    dd: HuffmanTable,
    ldd: HuffmanTable,
    rd: HuffmanTable,
}

#[derive(Debug, Clone, Copy, Default)]
struct BlockHeader {
    /// Bit position where the block's data ends
    end_bits: u64,
    last: bool,
}

/// RAR5 decoder state.
pub struct Rar5Decoder {
    window: Window,
    tables: Option<Box<BlockTables>>,
    /// Recently used distances, most recent first
    old_dist: [usize; 4],
    last_length: usize,
    filters: Vec<UnpackFilter>,
    /// Window position of the first byte not yet flushed
    wr_ptr: usize,
    /// Flush once the window position gets close to this
    write_border: usize,
    block: BlockHeader,
    /// Bytes flushed for the current entry
    written: u64,
    /// Declared unpacked size of the current entry
    limit: Option<u64>,
    finished: bool,
}

impl Rar5Decoder {
    /// Create a decoder with a window of `window_size` bytes (a power of two).
    pub fn new(window_size: usize) -> Self {
        let mut decoder = Self {
            window: Window::new(window_size),
            tables: None,
            old_dist: [usize::MAX; 4],
            last_length: 0,
            filters: Vec::new(),
            wr_ptr: 0,
            write_border: 0,
            block: BlockHeader::default(),
            written: 0,
            limit: None,
            finished: false,
        };
        decoder.start(false);
        decoder
    }

    pub fn window_size(&self) -> usize {
        self.window.size()
    }

    /// Enlarge the window for a solid entry with a bigger dictionary.
    /// Call between entries, before [`start`](Self::start).
    pub fn grow_window(&mut self, size: usize) {
        self.window.grow(size);
    }

    /// Prepare for the next entry. A solid entry keeps the window, the
    /// distance history and the last Huffman tables.
    pub fn start(&mut self, solid: bool) {
        if !solid {
            self.window.reset();
            self.tables = None;
            self.old_dist = [usize::MAX; 4];
            self.last_length = 0;
        }
        let ptr = self.window.ptr();
        self.wr_ptr = ptr;
        self.write_border = (ptr + self.window.size().min(UNPACK_MAX_WRITE)) & self.window.mask();
        self.filters.clear();
        self.block = BlockHeader::default();
        self.written = 0;
        self.limit = None;
        self.finished = false;
    }

    /// Stop decoding once `limit` bytes of the current entry are in the
    /// window.
    pub fn set_output_limit(&mut self, limit: Option<u64>) {
        self.limit = limit;
    }

    fn reached_limit(&self) -> bool {
        let pending = self.window.ptr().wrapping_sub(self.wr_ptr) & self.window.mask();
        self.limit.is_some_and(|limit| self.written + pending as u64 >= limit)
    }

    /// Decode until some output was flushed to `out` or the entry ended.
    /// Returns `true` once the entry's stream is complete.
    pub fn decode_chunk<R: Read>(
        &mut self,
        bits: &mut BitReader<R>,
        out: &mut Vec<u8>,
    ) -> Result<bool> {
        if self.finished {
            return Ok(true);
        }
        loop {
            if self.reached_limit() {
                return self.finish(out);
            }
            bits.fill()?;
            while bits.bit_position() >= self.block.end_bits {
                if self.block.last || bits.is_exhausted() {
                    return self.finish(out);
                }
                self.read_block_header(bits)?;
                if bits.overrun() {
                    return self.finish(out);
                }
            }
            if bits.overrun() {
                return self.finish(out);
            }

            let ptr = self.window.ptr();
            let mask = self.window.mask();
            if self.write_border.wrapping_sub(ptr) & mask < MAX_INC_LZ_MATCH
                && self.write_border != ptr
            {
                self.write_buf(out);
                if !out.is_empty() {
                    return Ok(false);
                }
            }

            let tables = self.tables.as_deref().ok_or(DecompressError::InvalidHuffmanTable)?;
            let main_slot = usize::from(tables.ld.decode(bits));
            if bits.overrun() {
                return self.finish(out);
            }
            if main_slot < 256 {
                self.window.put(main_slot as u8);
                continue;
            }
            if main_slot >= 262 {
                let length = slot_to_length(bits, main_slot - 262);
                let dist_slot = usize::from(tables.dd.decode(bits));
                let mut distance = 1usize;
                let dbits;
                if dist_slot < 4 {
                    dbits = 0;
                    distance += dist_slot;
                } else {
                    dbits = (dist_slot / 2 - 1) as u32;
                    distance += (2 | (dist_slot & 1)) << dbits;
                }
                if dbits > 0 {
                    if dbits >= 4 {
                        if dbits > 4 {
                            distance += ((bits.getbits32() >> (36 - dbits)) << 4) as usize;
                            bits.addbits(dbits - 4);
                        }
                        distance += usize::from(tables.ldd.decode(bits));
                    } else {
                        distance += (bits.getbits32() >> (32 - dbits)) as usize;
                        bits.addbits(dbits);
                    }
                }
                let length = length + match_bonus(distance);
                self.insert_old_dist(distance);
                self.last_length = length;
                self.window.copy_match(distance, length)?;
                continue;
            }
            match main_slot {
                256 => {
                    let filter = read_filter(bits)?;
                    self.add_filter(filter, out);
                }
                257 => {
                    if self.last_length != 0 {
                        self.window.copy_match(self.old_dist[0], self.last_length)?;
                    }
                }
                _ => {
                    let index = main_slot - 258;
                    let distance = self.old_dist[index];
                    self.old_dist.copy_within(0..index, 1);
                    self.old_dist[0] = distance;
                    let length_slot = usize::from(tables.rd.decode(bits));
                    let length = slot_to_length(bits, length_slot);
                    self.last_length = length;
                    self.window.copy_match(distance, length)?;
                }
            }
        }
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<bool> {
        self.write_buf(out);
        self.finished = true;
        trace!(written = self.written, "RAR5 stream finished");
        Ok(true)
    }

    fn insert_old_dist(&mut self, distance: usize) {
        self.old_dist.copy_within(0..3, 1);
        self.old_dist[0] = distance;
    }

    fn read_block_header<R: Read>(&mut self, bits: &mut BitReader<R>) -> Result<()> {
        bits.fill()?;
        bits.align_to_byte();
        let flags = bits.read_bits(8) as u8;
        let byte_count = u32::from((flags >> 3) & 3) + 1;
        if byte_count == 4 {
            return Err(DecompressError::InvalidBlockHeader);
        }
        let saved_checksum = bits.read_bits(8) as u8;
        let mut size = 0u32;
        for i in 0..byte_count {
            size += bits.read_bits(8) << (i * 8);
        }
        let checksum = 0x5a ^ flags ^ size as u8 ^ (size >> 8) as u8 ^ (size >> 16) as u8;
        if checksum != saved_checksum {
            return Err(DecompressError::InvalidBlockHeader);
        }

        let start = bits.bit_position() / 8;
        let bit_size = u64::from(flags & 7) + 1;
        self.block = BlockHeader {
            end_bits: (start + u64::from(size)).saturating_sub(1) * 8 + bit_size,
            last: flags & 0x40 != 0,
        };
        debug!(
            size,
            last = self.block.last,
            tables = flags & 0x80 != 0,
            "RAR5 block"
        );
        if flags & 0x80 != 0 {
            self.read_tables(bits)?;
        }
        Ok(())
    }

    fn read_tables<R: Read>(&mut self, bits: &mut BitReader<R>) -> Result<()> {
        let precode = read_precode(bits)?;
        let mut table = [0u8; HUFF_TABLE_SIZE];
        read_code_lengths(bits, &precode, &mut table, None)?;
        self.tables = Some(Box::new(BlockTables {
            ld: HuffmanTable::new(&table[..NC])?,
            dd: HuffmanTable::new(&table[NC..NC + DC])?,
            ldd: HuffmanTable::new(&table[NC + DC..NC + DC + LDC])?,
            rd: HuffmanTable::new(&table[NC + DC + LDC..])?,
        }));
        Ok(())
    }

    fn add_filter(&mut self, mut filter: UnpackFilter, out: &mut Vec<u8>) {
        if self.filters.len() >= MAX_UNPACK_FILTERS {
            self.write_buf(out);
            if self.filters.len() >= MAX_UNPACK_FILTERS {
                self.filters.clear();
            }
        }
        let ptr = self.window.ptr();
        let mask = self.window.mask();
        filter.next_window =
            self.wr_ptr != ptr && self.wr_ptr.wrapping_sub(ptr) & mask <= filter.block_start;
        filter.block_start = (filter.block_start + ptr) & mask;
        self.filters.push(filter);
    }

    /// Flush decoded data up to the current position, applying filters
    /// whose blocks are complete. A filter block that is not complete yet
    /// holds back everything from its start.
    fn write_buf(&mut self, out: &mut Vec<u8>) {
        let mask = self.window.mask();
        let unp_ptr = self.window.ptr();
        let mut written_border = self.wr_ptr;
        let full_size = unp_ptr.wrapping_sub(written_border) & mask;
        let mut size_left = full_size;
        let mut blocked = false;

        let mut filters = std::mem::take(&mut self.filters);
        for i in 0..filters.len() {
            if filters[i].done {
                continue;
            }
            if filters[i].next_window {
                if filters[i].block_start.wrapping_sub(self.wr_ptr) & mask <= full_size {
                    filters[i].next_window = false;
                }
                continue;
            }
            let block_start = filters[i].block_start;
            let block_length = filters[i].block_length;
            if block_start.wrapping_sub(written_border) & mask >= size_left {
                continue;
            }
            if written_border != block_start {
                self.emit(written_border, block_start, out);
                written_border = block_start;
                size_left = unp_ptr.wrapping_sub(written_border) & mask;
            }
            if block_length <= size_left {
                if block_length > 0 {
                    let data = self.window.read_block(block_start, block_length);
                    let data = filters[i].filter_type.apply(data, self.written);
                    out.extend_from_slice(&data);
                    self.written += data.len() as u64;
                    written_border = (block_start + block_length) & mask;
                    size_left = unp_ptr.wrapping_sub(written_border) & mask;
                }
                filters[i].done = true;
            } else {
                self.wr_ptr = written_border;
                for pending in &mut filters[i..] {
                    pending.next_window = false;
                }
                blocked = true;
                break;
            }
        }
        filters.retain(|f| !f.done);
        self.filters = filters;

        if !blocked {
            self.emit(written_border, unp_ptr, out);
            self.wr_ptr = unp_ptr;
        }

        self.write_border = (unp_ptr + self.window.size().min(UNPACK_MAX_WRITE)) & mask;
        if self.write_border == unp_ptr
            || (self.wr_ptr != unp_ptr
                && self.wr_ptr.wrapping_sub(unp_ptr) & mask
                    < self.write_border.wrapping_sub(unp_ptr) & mask)
        {
            self.write_border = self.wr_ptr;
        }
    }

    fn emit(&mut self, start: usize, end: usize, out: &mut Vec<u8>) {
        self.written += self.window.copy_area(start, end, out) as u64;
    }
}

/// Length slots 0-7 are lengths 2-9; higher slots carry extra bits.
fn slot_to_length<R>(bits: &mut BitReader<R>, slot: usize) -> usize {
    if slot < 8 {
        return 2 + slot;
    }
    let lbits = (slot / 4 - 1) as u32;
    let mut length = 2 + ((4 | (slot & 3)) << lbits);
    length += (bits.getbits() >> (16 - lbits)) as usize;
    bits.addbits(lbits);
    length
}

/// Far matches are encoded with their length reduced.
fn match_bonus(distance: usize) -> usize {
    usize::from(distance > 0x100) + usize::from(distance > 0x2000) + usize::from(distance > 0x40000)
}

fn read_filter<R: Read>(bits: &mut BitReader<R>) -> Result<UnpackFilter> {
    bits.fill()?;
    let block_start = read_filter_data(bits);
    let mut block_length = read_filter_data(bits);
    if block_length > MAX_FILTER_BLOCK_SIZE {
        block_length = 0;
    }
    let code = bits.read_bits(3);
    let channels = if code == 0 {
        bits.read_bits(5) as usize + 1
    } else {
        0
    };
    let filter_type = FilterType::from_code(code, channels).ok_or(DecompressError::InvalidFilter)?;
    Ok(UnpackFilter {
        filter_type,
        block_start,
        block_length,
        next_window: false,
        done: false,
    })
}

/// 2-bit byte count, then that many bytes, least significant first.
fn read_filter_data<R>(bits: &mut BitReader<R>) -> usize {
    let byte_count = bits.read_bits(2) + 1;
    let mut data = 0usize;
    for i in 0..byte_count {
        data += (bits.read_bits(8) as usize) << (i * 8);
    }
    data
}
