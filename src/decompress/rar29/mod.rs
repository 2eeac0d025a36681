//! RAR 2.9 (RAR3/RAR4) decompression.
//!
//! LZ blocks use four Huffman tables. Code lengths are transmitted as
//! deltas against the previous table set unless the block asks for a
//! reset. Main table symbols:
//!
//! | Symbol | Meaning |
//! |--------|---------|
//! | 0-255 | literal |
//! | 256 | end of block or end of file |
//! | 257 | filter program |
//! | 258 | repeat the last match |
//! | 259-262 | match with a recent distance |
//! | 263-270 | length 2 match with a short distance |
//! | 271-298 | match with a new distance |
//!
//! A block header with the top bit set starts a PPMd block instead. Its
//! flag byte carries the model order and whether the model restarts, and
//! may change the escape character. Decoded bytes are literals unless they
//! equal the escape character, in which case the next byte selects:
//!
//! | Byte | Meaning |
//! |------|---------|
//! | 0 | end of block, new tables follow |
//! | 2 | end of file |
//! | 3 | filter program |
//! | 4 | match: 3 distance bytes, 1 length byte |
//! | 5 | run of the last byte: 1 length byte |
//! | other | the escape character itself |

pub mod filters;

use std::io::Read;

use tracing::{debug, trace};

use super::huffman::{read_code_lengths, read_precode};
use super::lzss::WINDOW_SIZE_29;
use super::ppm::{PpmModel, RangeCoder};
use super::{BitReader, DecompressError, HuffmanTable, Result, Window};
use filters::{StandardFilter, MAX_FILTERS, VM_MEMSIZE};

/// Main table: literals, control symbols and length slots.
pub const NC: usize = 299;
/// Distance slots.
pub const DC: usize = 60;
/// Low distance bits, plus the repeat symbol.
pub const LDC: usize = 17;
/// Length slots of recent-distance matches.
pub const RC: usize = 28;
pub const HUFF_TABLE_SIZE: usize = NC + DC + LDC + RC;

/// Low distance symbol that repeats the previous low bits.
const LOW_DIST_REPEAT: usize = 16;
const LOW_DIST_REP_COUNT: u32 = 16;

/// Flush before the write position is closer than this to unflushed data.
/// Covers the longest PPMd match, 255 + 32 bytes.
const MAX_MATCH: usize = 0x120;

/// Escape character of PPMd blocks until a block header sets another.
const PPM_ESC_CHAR: u8 = 2;

pub const LDECODE: [u32; 28] = [
    0, 1, 2, 3, 4, 5, 6, 7, 8, 10, 12, 14, 16, 20, 24, 28, 32, 40, 48, 56, 64, 80, 96, 112,
    128, 160, 192, 224,
];
pub const LBITS: [u8; 28] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5,
];
pub const SD_DECODE: [u32; 8] = [0, 4, 8, 16, 32, 64, 128, 192];
pub const SD_BITS: [u8; 8] = [2, 2, 3, 4, 5, 6, 6, 6];

const DIST_TABLES: ([u32; DC], [u8; DC]) = dist_tables();
pub const DDECODE: [u32; DC] = DIST_TABLES.0;
pub const DBITS: [u8; DC] = DIST_TABLES.1;

/// Distance slots: four without extra bits, then two per bit count up to
/// 15, fourteen with 16 bits and twelve with 18 bits.
const fn dist_tables() -> ([u32; DC], [u8; DC]) {
    const SLOTS_PER_BITS: [usize; 19] = [4, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 14, 0, 12];
    let mut decode = [0u32; DC];
    let mut bits = [0u8; DC];
    let mut dist = 0u32;
    let mut slot = 0;
    let mut nbits = 0;
    while nbits < SLOTS_PER_BITS.len() {
        let mut n = 0;
        while n < SLOTS_PER_BITS[nbits] {
            decode[slot] = dist;
            bits[slot] = nbits as u8;
            dist += 1 << nbits;
            slot += 1;
            n += 1;
        }
        nbits += 1;
    }
    (decode, bits)
}

struct BlockTables {
    ld: HuffmanTable,
    dd: HuffmanTable,
    ldd: HuffmanTable,
    rd: HuffmanTable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Lz,
    Ppm,
}

/// A filter waiting for its block to be decoded.
#[derive(Debug, Clone, Copy)]
struct PendingFilter {
    kind: StandardFilter,
    block_start: usize,
    block_length: usize,
    /// The block starts after the window wraps around
    next_window: bool,
    regs: [u32; 7],
}

/// RAR 2.9 decoder state.
pub struct Rar29Decoder {
    window: Window,
    tables: Option<Box<BlockTables>>,
    /// Code lengths of the previous table set
    old_table: [u8; HUFF_TABLE_SIZE],
    /// Tables are valid for the next solid entry
    tables_read: bool,
    block: BlockKind,
    ppm: Box<PpmModel>,
    coder: RangeCoder,
    ppm_esc_char: u8,
    old_dist: [usize; 4],
    last_length: usize,
    prev_low_dist: usize,
    low_dist_rep_count: u32,

    /// Programs seen in this stream, by filter number
    programs: Vec<StandardFilter>,
    old_filter_lengths: Vec<usize>,
    last_filter: usize,
    stack: Vec<Option<PendingFilter>>,

    /// Window position of the first byte not yet flushed
    wr_ptr: usize,
    /// Bytes flushed for the current entry
    written: u64,
    /// Declared unpacked size of the current entry
    limit: Option<u64>,
    finished: bool,
}

impl Default for Rar29Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Rar29Decoder {
    pub fn new() -> Self {
        Self {
            window: Window::new(WINDOW_SIZE_29),
            tables: None,
            old_table: [0; HUFF_TABLE_SIZE],
            tables_read: false,
            block: BlockKind::Lz,
            ppm: Box::default(),
            coder: RangeCoder::default(),
            ppm_esc_char: PPM_ESC_CHAR,
            old_dist: [0; 4],
            last_length: 0,
            prev_low_dist: 0,
            low_dist_rep_count: 0,
            programs: Vec::new(),
            old_filter_lengths: Vec::new(),
            last_filter: 0,
            stack: Vec::new(),
            wr_ptr: 0,
            written: 0,
            limit: None,
            finished: false,
        }
    }

    /// Prepare for the next entry and read its tables if it brings any. A
    /// solid entry keeps the window, the history, the tables and the known
    /// filter programs. One that follows a PPMd block always starts with a
    /// block header, which may continue the previous model.
    pub fn start<R: Read>(&mut self, bits: &mut BitReader<R>, solid: bool) -> Result<()> {
        if !solid {
            self.window.reset();
            self.tables = None;
            self.old_table = [0; HUFF_TABLE_SIZE];
            self.tables_read = false;
            self.block = BlockKind::Lz;
            self.ppm_esc_char = PPM_ESC_CHAR;
            self.old_dist = [0; 4];
            self.last_length = 0;
            self.prev_low_dist = 0;
            self.low_dist_rep_count = 0;
            self.programs.clear();
            self.old_filter_lengths.clear();
            self.last_filter = 0;
        }
        self.stack.clear();
        self.wr_ptr = self.window.ptr();
        self.written = 0;
        self.limit = None;
        self.finished = false;

        if !self.tables_read || self.block == BlockKind::Ppm {
            self.read_tables(bits)?;
        }
        Ok(())
    }

    /// Stop decoding once `limit` bytes of the current entry are in the
    /// window. Only an end of block marker is still read past it.
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
            bits.fill()?;
            let ended = match self.block {
                BlockKind::Lz => bits.overrun() || bits.is_exhausted(),
                // The range coder runs up to four bytes ahead of the data
                BlockKind::Ppm => bits.bytes_past_end() > 4,
            };
            if ended {
                return self.finish(out);
            }

            let ptr = self.window.ptr();
            if self.wr_ptr.wrapping_sub(ptr) & self.window.mask() < MAX_MATCH
                && self.wr_ptr != ptr
            {
                self.write_buf(out)?;
                // At the limit the end marker may still follow
                if !out.is_empty() && !self.reached_limit() {
                    return Ok(false);
                }
            }

            let at_limit = self.reached_limit();
            if self.block == BlockKind::Ppm {
                if at_limit || self.decode_ppm(bits)? {
                    return self.finish(out);
                }
                continue;
            }
            let tables = self.tables.as_deref().ok_or(DecompressError::InvalidHuffmanTable)?;
            let number = usize::from(tables.ld.decode(bits));
            if bits.overrun() || (at_limit && number != 256) {
                return self.finish(out);
            }
            if number < 256 {
                self.window.put(number as u8);
                continue;
            }

            if number >= 271 {
                let slot = number - 271;
                let mut length = LDECODE[slot] as usize + 3;
                length += bits.read_bits(u32::from(LBITS[slot])) as usize;

                let dist_slot = usize::from(tables.dd.decode(bits));
                let mut distance = DDECODE[dist_slot] as usize + 1;
                let dbits = u32::from(DBITS[dist_slot]);
                if dist_slot > 9 {
                    if dbits > 4 {
                        distance += ((bits.getbits() >> (20 - dbits)) << 4) as usize;
                        bits.addbits(dbits - 4);
                    }
                    if self.low_dist_rep_count > 0 {
                        self.low_dist_rep_count -= 1;
                        distance += self.prev_low_dist;
                    } else {
                        let low = usize::from(tables.ldd.decode(bits));
                        if low == LOW_DIST_REPEAT {
                            self.low_dist_rep_count = LOW_DIST_REP_COUNT - 1;
                            distance += self.prev_low_dist;
                        } else {
                            distance += low;
                            self.prev_low_dist = low;
                        }
                    }
                } else {
                    distance += bits.read_bits(dbits) as usize;
                }

                if distance >= 0x2000 {
                    length += 1;
                    if distance >= 0x40000 {
                        length += 1;
                    }
                }
                self.insert_old_dist(distance);
                self.last_length = length;
                self.window.copy_match(distance, length)?;
                continue;
            }

            match number {
                256 => {
                    if self.read_end_of_block(bits)? {
                        return self.finish(out);
                    }
                }
                257 => self.read_vm_code(bits)?,
                258 => {
                    if self.last_length != 0 {
                        self.window.copy_match(self.old_dist[0], self.last_length)?;
                    }
                }
                259..=262 => {
                    let index = number - 259;
                    let distance = self.old_dist[index];
                    self.old_dist.copy_within(0..index, 1);
                    self.old_dist[0] = distance;

                    let slot = usize::from(tables.rd.decode(bits));
                    let length = LDECODE[slot] as usize
                        + 2
                        + bits.read_bits(u32::from(LBITS[slot])) as usize;
                    self.last_length = length;
                    self.window.copy_match(distance, length)?;
                }
                _ => {
                    let slot = number - 263;
                    let distance = SD_DECODE[slot] as usize
                        + 1
                        + bits.read_bits(u32::from(SD_BITS[slot])) as usize;
                    self.insert_old_dist(distance);
                    self.last_length = 2;
                    self.window.copy_match(distance, 2)?;
                }
            }
        }
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<bool> {
        self.write_buf(out)?;
        self.finished = true;
        trace!(written = self.written, "RAR 2.9 stream finished");
        Ok(true)
    }

    fn insert_old_dist(&mut self, distance: usize) {
        self.old_dist.copy_within(0..3, 1);
        self.old_dist[0] = distance;
    }

    /// Returns `true` when the entry's data ends here.
    fn read_end_of_block<R: Read>(&mut self, bits: &mut BitReader<R>) -> Result<bool> {
        let field = bits.getbits();
        let (new_table, new_file) = if field & 0x8000 != 0 {
            bits.addbits(1);
            (true, false)
        } else {
            bits.addbits(2);
            (field & 0x4000 != 0, true)
        };
        self.tables_read = !new_table;
        if new_file {
            return Ok(true);
        }
        self.read_tables(bits)?;
        Ok(false)
    }

    fn read_tables<R: Read>(&mut self, bits: &mut BitReader<R>) -> Result<()> {
        bits.fill()?;
        bits.align_to_byte();
        let field = bits.getbits();
        if field & 0x8000 != 0 {
            return self.read_ppm_header(bits);
        }
        self.block = BlockKind::Lz;
        if field & 0x4000 == 0 {
            self.old_table = [0; HUFF_TABLE_SIZE];
        }
        bits.addbits(2);
        self.prev_low_dist = 0;
        self.low_dist_rep_count = 0;

        let precode = read_precode(bits)?;
        let mut table = [0u8; HUFF_TABLE_SIZE];
        read_code_lengths(bits, &precode, &mut table, Some(&self.old_table))?;
        self.tables = Some(Box::new(BlockTables {
            ld: HuffmanTable::new(&table[..NC])?,
            dd: HuffmanTable::new(&table[NC..NC + DC])?,
            ldd: HuffmanTable::new(&table[NC + DC..NC + DC + LDC])?,
            rd: HuffmanTable::new(&table[NC + DC + LDC..])?,
        }));
        self.old_table = table;
        self.tables_read = true;
        debug!(keep_old = field & 0x4000 != 0, "RAR 2.9 tables");
        Ok(())
    }

    fn read_ppm_header<R: Read>(&mut self, bits: &mut BitReader<R>) -> Result<()> {
        let flags = bits.read_bits(8);
        let reset = flags & 0x20 != 0;
        let max_mb = if reset { bits.read_bits(8) } else { 0 };
        if flags & 0x40 != 0 {
            self.ppm_esc_char = bits.read_bits(8) as u8;
        }
        self.coder.init(bits)?;

        if reset {
            let mut order = (flags & 0x1f) + 1;
            if order > 16 {
                order = 16 + (order - 16) * 3;
            }
            if order == 1 {
                self.ppm.stop();
                return Err(DecompressError::InvalidPpmData);
            }
            let memory = (max_mb + 1) << 20;
            debug!(order, memory, esc = self.ppm_esc_char, "RAR 2.9 PPMd model");
            self.ppm.start(order, memory);
        } else if !self.ppm.is_started() {
            return Err(DecompressError::InvalidPpmData);
        }
        self.block = BlockKind::Ppm;
        Ok(())
    }

    fn ppm_char<R: Read>(&mut self, bits: &mut BitReader<R>) -> Result<u8> {
        self.ppm.decode_char(&mut self.coder, bits)
    }

    /// Decode one PPMd symbol or escape sequence. Returns `true` when the
    /// entry's data ends here.
    fn decode_ppm<R: Read>(&mut self, bits: &mut BitReader<R>) -> Result<bool> {
        let ch = self.ppm_char(bits)?;
        if ch != self.ppm_esc_char {
            self.window.put(ch);
            return Ok(false);
        }
        match self.ppm_char(bits)? {
            0 => self.read_tables(bits)?,
            2 => return Ok(true),
            3 => self.read_vm_code_ppm(bits)?,
            4 => {
                let mut distance = 0;
                for _ in 0..3 {
                    distance = (distance << 8) | usize::from(self.ppm_char(bits)?);
                }
                let length = usize::from(self.ppm_char(bits)?);
                self.window.copy_match(distance + 2, length + 32)?;
            }
            5 => {
                let length = usize::from(self.ppm_char(bits)?);
                self.window.copy_match(1, length + 4)?;
            }
            _ => self.window.put(ch),
        }
        Ok(false)
    }

    fn read_vm_code_ppm<R: Read>(&mut self, bits: &mut BitReader<R>) -> Result<()> {
        let first_byte = self.ppm_char(bits)?;
        let length = match (first_byte & 7) + 1 {
            7 => usize::from(self.ppm_char(bits)?) + 7,
            8 => {
                let high = usize::from(self.ppm_char(bits)?);
                (high << 8) | usize::from(self.ppm_char(bits)?)
            }
            n => usize::from(n),
        };
        if length == 0 {
            return Err(DecompressError::InvalidFilter);
        }
        let mut code = Vec::with_capacity(length);
        for _ in 0..length {
            code.push(self.ppm_char(bits)?);
        }
        self.add_vm_code(first_byte, &code)
    }

    fn read_vm_code<R: Read>(&mut self, bits: &mut BitReader<R>) -> Result<()> {
        bits.fill()?;
        let first_byte = bits.read_bits(8) as u8;
        let length = match (first_byte & 7) + 1 {
            7 => bits.read_bits(8) as usize + 7,
            8 => bits.read_bits(16) as usize,
            n => usize::from(n),
        };
        if length == 0 {
            return Err(DecompressError::InvalidFilter);
        }
        let mut code = Vec::with_capacity(length);
        for _ in 0..length {
            bits.fill()?;
            code.push(bits.read_bits(8) as u8);
        }
        if bits.overrun() {
            return Err(DecompressError::UnexpectedEof);
        }
        self.add_vm_code(first_byte, &code)
    }

    fn init_filters(&mut self) {
        self.programs.clear();
        self.old_filter_lengths.clear();
        self.last_filter = 0;
        self.stack.clear();
    }

    /// Queue a filter described by a symbol 257 record.
    fn add_vm_code(&mut self, first_byte: u8, code: &[u8]) -> Result<()> {
        let mut input = BitReader::new(code);
        input.fill()?;

        let filter_pos = if first_byte & 0x80 != 0 {
            match read_vm_number(&mut input) as usize {
                0 => {
                    self.init_filters();
                    0
                }
                n => n - 1,
            }
        } else {
            self.last_filter
        };
        if filter_pos > self.programs.len() || filter_pos > self.old_filter_lengths.len() {
            return Err(DecompressError::InvalidFilter);
        }
        self.last_filter = filter_pos;
        let new_filter = filter_pos == self.programs.len();
        if new_filter && filter_pos >= MAX_FILTERS {
            return Err(DecompressError::InvalidFilter);
        }

        self.stack.retain(Option::is_some);
        if self.stack.len() >= MAX_FILTERS {
            return Err(DecompressError::InvalidFilter);
        }

        let mut block_start = read_vm_number(&mut input) as usize;
        if first_byte & 0x40 != 0 {
            block_start += 258;
        }
        if new_filter {
            self.old_filter_lengths.push(0);
        }
        let block_length = if first_byte & 0x20 != 0 {
            let length = read_vm_number(&mut input) as usize;
            self.old_filter_lengths[filter_pos] = length;
            length
        } else {
            self.old_filter_lengths[filter_pos]
        };

        let ptr = self.window.ptr();
        let mask = self.window.mask();
        let next_window =
            self.wr_ptr != ptr && self.wr_ptr.wrapping_sub(ptr) & mask <= block_start;

        let mut regs = [0u32; 7];
        regs[4] = block_length as u32;
        if first_byte & 0x10 != 0 {
            let init_mask = input.read_bits(7);
            for (i, reg) in regs.iter_mut().enumerate() {
                if init_mask & (1 << i) != 0 {
                    *reg = read_vm_number(&mut input);
                }
            }
        }

        let kind = if new_filter {
            let code_size = read_vm_number(&mut input) as usize;
            let offset = (input.bit_position() / 8) as usize;
            if code_size == 0 || code_size >= 0x10000 || offset + code_size > code.len() {
                return Err(DecompressError::InvalidFilter);
            }
            let mut program = Vec::with_capacity(code_size);
            for _ in 0..code_size {
                input.fill()?;
                program.push(input.read_bits(8) as u8);
            }
            let kind = StandardFilter::identify(&program).ok_or(DecompressError::CustomFilter)?;
            self.programs.push(kind);
            kind
        } else {
            self.programs[filter_pos]
        };

        trace!(filter = ?kind, block_start, block_length, next_window, "queued filter");
        self.stack.push(Some(PendingFilter {
            kind,
            block_start: (block_start + ptr) & mask,
            block_length,
            next_window,
            regs,
        }));
        Ok(())
    }

    /// Flush decoded data up to the current position, running filters whose
    /// blocks are complete. Filters over the same block chain their output.
    fn write_buf(&mut self, out: &mut Vec<u8>) -> Result<()> {
        let mask = self.window.mask();
        let unp_ptr = self.window.ptr();
        let mut written_border = self.wr_ptr;
        let mut write_size = unp_ptr.wrapping_sub(written_border) & mask;

        let mut i = 0;
        while i < self.stack.len() {
            let Some(filter) = self.stack[i] else {
                i += 1;
                continue;
            };
            if filter.next_window {
                if let Some(pending) = self.stack[i].as_mut() {
                    pending.next_window = false;
                }
                i += 1;
                continue;
            }

            let block_start = filter.block_start;
            let block_length = filter.block_length;
            if block_start.wrapping_sub(written_border) & mask < write_size {
                if written_border != block_start {
                    self.emit(written_border, block_start, out);
                    written_border = block_start;
                    write_size = unp_ptr.wrapping_sub(written_border) & mask;
                }
                if block_length > write_size {
                    for pending in self.stack[i..].iter_mut().flatten() {
                        pending.next_window = false;
                    }
                    self.wr_ptr = written_border;
                    return Ok(());
                }
                if block_length > VM_MEMSIZE {
                    return Err(DecompressError::InvalidFilter);
                }

                let file_offset = self.written as u32;
                let block = self.window.read_block(block_start, block_length);
                let mut data = filter.kind.execute(block, &filter.regs, file_offset)?;
                self.stack[i] = None;
                while let Some(Some(next)) = self.stack.get(i + 1).copied() {
                    if next.block_start != block_start
                        || next.block_length != data.len()
                        || next.next_window
                    {
                        break;
                    }
                    data = next.kind.execute(data, &next.regs, file_offset)?;
                    i += 1;
                    self.stack[i] = None;
                }

                out.extend_from_slice(&data);
                self.written += data.len() as u64;
                written_border = (block_start + block_length) & mask;
                write_size = unp_ptr.wrapping_sub(written_border) & mask;
            }
            i += 1;
        }

        self.emit(written_border, unp_ptr, out);
        self.wr_ptr = unp_ptr;
        Ok(())
    }

    fn emit(&mut self, start: usize, end: usize, out: &mut Vec<u8>) {
        self.written += self.window.copy_area(start, end, out) as u64;
    }
}

/// Variable-length number inside filter records: a 2-bit selector picks
/// 4, 8, 16 or 32 bits. The 8-bit form with a zero high nibble encodes a
/// small negative number.
pub(crate) fn read_vm_number<R>(bits: &mut BitReader<R>) -> u32 {
    let data = bits.getbits();
    match data & 0xc000 {
        0 => {
            bits.addbits(6);
            (data >> 10) & 0xf
        }
        0x4000 => {
            if data & 0x3c00 == 0 {
                bits.addbits(14);
                0xffff_ff00 | ((data >> 2) & 0xff)
            } else {
                bits.addbits(10);
                (data >> 6) & 0xff
            }
        }
        0x8000 => {
            bits.addbits(2);
            let value = bits.getbits();
            bits.addbits(16);
            value
        }
        _ => {
            bits.addbits(2);
            let high = bits.getbits() << 16;
            bits.addbits(16);
            let low = bits.getbits();
            bits.addbits(16);
            high | low
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompress::tests::{
        encode_rar29, encode_rar29_ppm, encode_rar29_solid, BitWriter, Token,
    };

    fn run(decoder: &mut Rar29Decoder, packed: &[u8], solid: bool) -> Result<Vec<u8>> {
        let mut bits = BitReader::new(packed);
        bits.fill()?;
        decoder.start(&mut bits, solid)?;
        let mut out = Vec::new();
        while !decoder.decode_chunk(&mut bits, &mut out)? {}
        Ok(out)
    }

    fn decode(packed: &[u8]) -> Result<Vec<u8>> {
        run(&mut Rar29Decoder::new(), packed, false)
    }

    fn expand(out: &mut Vec<u8>, distance: usize, length: usize) {
        for _ in 0..length {
            let b = out[out.len() - distance];
            out.push(b);
        }
    }

    #[test]
    fn test_distance_tables() {
        assert_eq!(DDECODE[4], 4);
        assert_eq!(DBITS[4], 1);
        assert_eq!(DDECODE[34], 131072);
        assert_eq!(DBITS[34], 16);
        assert_eq!(DDECODE[48], 1048576);
        assert_eq!(DBITS[48], 18);
        assert_eq!(DDECODE[59] as usize + (1 << DBITS[59]), WINDOW_SIZE_29);
    }

    #[test]
    fn test_literals() {
        let packed = encode_rar29(&Token::literals(b"plain literals"));
        assert_eq!(decode(&packed).unwrap(), b"plain literals");
    }

    #[test]
    fn test_match_kinds() {
        let mut tokens = Token::literals(b"0123456789");
        tokens.push(Token::Match { length: 2, distance: 3 });
        tokens.push(Token::Match { length: 7, distance: 10 });
        tokens.push(Token::RepeatLast);
        tokens.push(Token::RepeatDistance { index: 1, length: 4 });
        let packed = encode_rar29(&tokens);

        let mut expected = b"0123456789".to_vec();
        expand(&mut expected, 3, 2);
        expand(&mut expected, 10, 7);
        expand(&mut expected, 10, 7);
        // History is [10, 3, ..]; index 1 brings back distance 3
        expand(&mut expected, 3, 4);
        assert_eq!(decode(&packed).unwrap(), expected);
    }

    #[test]
    fn test_far_distance_with_low_bits() {
        let mut data: Vec<u8> = (0..0x5000u32).map(|i| (i * 31 % 251) as u8).collect();
        let mut tokens = Token::literals(&data);
        tokens.push(Token::Match {
            length: 12,
            distance: 0x4321,
        });
        let packed = encode_rar29(&tokens);
        expand(&mut data, 0x4321, 12);
        assert_eq!(decode(&packed).unwrap(), data);
    }

    #[test]
    fn test_new_tables_mid_stream() {
        let mut tokens = Token::literals(b"before");
        tokens.push(Token::NewTables);
        tokens.extend(Token::literals(b" after"));
        tokens.push(Token::Match { length: 6, distance: 12 });
        let packed = encode_rar29(&tokens);
        assert_eq!(decode(&packed).unwrap(), b"before afterbefore");
    }

    #[test]
    fn test_solid_entry_reuses_tables_and_window() {
        let mut decoder = Rar29Decoder::new();
        let first = encode_rar29(&Token::literals(b"first entry"));
        assert_eq!(run(&mut decoder, &first, false).unwrap(), b"first entry");

        let second = encode_rar29_solid(&[Token::Match {
            length: 5,
            distance: 11,
        }]);
        assert_eq!(run(&mut decoder, &second, true).unwrap(), b"first");
    }

    #[test]
    fn test_switch_between_lz_and_ppm_blocks() {
        let mut ppm = Token::literals(b"ppm text with \x02 escape ");
        ppm.push(Token::Match { length: 6, distance: 1 });
        ppm.push(Token::Match { length: 40, distance: 30 });
        ppm.extend(Token::literals(b" done"));

        let mut tokens = Token::literals(b"lz literals ");
        tokens.push(Token::Ppm {
            order: Some(6),
            tokens: ppm,
        });
        tokens.extend(Token::literals(b"back in lz"));
        tokens.push(Token::Match { length: 9, distance: 60 });
        let packed = encode_rar29(&tokens);

        let mut expected = b"lz literals ppm text with \x02 escape ".to_vec();
        expand(&mut expected, 1, 6);
        expand(&mut expected, 30, 40);
        expected.extend_from_slice(b" doneback in lz");
        expand(&mut expected, 60, 9);
        assert_eq!(decode(&packed).unwrap(), expected);
    }

    #[test]
    fn test_ppm_block_without_reset_continues_model() {
        let mut tokens = Token::literals(b"one ");
        tokens.push(Token::Ppm {
            order: Some(4),
            tokens: Token::literals(b"abracadabra "),
        });
        tokens.extend(Token::literals(b"two "));
        tokens.push(Token::Ppm {
            order: None,
            tokens: Token::literals(b"abracadabra again"),
        });
        let packed = encode_rar29(&tokens);
        assert_eq!(
            decode(&packed).unwrap(),
            b"one abracadabra two abracadabra again"
        );
    }

    #[test]
    fn test_ppm_stream_ends_with_escape() {
        let text: Vec<u8> = b"the quick brown fox jumps over the lazy dog. "
            .iter()
            .copied()
            .cycle()
            .take(3000)
            .collect();
        let packed = encode_rar29_ppm(&mut None, Some(8), &Token::literals(&text));
        assert!(packed.len() < text.len() / 4);
        assert_eq!(decode(&packed).unwrap(), text);
    }

    #[test]
    fn test_ppm_block_without_model_is_an_error() {
        let err = decode(&[0x80, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, DecompressError::InvalidPpmData));
    }

    #[test]
    fn test_ppm_order_one_is_an_error() {
        let err = decode(&[0xa0, 0, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, DecompressError::InvalidPpmData));
    }

    #[test]
    fn test_solid_entry_continues_ppm_model() {
        let mut model = None;
        let mut decoder = Rar29Decoder::new();
        let first = encode_rar29_ppm(&mut model, Some(5), &Token::literals(b"first entry"));
        assert_eq!(run(&mut decoder, &first, false).unwrap(), b"first entry");

        let second = encode_rar29_ppm(
            &mut model,
            None,
            &[Token::Match {
                length: 32,
                distance: 11,
            }],
        );
        let mut expected = b"first entry".to_vec();
        expand(&mut expected, 11, 32);
        assert_eq!(run(&mut decoder, &second, true).unwrap(), &expected[11..]);
    }

    #[test]
    fn test_custom_vm_program_rejected() {
        let mut record = BitWriter::new();
        record.write(0, 2); // filter number 1, the first program
        record.write(1, 4);
        record.write(0, 2); // block start 0
        record.write(0, 4);
        record.write(0, 2); // block length 4
        record.write(4, 4);
        record.write(0, 2); // program size 3
        record.write(3, 4);
        for b in [0x01, 0x02, 0x03] {
            record.write(b, 8);
        }
        let payload = record.finish();
        assert_eq!(payload.len(), 6);
        // Filter number present, block length present, 6 record bytes
        let mut code = vec![0x80 | 0x20 | 5];
        code.extend_from_slice(&payload);

        let mut tokens = vec![Token::VmCode(code.clone())];
        tokens.extend(Token::literals(b"data"));
        let err = decode(&encode_rar29(&tokens)).unwrap_err();
        assert!(matches!(err, DecompressError::CustomFilter));

        // The same record escaped inside a PPMd block
        let mut tokens = vec![Token::VmCode(code)];
        tokens.extend(Token::literals(b"data"));
        let err = decode(&encode_rar29_ppm(&mut None, Some(4), &tokens)).unwrap_err();
        assert!(matches!(err, DecompressError::CustomFilter));
    }

    #[test]
    fn test_queued_filter_applies_on_flush() {
        let mut decoder = Rar29Decoder::new();
        let packed = encode_rar29(&Token::literals(&[0xfd, 0xfd, 0xfd, 0xfd, 9]));
        let mut bits = BitReader::new(packed.as_slice());
        bits.fill().unwrap();
        decoder.start(&mut bits, false).unwrap();
        let mut regs = [0u32; 7];
        regs[0] = 1;
        decoder.stack.push(Some(PendingFilter {
            kind: StandardFilter::Delta,
            block_start: 0,
            block_length: 4,
            next_window: false,
            regs,
        }));
        let mut out = Vec::new();
        while !decoder.decode_chunk(&mut bits, &mut out).unwrap() {}
        assert_eq!(out, [3, 6, 9, 12, 9]);
    }

    #[test]
    fn test_vm_numbers() {
        let mut w = BitWriter::new();
        w.write(0, 2);
        w.write(9, 4);
        w.write(1, 2);
        w.write(0xab, 8);
        w.write(1, 2);
        w.write(0, 4);
        w.write(0x7f, 8);
        w.write(2, 2);
        w.write(0x1234, 16);
        w.write(3, 2);
        w.write(0xdead, 16);
        w.write(0xbeef, 16);
        let data = w.finish();
        let mut bits = BitReader::new(data.as_slice());
        bits.fill().unwrap();
        assert_eq!(read_vm_number(&mut bits), 9);
        assert_eq!(read_vm_number(&mut bits), 0xab);
        assert_eq!(read_vm_number(&mut bits), 0xffff_ff7f);
        assert_eq!(read_vm_number(&mut bits), 0x1234);
        assert_eq!(read_vm_number(&mut bits), 0xdead_beef);
    }

    #[test]
    fn test_truncated_stream_ends_without_marker() {
        let packed = encode_rar29(&Token::literals(&[b'q'; 200]));
        let out = decode(&packed[..packed.len() - 60]).unwrap();
        assert!(out.len() < 200);
        assert!(out.iter().all(|&b| b == b'q'));
    }
}
