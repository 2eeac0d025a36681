//! Huffman decoder for RAR compression.
//!
//! RAR uses canonical Huffman codes with up to 15-bit code lengths. Codes
//! are assigned in symbol order within each length. A quick lookup table
//! resolves short codes; longer codes are found by comparing the left
//! aligned 16-bit window against the first code of each length.

use super::{BitReader, DecompressError, Result};

/// Maximum code length in bits.
pub const MAX_CODE_LENGTH: usize = 15;

/// Quick lookup bits for the large literal/length tables.
const QUICK_BITS_MAIN: u32 = 10;
/// Quick lookup bits for every other table.
const QUICK_BITS_SMALL: u32 = 7;

/// Size of the bit-length precode table, both formats.
pub const PRECODE_SIZE: usize = 20;

/// Huffman decoding table.
pub struct HuffmanTable {
    size: usize,
    /// Left aligned upper limit of the codes of each length
    decode_len: [u32; 16],
    /// Index of the first symbol of each length in `decode_num`
    decode_pos: [u32; 16],
    /// Symbols sorted by code
    decode_num: Vec<u16>,
    quick_bits: u32,
    quick_len: Vec<u8>,
    quick_num: Vec<u16>,
}

impl HuffmanTable {
    /// Build a table from per-symbol code lengths (0 = unused).
    ///
    /// Incomplete codes are accepted; over-subscribed ones are not.
    pub fn new(lengths: &[u8]) -> Result<Self> {
        let size = lengths.len();
        let mut length_count = [0u32; 16];
        for &len in lengths {
            length_count[usize::from(len & 0x0f)] += 1;
        }
        length_count[0] = 0;

        let mut decode_len = [0u32; 16];
        let mut decode_pos = [0u32; 16];
        let mut upper_limit = 0u32;
        for i in 1..16 {
            upper_limit += length_count[i];
            let left_aligned = upper_limit << (16 - i);
            upper_limit *= 2;
            decode_len[i] = left_aligned;
            decode_pos[i] = decode_pos[i - 1] + length_count[i - 1];
        }
        if decode_len[MAX_CODE_LENGTH] > 0x10000 {
            return Err(DecompressError::InvalidHuffmanTable);
        }

        let mut decode_num = vec![0u16; size];
        let mut next_pos = decode_pos;
        for (symbol, &len) in lengths.iter().enumerate() {
            let len = usize::from(len & 0x0f);
            if len != 0 {
                decode_num[next_pos[len] as usize] = symbol as u16;
                next_pos[len] += 1;
            }
        }

        let quick_bits = if size > 256 {
            QUICK_BITS_MAIN
        } else {
            QUICK_BITS_SMALL
        };
        let quick_size = 1usize << quick_bits;
        let mut quick_len = vec![0u8; quick_size];
        let mut quick_num = vec![0u16; quick_size];
        let mut cur_len = 1usize;
        for code in 0..quick_size {
            let field = (code as u32) << (16 - quick_bits);
            while cur_len < decode_len.len() && field >= decode_len[cur_len] {
                cur_len += 1;
            }
            quick_len[code] = cur_len as u8;
            if cur_len < decode_pos.len() {
                let dist = (field - decode_len[cur_len - 1]) >> (16 - cur_len);
                let pos = (decode_pos[cur_len] + dist) as usize;
                if pos < size {
                    quick_num[code] = decode_num[pos];
                }
            }
        }

        Ok(Self {
            size,
            decode_len,
            decode_pos,
            decode_num,
            quick_bits,
            quick_len,
            quick_num,
        })
    }

    /// Decode a symbol from the bit reader.
    ///
    /// Bit patterns that belong to no code of an incomplete table decode as
    /// the first symbol.
    #[inline]
    pub fn decode<R>(&self, reader: &mut BitReader<R>) -> u16 {
        let field = reader.getbits() & 0xfffe;
        if field < self.decode_len[self.quick_bits as usize] {
            let code = (field >> (16 - self.quick_bits)) as usize;
            reader.addbits(u32::from(self.quick_len[code]));
            return self.quick_num[code];
        }

        let mut bits = MAX_CODE_LENGTH;
        for i in self.quick_bits as usize + 1..MAX_CODE_LENGTH {
            if field < self.decode_len[i] {
                bits = i;
                break;
            }
        }
        reader.addbits(bits as u32);

        let dist = (field - self.decode_len[bits - 1]) >> (16 - bits);
        let pos = (self.decode_pos[bits] + dist) as usize;
        if pos >= self.size {
            return self.decode_num.first().copied().unwrap_or(0);
        }
        self.decode_num[pos]
    }
}

/// Read the 20 four-bit precode lengths that start every table set.
/// A length of 15 is an escape: a following zero means a literal 15,
/// anything else a run of zeros.
pub fn read_precode<R: std::io::Read>(reader: &mut BitReader<R>) -> Result<HuffmanTable> {
    reader.fill()?;
    let mut lengths = [0u8; PRECODE_SIZE];
    let mut i = 0;
    while i < PRECODE_SIZE {
        let len = reader.read_bits(4) as u8;
        if len == 15 {
            let zeros = reader.read_bits(4) as usize;
            if zeros == 0 {
                lengths[i] = 15;
                i += 1;
            } else {
                i = (i + zeros + 2).min(PRECODE_SIZE);
            }
        } else {
            lengths[i] = len;
            i += 1;
        }
    }
    HuffmanTable::new(&lengths)
}

/// Decode `table.len()` code lengths through the precode. `delta` holds the
/// previous table for RAR 2.9 delta coding and is `None` for RAR5.
pub fn read_code_lengths<R: std::io::Read>(
    reader: &mut BitReader<R>,
    precode: &HuffmanTable,
    table: &mut [u8],
    delta: Option<&[u8]>,
) -> Result<()> {
    let size = table.len();
    let mut i = 0;
    while i < size {
        reader.fill()?;
        let number = precode.decode(reader);
        match number {
            0..=15 => {
                let base = delta.map_or(0, |old| old[i]);
                table[i] = (number as u8 + base) & 0x0f;
                i += 1;
            }
            16 | 17 => {
                let count = if number == 16 {
                    reader.read_bits(3) as usize + 3
                } else {
                    reader.read_bits(7) as usize + 11
                };
                if i == 0 {
                    return Err(DecompressError::InvalidHuffmanTable);
                }
                let prev = table[i - 1];
                let end = (i + count).min(size);
                table[i..end].fill(prev);
                i = end;
            }
            _ => {
                let count = if number == 18 {
                    reader.read_bits(3) as usize + 3
                } else {
                    reader.read_bits(7) as usize + 11
                };
                let end = (i + count).min(size);
                table[i..end].fill(0);
                i = end;
            }
        }
    }
    if reader.overrun() {
        return Err(DecompressError::UnexpectedEof);
    }
    Ok(())
}
