//! RAR 2.9 filters.
//!
//! RAR 2.9 ships filters as programs for a small virtual machine. Every
//! encoder in practice only emits six standard programs, so instead of
//! running bytecode the program is identified by its length and CRC32
//! and the matching transform runs natively.

use tracing::trace;

use crate::decompress::rar5::filter::{delta_decode, x86_calls};
use crate::decompress::{DecompressError, Result};
use crate::crc32::crc32;

/// Size of the virtual machine's memory. Filter blocks never exceed it.
pub const VM_MEMSIZE: usize = 0x40000;

/// Upper bound of known programs and of queued filters.
pub const MAX_FILTERS: usize = 8192;

/// Known filter programs: bytecode length, CRC32, transform.
const STANDARD_PROGRAMS: [(usize, u32, StandardFilter); 6] = [
    (53, 0xad57_6887, StandardFilter::E8),
    (57, 0x3cd7_e57e, StandardFilter::E8E9),
    (120, 0x3769_893f, StandardFilter::Itanium),
    (29, 0x0e06_077d, StandardFilter::Delta),
    (149, 0x1c2c_5dc8, StandardFilter::Rgb),
    (216, 0xbc85_e701, StandardFilter::Audio),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandardFilter {
    E8,
    E8E9,
    Itanium,
    Delta,
    Rgb,
    Audio,
}

impl StandardFilter {
    /// Identify a program from its bytecode. The first byte is an XOR
    /// checksum of the rest.
    pub fn identify(code: &[u8]) -> Option<Self> {
        let (&first, rest) = code.split_first()?;
        if rest.iter().fold(0u8, |acc, b| acc ^ b) != first {
            return None;
        }
        let crc = crc32(code);
        STANDARD_PROGRAMS
            .iter()
            .find(|(len, sum, _)| *len == code.len() && *sum == crc)
            .map(|&(_, _, filter)| filter)
    }

    /// Run the filter over one block. `regs` are the program's initial
    /// registers, `file_offset` is the number of bytes of the entry written
    /// before the block.
    pub fn execute(self, mut data: Vec<u8>, regs: &[u32; 7], file_offset: u32) -> Result<Vec<u8>> {
        if data.len() > VM_MEMSIZE {
            return Err(DecompressError::InvalidFilter);
        }
        trace!(filter = ?self, len = data.len(), file_offset, "running filter");
        match self {
            Self::E8 | Self::E8E9 => {
                if data.len() >= 4 {
                    x86_calls(&mut data, file_offset, self == Self::E8E9, false);
                }
                Ok(data)
            }
            Self::Itanium => {
                itanium(&mut data, file_offset);
                Ok(data)
            }
            Self::Delta => {
                let channels = regs[0] as usize;
                if data.len() > VM_MEMSIZE / 2 || channels == 0 || channels > 1024 {
                    return Err(DecompressError::InvalidFilter);
                }
                Ok(delta_decode(&data, channels))
            }
            Self::Rgb => rgb(&data, regs[0], regs[1]),
            Self::Audio => audio(&data, regs[0]),
        }
    }
}

fn itanium(data: &mut [u8], file_offset: u32) {
    const MASKS: [u8; 16] = [4, 4, 6, 6, 0, 0, 7, 7, 4, 4, 0, 0, 4, 4, 0, 0];

    let mut bundle = file_offset >> 4;
    let mut pos = 0usize;
    while pos + 21 < data.len() {
        let template = i32::from(data[pos] & 0x1f) - 0x10;
        if template >= 0 {
            let mask = MASKS[template as usize];
            let block = &mut data[pos..];
            for slot in 0..3 {
                if mask & (1 << slot) == 0 {
                    continue;
                }
                let start = slot * 41 + 5;
                if get_bits(block, start + 37, 4) == 5 {
                    let target = get_bits(block, start + 13, 20);
                    set_bits(block, target.wrapping_sub(bundle) & 0xfffff, start + 13, 20);
                }
            }
        }
        pos += 16;
        bundle = bundle.wrapping_add(1);
    }
}

fn get_bits(data: &[u8], bit_pos: usize, count: u32) -> u32 {
    let addr = bit_pos / 8;
    let field = u32::from_le_bytes([data[addr], data[addr + 1], data[addr + 2], data[addr + 3]]);
    (field >> (bit_pos & 7)) & (u32::MAX >> (32 - count))
}

fn set_bits(data: &mut [u8], value: u32, bit_pos: usize, count: u32) {
    let addr = bit_pos / 8;
    let shift = bit_pos & 7;
    let mut keep = !((u32::MAX >> (32 - count)) << shift);
    let mut value = value << shift;
    for byte in &mut data[addr..addr + 4] {
        *byte = (*byte & keep as u8) | value as u8;
        keep = (keep >> 8) | 0xff00_0000;
        value >>= 8;
    }
}

/// Each colour channel is predicted from its left, upper and upper-left
/// neighbours (Paeth), then green is added back to red and blue.
fn rgb(src: &[u8], width_reg: u32, pos_r: u32) -> Result<Vec<u8>> {
    let len = src.len();
    let width = width_reg.wrapping_sub(3) as usize;
    if len > VM_MEMSIZE / 2 || len < 3 || width > len || pos_r > 2 {
        return Err(DecompressError::InvalidFilter);
    }

    let mut dst = vec![0u8; len];
    let mut input = src.iter();
    for channel in 0..3 {
        let mut prev = 0i32;
        for i in (channel..len).step_by(3) {
            let predicted = if i >= width + 3 {
                let upper = i32::from(dst[i - width]);
                let upper_left = i32::from(dst[i - width - 3]);
                let predicted = prev + upper - upper_left;
                let pa = (predicted - prev).abs();
                let pb = (predicted - upper).abs();
                let pc = (predicted - upper_left).abs();
                if pa <= pb && pa <= pc {
                    prev
                } else if pb <= pc {
                    upper
                } else {
                    upper_left
                }
            } else {
                prev
            };
            let delta = input.next().copied().unwrap_or(0);
            let value = (predicted as u8).wrapping_sub(delta);
            dst[i] = value;
            prev = i32::from(value);
        }
    }

    let mut i = pos_r as usize;
    while i + 2 < len {
        let green = dst[i + 1];
        dst[i] = dst[i].wrapping_add(green);
        dst[i + 2] = dst[i + 2].wrapping_add(green);
        i += 3;
    }
    Ok(dst)
}

/// Adaptive linear predictor per channel. The weights are retuned every
/// 32 samples towards the variant with the smallest accumulated error.
fn audio(src: &[u8], channels: u32) -> Result<Vec<u8>> {
    let len = src.len();
    if len > VM_MEMSIZE / 2 || channels == 0 || channels > 128 {
        return Err(DecompressError::InvalidFilter);
    }
    let channels = channels as usize;

    let mut dst = vec![0u8; len];
    let mut input = src.iter();
    for channel in 0..channels {
        let mut prev_byte = 0u32;
        let mut prev_delta = 0i32;
        let mut dif = [0u32; 7];
        let (mut d1, mut d2, mut d3) = (0i32, 0i32, 0i32);
        let (mut k1, mut k2, mut k3) = (0i32, 0i32, 0i32);

        for (count, i) in (channel..len).step_by(channels).enumerate() {
            d3 = d2;
            d2 = prev_delta.wrapping_sub(d1);
            d1 = prev_delta;

            let predicted = (prev_byte.wrapping_mul(8) as i32)
                .wrapping_add(k1.wrapping_mul(d1))
                .wrapping_add(k2.wrapping_mul(d2))
                .wrapping_add(k3.wrapping_mul(d3));
            let predicted = (predicted as u32 >> 3) & 0xff;

            let cur = u32::from(input.next().copied().unwrap_or(0));
            let value = predicted.wrapping_sub(cur);
            dst[i] = value as u8;
            prev_delta = i32::from(value.wrapping_sub(prev_byte) as u8 as i8);
            prev_byte = value;

            let d = i32::from(cur as u8 as i8) << 3;
            let errors = [d, d - d1, d + d1, d - d2, d + d2, d - d3, d + d3];
            for (acc, e) in dif.iter_mut().zip(errors) {
                *acc = acc.wrapping_add(e.unsigned_abs());
            }

            if count & 0x1f == 0 {
                let mut best = 0;
                for j in 1..dif.len() {
                    if dif[j] < dif[best] {
                        best = j;
                    }
                }
                dif = [0; 7];
                match best {
                    1 if k1 >= -16 => k1 -= 1,
                    2 if k1 < 16 => k1 += 1,
                    3 if k2 >= -16 => k2 -= 1,
                    4 if k2 < 16 => k2 += 1,
                    5 if k3 >= -16 => k3 -= 1,
                    6 if k3 < 16 => k3 += 1,
                    _ => {}
                }
            }
        }
    }
    Ok(dst)
}
