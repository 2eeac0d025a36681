//! RAR5 filter implementation.
//!
//! RAR5 uses simplified filters compared to RAR4's VM-based system.
//! Only 4 filter types are supported: Delta, E8, E8E9, and ARM.

use tracing::trace;

/// Maximum filter block size (4MB). Longer blocks are ignored.
pub const MAX_FILTER_BLOCK_SIZE: usize = 0x400000;

/// Maximum number of pending filters.
pub const MAX_UNPACK_FILTERS: usize = 8192;

/// RAR5 filter types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    /// Delta filter - byte-wise diff per channel
    Delta { channels: usize },
    /// E8 filter - x86 CALL instruction preprocessing
    E8,
    /// E8E9 filter - x86 CALL/JMP preprocessing
    E8E9,
    /// ARM filter - ARM branch preprocessing
    Arm,
}

impl FilterType {
    /// Parse the 3-bit type code. Delta carries its channel count.
    pub fn from_code(code: u32, channels: usize) -> Option<Self> {
        match code {
            0 => Some(Self::Delta { channels }),
            1 => Some(Self::E8),
            2 => Some(Self::E8E9),
            3 => Some(Self::Arm),
            _ => None,
        }
    }

    /// Undo the filter on `data`, which started `file_offset` bytes into the
    /// entry's output.
    pub fn apply(self, mut data: Vec<u8>, file_offset: u64) -> Vec<u8> {
        trace!(filter = ?self, len = data.len(), file_offset, "applying filter");
        match self {
            Self::Delta { channels } => delta_decode(&data, channels),
            Self::E8 => {
                x86_calls(&mut data, file_offset as u32, false, true);
                data
            }
            Self::E8E9 => {
                x86_calls(&mut data, file_offset as u32, true, true);
                data
            }
            Self::Arm => {
                arm_branches(&mut data, file_offset as u32);
                data
            }
        }
    }
}

/// A pending filter, waiting for its block to be written out.
#[derive(Debug, Clone)]
pub struct UnpackFilter {
    pub filter_type: FilterType,
    /// Window position of the first filtered byte
    pub block_start: usize,
    pub block_length: usize,
    /// The block starts after the window wraps around
    pub next_window: bool,
    pub done: bool,
}

/// Convert absolute x86 CALL (and optionally JMP) targets back to relative
/// ones. RAR5 reduces offsets modulo 16 MiB; RAR 2.9 does not.
pub(crate) fn x86_calls(data: &mut [u8], file_offset: u32, include_e9: bool, wrap: bool) {
    const FILE_SIZE: u32 = 0x100_0000;

    let mut pos = 0usize;
    while pos + 4 < data.len() {
        let byte = data[pos];
        pos += 1;
        if byte != 0xe8 && !(include_e9 && byte == 0xe9) {
            continue;
        }

        let mut offset = (pos as u32).wrapping_add(file_offset);
        if wrap {
            offset %= FILE_SIZE;
        }
        let field = &mut data[pos..pos + 4];
        let addr = u32::from_le_bytes([field[0], field[1], field[2], field[3]]);
        if addr & 0x8000_0000 != 0 {
            if addr.wrapping_add(offset) & 0x8000_0000 == 0 {
                field.copy_from_slice(&addr.wrapping_add(FILE_SIZE).to_le_bytes());
            }
        } else if addr.wrapping_sub(FILE_SIZE) & 0x8000_0000 != 0 {
            field.copy_from_slice(&addr.wrapping_sub(offset).to_le_bytes());
        }
        pos += 4;
    }
}

/// Convert absolute ARM BL targets back to relative ones.
fn arm_branches(data: &mut [u8], file_offset: u32) {
    let mut pos = 0usize;
    while pos + 3 < data.len() {
        // BL with the "always" condition
        if data[pos + 3] == 0xeb {
            let offset = u32::from(data[pos])
                | u32::from(data[pos + 1]) << 8
                | u32::from(data[pos + 2]) << 16;
            let offset = offset.wrapping_sub(file_offset.wrapping_add(pos as u32) / 4);
            data[pos] = offset as u8;
            data[pos + 1] = (offset >> 8) as u8;
            data[pos + 2] = (offset >> 16) as u8;
        }
        pos += 4;
    }
}

/// Bytes of each channel are stored as one run of deltas; interleave them
/// back.
pub(crate) fn delta_decode(data: &[u8], channels: usize) -> Vec<u8> {
    let mut out = vec![0u8; data.len()];
    let mut src = data.iter();
    for channel in 0..channels {
        let mut prev = 0u8;
        for dest in (channel..data.len()).step_by(channels.max(1)) {
            let Some(&delta) = src.next() else {
                return out;
            };
            prev = prev.wrapping_sub(delta);
            out[dest] = prev;
        }
    }
    out
}
