//! Variable-length integer (vint) parsing for RAR5.
//!
//! Each byte contributes 7 data bits, least significant group first; the high
//! bit marks continuation. A u64 needs at most 10 bytes.

/// Read a vint from the start of `data`.
/// Returns the value and the number of bytes consumed.
#[inline]
pub fn read_vint(data: &[u8]) -> Option<(u64, usize)> {
    let mut result = 0u64;

    for (i, &byte) in data.iter().enumerate().take(10) {
        result |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((result, i + 1));
        }
    }

    None
}

/// Sequential field reader over a header body.
pub struct VintReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> VintReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    #[inline]
    pub fn read(&mut self) -> Option<u64> {
        let (value, consumed) = read_vint(self.data.get(self.offset..)?)?;
        self.offset += consumed;
        Some(value)
    }

    /// Read a vint that must fit in `usize`.
    #[inline]
    pub fn read_usize(&mut self) -> Option<usize> {
        usize::try_from(self.read()?).ok()
    }

    #[inline]
    pub fn read_bytes(&mut self, count: usize) -> Option<&'a [u8]> {
        let end = self.offset.checked_add(count)?;
        let slice = self.data.get(self.offset..end)?;
        self.offset = end;
        Some(slice)
    }

    #[inline]
    pub fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.read_bytes(N)?.try_into().ok()
    }

    #[inline]
    pub fn read_u8(&mut self) -> Option<u8> {
        self.read_bytes(1).map(|b| b[0])
    }

    #[inline]
    pub fn read_u16_le(&mut self) -> Option<u16> {
        self.read_array::<2>().map(u16::from_le_bytes)
    }

    #[inline]
    pub fn read_u32_le(&mut self) -> Option<u32> {
        self.read_array::<4>().map(u32::from_le_bytes)
    }

    #[inline]
    pub fn read_u64_le(&mut self) -> Option<u64> {
        self.read_array::<8>().map(u64::from_le_bytes)
    }

    pub fn position(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.offset.min(self.data.len())..]
    }
}
