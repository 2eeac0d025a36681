//! Memory of the PPMd model.
//!
//! One heap holds everything: the text area grows up from the bottom,
//! contexts are taken from the top, and state arrays come from the region
//! in between or from free lists of blocks of 1 to 128 twelve-byte units.
//! References are heap offsets; 0 is null.

/// Bytes per allocation unit.
pub const UNIT_SIZE: u32 = 12;

/// Number of free-list size classes.
pub const N_INDEXES: usize = 38;

/// Heap offset of the text area. Offsets below it are never handed out.
const ORIGIN: u32 = UNIT_SIZE;

/// Stamp of a free block while free blocks are merged.
const FREE_STAMP: u16 = 0xffff;

const UNIT_TABLES: ([u8; N_INDEXES], [u8; 128]) = unit_tables();

/// Units per size class: 1-4, then steps of 2, 3 and finally 4 up to 128.
const fn unit_tables() -> ([u8; N_INDEXES], [u8; 128]) {
    let mut indx2units = [0u8; N_INDEXES];
    let mut units2indx = [0u8; 128];
    let mut i = 0;
    let mut k = 0;
    while i < N_INDEXES {
        let mut step = if i >= 12 { 4 } else { (i >> 2) + 1 };
        while step > 0 {
            units2indx[k] = i as u8;
            k += 1;
            step -= 1;
        }
        indx2units[i] = k as u8;
        i += 1;
    }
    (indx2units, units2indx)
}

/// Units in size class `index`.
#[inline]
pub fn i2u(index: usize) -> u32 {
    u32::from(UNIT_TABLES.0[index.min(N_INDEXES - 1)])
}

/// Smallest size class holding `units` units.
#[inline]
pub fn u2i(units: u32) -> usize {
    usize::from(UNIT_TABLES.1[(units.max(1) as usize - 1).min(127)])
}

#[derive(Debug)]
pub struct SubAllocator {
    heap: Vec<u8>,
    /// Model memory in bytes, without the reserved head and tail units
    size: u32,
    /// Next free byte of the text area
    pub text: u32,
    pub units_start: u32,
    pub lo_unit: u32,
    pub hi_unit: u32,
    glue_count: u32,
    free_list: [u32; N_INDEXES],
}

impl Default for SubAllocator {
    fn default() -> Self {
        Self {
            heap: Vec::new(),
            size: 0,
            text: 0,
            units_start: 0,
            lo_unit: 0,
            hi_unit: 0,
            glue_count: 0,
            free_list: [0; N_INDEXES],
        }
    }
}

impl SubAllocator {
    /// Size the heap for `size` bytes of model memory. The heap is reused
    /// when the size is unchanged.
    pub fn start(&mut self, size: u32) {
        let len = (ORIGIN + size + UNIT_SIZE) as usize;
        if self.heap.len() != len {
            self.heap = vec![0; len];
        }
        self.size = size;
    }

    pub fn is_started(&self) -> bool {
        !self.heap.is_empty()
    }

    pub fn stop(&mut self) {
        self.heap = Vec::new();
        self.size = 0;
    }

    /// Release everything and lay out the empty heap.
    pub fn init(&mut self) {
        self.free_list = [0; N_INDEXES];
        self.text = ORIGIN;
        self.hi_unit = ORIGIN + self.size;
        self.units_start = self.hi_unit - self.size / 8 / UNIT_SIZE * 7 * UNIT_SIZE;
        self.lo_unit = self.units_start;
        self.glue_count = 0;
    }

    /// End of the unit area.
    #[inline]
    pub fn heap_end(&self) -> u32 {
        ORIGIN + self.size
    }

    // Heap access. Out-of-range reads yield zero and writes are dropped, so
    // a corrupt model produces garbage symbols rather than a panic.

    #[inline]
    pub fn byte(&self, at: u32) -> u8 {
        self.heap.get(at as usize).copied().unwrap_or(0)
    }

    #[inline]
    pub fn set_byte(&mut self, at: u32, value: u8) {
        if let Some(b) = self.heap.get_mut(at as usize) {
            *b = value;
        }
    }

    #[inline]
    pub fn word(&self, at: u32) -> u16 {
        u16::from_le_bytes([self.byte(at), self.byte(at.wrapping_add(1))])
    }

    #[inline]
    pub fn set_word(&mut self, at: u32, value: u16) {
        for (i, b) in value.to_le_bytes().into_iter().enumerate() {
            self.set_byte(at.wrapping_add(i as u32), b);
        }
    }

    #[inline]
    pub fn dword(&self, at: u32) -> u32 {
        let at = at as usize;
        match self.heap.get(at..at + 4) {
            Some(b) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            None => 0,
        }
    }

    #[inline]
    pub fn set_dword(&mut self, at: u32, value: u32) {
        let at = at as usize;
        if let Some(b) = self.heap.get_mut(at..at + 4) {
            b.copy_from_slice(&value.to_le_bytes());
        }
    }

    /// Copy `units` units from `src` to `dst`.
    pub fn copy_units(&mut self, dst: u32, src: u32, units: u32) {
        let len = (units * UNIT_SIZE) as usize;
        let (src, dst) = (src as usize, dst as usize);
        if src + len <= self.heap.len() && dst + len <= self.heap.len() {
            self.heap.copy_within(src..src + len, dst);
        }
    }

    pub fn insert_node(&mut self, node: u32, index: usize) {
        self.set_dword(node, self.free_list[index]);
        self.free_list[index] = node;
    }

    fn remove_node(&mut self, index: usize) -> u32 {
        let node = self.free_list[index];
        self.free_list[index] = self.dword(node);
        node
    }

    /// Return the tail of a block of class `old_index` beyond class
    /// `new_index` to the free lists.
    fn split_block(&mut self, block: u32, old_index: usize, new_index: usize) {
        let units = i2u(old_index) - i2u(new_index);
        let tail = block + i2u(new_index) * UNIT_SIZE;
        let mut index = u2i(units);
        if i2u(index) != units {
            index -= 1;
            let k = i2u(index);
            self.insert_node(tail + k * UNIT_SIZE, (units - k - 1) as usize);
        }
        self.insert_node(tail, index);
    }

    /// Merge adjacent free blocks and sort them back into the lists.
    fn glue_free_blocks(&mut self) {
        let max_blocks = self.heap.len() / UNIT_SIZE as usize;
        let mut blocks = Vec::new();
        for index in 0..N_INDEXES {
            while self.free_list[index] != 0 && blocks.len() < max_blocks {
                let node = self.remove_node(index);
                blocks.push((node, i2u(index)));
            }
        }
        // Most recently freed first
        blocks.reverse();

        if self.lo_unit != self.hi_unit {
            self.set_word(self.lo_unit, 0);
        }
        for (i, &(node, units)) in blocks.iter().enumerate() {
            self.set_word(node, FREE_STAMP);
            self.set_word(node + 2, units as u16);
            self.set_dword(node + 4, i as u32);
        }

        for i in 0..blocks.len() {
            let (node, mut units) = blocks[i];
            if units == 0 {
                continue;
            }
            loop {
                let next = node + units * UNIT_SIZE;
                if next >= self.heap_end() || self.word(next) != FREE_STAMP {
                    break;
                }
                let j = self.dword(next + 4) as usize;
                let Some(&(at, next_units)) = blocks.get(j) else { break };
                if at != next || next_units == 0 || units + next_units >= 0x10000 {
                    break;
                }
                blocks[j].1 = 0;
                self.set_word(next, 0);
                units += next_units;
            }
            blocks[i].1 = units;
        }

        for (mut node, mut units) in blocks {
            if units == 0 {
                continue;
            }
            while units > 128 {
                self.insert_node(node, N_INDEXES - 1);
                units -= 128;
                node += 128 * UNIT_SIZE;
            }
            let mut index = u2i(units);
            if i2u(index) != units {
                index -= 1;
                let k = i2u(index);
                self.insert_node(node + k * UNIT_SIZE, (units - k - 1) as usize);
            }
            self.insert_node(node, index);
        }
    }

    fn alloc_units_rare(&mut self, index: usize) -> Option<u32> {
        if self.glue_count == 0 {
            self.glue_count = 255;
            self.glue_free_blocks();
            if self.free_list[index] != 0 {
                return Some(self.remove_node(index));
            }
        }
        let Some(larger) = (index + 1..N_INDEXES).find(|&i| self.free_list[i] != 0) else {
            // Take the units from the top of the text area
            self.glue_count -= 1;
            let bytes = i2u(index) * UNIT_SIZE;
            if self.units_start - self.text > bytes {
                self.units_start -= bytes;
                return Some(self.units_start);
            }
            return None;
        };
        let block = self.remove_node(larger);
        self.split_block(block, larger, index);
        Some(block)
    }

    /// A block of size class `index`.
    pub fn alloc_units(&mut self, index: usize) -> Option<u32> {
        if self.free_list[index] != 0 {
            return Some(self.remove_node(index));
        }
        let bytes = i2u(index) * UNIT_SIZE;
        if bytes <= self.hi_unit - self.lo_unit {
            let block = self.lo_unit;
            self.lo_unit += bytes;
            return Some(block);
        }
        self.alloc_units_rare(index)
    }

    /// A single unit for a context.
    pub fn alloc_context(&mut self) -> Option<u32> {
        if self.hi_unit != self.lo_unit {
            self.hi_unit -= UNIT_SIZE;
            Some(self.hi_unit)
        } else if self.free_list[0] != 0 {
            Some(self.remove_node(0))
        } else {
            self.alloc_units_rare(0)
        }
    }

    /// Room for one more unit in a block of `units` units. The block moves
    /// when its size class changes.
    pub fn expand_units(&mut self, block: u32, units: u32) -> Option<u32> {
        let old_index = u2i(units);
        if old_index == u2i(units + 1) {
            return Some(block);
        }
        let moved = self.alloc_units(old_index + 1)?;
        self.copy_units(moved, block, units);
        self.insert_node(block, old_index);
        Some(moved)
    }

    /// Cut a block from `old_units` down to `new_units` units.
    pub fn shrink_units(&mut self, block: u32, old_units: u32, new_units: u32) -> u32 {
        let old_index = u2i(old_units);
        let new_index = u2i(new_units);
        if old_index == new_index {
            return block;
        }
        if self.free_list[new_index] != 0 {
            let moved = self.remove_node(new_index);
            self.copy_units(moved, block, new_units);
            self.insert_node(block, old_index);
            return moved;
        }
        self.split_block(block, old_index, new_index);
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(size: u32) -> SubAllocator {
        let mut alloc = SubAllocator::default();
        alloc.start(size);
        alloc.init();
        alloc
    }

    #[test]
    fn test_size_classes() {
        assert_eq!(i2u(0), 1);
        assert_eq!(i2u(3), 4);
        assert_eq!(i2u(4), 6);
        assert_eq!(i2u(11), 24);
        assert_eq!(i2u(12), 28);
        assert_eq!(i2u(N_INDEXES - 1), 128);
        assert_eq!(u2i(5), 4);
        assert_eq!(u2i(25), 12);
        for index in 0..N_INDEXES {
            assert_eq!(u2i(i2u(index)), index);
        }
    }

    #[test]
    fn test_layout() {
        let alloc = allocator(1 << 20);
        assert_eq!(alloc.heap_end() - alloc.units_start, (1 << 20) / 8 / 12 * 7 * 12);
        assert_eq!(alloc.lo_unit, alloc.units_start);
        assert_eq!(alloc.hi_unit, alloc.heap_end());
        assert!(alloc.text < alloc.units_start);
    }

    #[test]
    fn test_freed_blocks_are_reused() {
        let mut alloc = allocator(1 << 20);
        let a = alloc.alloc_units(2).unwrap();
        alloc.insert_node(a, 2);
        assert_eq!(alloc.alloc_units(2), Some(a));
        let c = alloc.alloc_context().unwrap();
        assert_eq!(c, alloc.heap_end() - UNIT_SIZE);
    }

    #[test]
    fn test_neighbouring_free_blocks_merge() {
        let mut alloc = allocator(1 << 16);
        // Use up the gap, then free two neighbours of 2 and 4 units
        let first = alloc.alloc_units(1).unwrap();
        let second = alloc.alloc_units(3).unwrap();
        assert_eq!(second, first + 2 * UNIT_SIZE);
        while alloc.hi_unit - alloc.lo_unit >= UNIT_SIZE {
            alloc.alloc_context().unwrap();
        }
        alloc.insert_node(first, 1);
        alloc.insert_node(second, 3);

        // No 6-unit block is listed, so the two are glued into one
        assert_eq!(alloc.alloc_units(4), Some(first));
        assert_eq!(alloc.free_list[1], 0);
        assert_eq!(alloc.free_list[3], 0);
    }

    #[test]
    fn test_shrink_returns_tail() {
        let mut alloc = allocator(1 << 20);
        let block = alloc.alloc_units(7).unwrap();
        assert_eq!(i2u(7), 12);
        assert_eq!(alloc.shrink_units(block, 12, 4), block);
        // Units 4-11 went back: class 5 holds 8 units
        assert_eq!(alloc.free_list[5], block + 4 * UNIT_SIZE);
    }

    #[test]
    fn test_exhausted_heap_borrows_from_text() {
        let mut alloc = allocator(1 << 16);
        while alloc.hi_unit != alloc.lo_unit {
            alloc.alloc_context().unwrap();
        }
        let start = alloc.units_start;
        assert_eq!(alloc.alloc_context(), Some(start - UNIT_SIZE));
        alloc.text = alloc.units_start - 4;
        assert_eq!(alloc.alloc_context(), None);
    }
}
