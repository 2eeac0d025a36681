//! PPMd variant H context model.
//!
//! Contexts and states live in the [`SubAllocator`] heap:
//!
//! | Record | Size | Fields |
//! |--------|------|--------|
//! | context | 12 | `num_stats: u16`, `summ_freq: u16`, `stats: u32`, `suffix: u32` |
//! | state | 6 | `symbol: u8`, `freq: u8`, `successor: u32` |
//!
//! A context with a single state stores it inline at offset 2, in place of
//! `summ_freq` and `stats`. Such binary contexts are coded with adaptive
//! bit probabilities; larger ones use frequencies plus secondary escape
//! estimation (SEE) once symbols are masked by an escape.

use std::io::Read;

use super::range_coder::RangeCoder;
use super::sub_alloc::{u2i, SubAllocator, UNIT_SIZE};
use crate::decompress::{BitReader, DecompressError, Result};

const MAX_O: usize = 64;
const MAX_FREQ: u32 = 124;
const INT_BITS: u32 = 7;
const PERIOD_BITS: u8 = 7;
const TOT_BITS: u32 = INT_BITS + PERIOD_BITS as u32;
const INTERVAL: u32 = 1 << INT_BITS;
const BIN_SCALE: u32 = 1 << TOT_BITS;

const STATE_SIZE: u32 = 6;

const INIT_BIN_ESC: [u16; 8] = [0x3CDD, 0x1F3F, 0x59BF, 0x48F3, 0x64A1, 0x5ABC, 0x6632, 0x6051];
const EXP_ESCAPE: [u8; 16] = [25, 14, 9, 7, 5, 5, 4, 4, 4, 3, 3, 3, 2, 2, 2, 2];

const NS2INDX: [u8; 256] = ns2indx();
const NS2BSINDX: [u8; 256] = ns2bsindx();

const fn ns2indx() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 3 {
        table[i] = i as u8;
        i += 1;
    }
    let mut m = 3;
    let mut k = 1;
    let mut step = 1;
    while i < 256 {
        table[i] = m;
        k -= 1;
        if k == 0 {
            step += 1;
            k = step;
            m += 1;
        }
        i += 1;
    }
    table
}

const fn ns2bsindx() -> [u8; 256] {
    let mut table = [6u8; 256];
    table[0] = 0;
    table[1] = 2;
    let mut i = 2;
    while i < 11 {
        table[i] = 4;
        i += 1;
    }
    table
}

#[inline]
fn hb2flag(symbol: u8) -> u32 {
    if symbol >= 0x40 {
        8
    } else {
        0
    }
}

#[inline]
fn get_mean(prob: u32) -> u32 {
    (prob + (1 << (PERIOD_BITS - 2))) >> PERIOD_BITS
}

#[derive(Debug, Clone, Copy)]
struct State {
    symbol: u8,
    freq: u8,
    successor: u32,
}

/// Secondary escape estimation cell.
#[derive(Debug, Clone, Copy, Default)]
struct See {
    summ: u16,
    shift: u8,
    count: u8,
}

impl See {
    fn new(init: u16) -> Self {
        Self {
            summ: init << (PERIOD_BITS - 4),
            shift: PERIOD_BITS - 4,
            count: 4,
        }
    }

    fn mean(&mut self) -> u32 {
        let r = self.summ >> self.shift;
        self.summ = self.summ.wrapping_sub(r);
        u32::from(r) + u32::from(r == 0)
    }

    fn update(&mut self) {
        if self.shift < PERIOD_BITS {
            self.count = self.count.wrapping_sub(1);
            if self.count == 0 {
                self.summ = self.summ.wrapping_add(self.summ);
                self.count = 3 << self.shift;
                self.shift += 1;
            }
        }
    }
}

/// Escape estimate of the current context: a SEE cell, or none for the
/// order-0 context with all 256 symbols.
type SeeRef = Option<(usize, usize)>;

pub struct PpmModel {
    alloc: SubAllocator,
    min_context: u32,
    max_context: u32,
    found_state: u32,
    order_fall: u32,
    init_esc: u32,
    prev_success: u32,
    max_order: u32,
    hi_bits_flag: u32,
    run_length: i32,
    init_rl: i32,
    bin_summ: [[u16; 64]; 128],
    see: [[See; 16]; 25],
}

impl Default for PpmModel {
    fn default() -> Self {
        Self::new()
    }
}

impl PpmModel {
    pub fn new() -> Self {
        Self {
            alloc: SubAllocator::default(),
            min_context: 0,
            max_context: 0,
            found_state: 0,
            order_fall: 0,
            init_esc: 0,
            prev_success: 0,
            max_order: 0,
            hi_bits_flag: 0,
            run_length: 0,
            init_rl: 0,
            bin_summ: [[0; 64]; 128],
            see: [[See::default(); 16]; 25],
        }
    }

    /// Whether a model exists that a block without reset can continue.
    pub fn is_started(&self) -> bool {
        self.alloc.is_started()
    }

    /// Start a fresh model of `max_order` with `memory` bytes of heap.
    pub fn start(&mut self, max_order: u32, memory: u32) {
        self.alloc.start(memory);
        self.max_order = max_order;
        self.restart();
    }

    /// Drop the model, so that only a block with reset can follow.
    pub fn stop(&mut self) {
        self.alloc.stop();
    }

    fn restart(&mut self) {
        self.alloc.init();
        self.order_fall = self.max_order;
        self.init_rl = -(self.max_order.min(12) as i32) - 1;
        self.run_length = self.init_rl;
        self.prev_success = 0;

        self.alloc.hi_unit -= UNIT_SIZE;
        let root = self.alloc.hi_unit;
        self.min_context = root;
        self.max_context = root;
        self.set_suffix(root, 0);
        self.set_num_stats(root, 256);
        self.set_summ_freq(root, 257);

        let stats = self.alloc.lo_unit;
        self.alloc.lo_unit += 256 / 2 * UNIT_SIZE;
        self.set_stats(root, stats);
        self.found_state = stats;
        for symbol in 0..=255u8 {
            let state = State {
                symbol,
                freq: 1,
                successor: 0,
            };
            self.set_state(stats + u32::from(symbol) * STATE_SIZE, state);
        }

        for (i, row) in self.bin_summ.iter_mut().enumerate() {
            for (k, &esc) in INIT_BIN_ESC.iter().enumerate() {
                let value = (BIN_SCALE - u32::from(esc) / (i as u32 + 2)) as u16;
                for m in (0..64).step_by(8) {
                    row[k + m] = value;
                }
            }
        }
        for (i, row) in self.see.iter_mut().enumerate() {
            *row = [See::new(5 * i as u16 + 10); 16];
        }
    }

    // Record access

    fn num_stats(&self, ctx: u32) -> u32 {
        u32::from(self.alloc.word(ctx))
    }

    fn set_num_stats(&mut self, ctx: u32, n: u32) {
        self.alloc.set_word(ctx, n as u16);
    }

    fn summ_freq(&self, ctx: u32) -> u32 {
        u32::from(self.alloc.word(ctx + 2))
    }

    fn set_summ_freq(&mut self, ctx: u32, n: u32) {
        self.alloc.set_word(ctx + 2, n as u16);
    }

    fn stats(&self, ctx: u32) -> u32 {
        self.alloc.dword(ctx + 4)
    }

    fn set_stats(&mut self, ctx: u32, stats: u32) {
        self.alloc.set_dword(ctx + 4, stats);
    }

    fn suffix(&self, ctx: u32) -> u32 {
        self.alloc.dword(ctx + 8)
    }

    fn set_suffix(&mut self, ctx: u32, suffix: u32) {
        self.alloc.set_dword(ctx + 8, suffix);
    }

    fn symbol(&self, s: u32) -> u8 {
        self.alloc.byte(s)
    }

    fn freq(&self, s: u32) -> u32 {
        u32::from(self.alloc.byte(s + 1))
    }

    fn set_freq(&mut self, s: u32, freq: u32) {
        self.alloc.set_byte(s + 1, freq as u8);
    }

    fn successor(&self, s: u32) -> u32 {
        self.alloc.dword(s + 2)
    }

    fn set_successor(&mut self, s: u32, successor: u32) {
        self.alloc.set_dword(s + 2, successor);
    }

    fn state(&self, s: u32) -> State {
        State {
            symbol: self.symbol(s),
            freq: self.alloc.byte(s + 1),
            successor: self.successor(s),
        }
    }

    fn set_state(&mut self, s: u32, state: State) {
        self.alloc.set_byte(s, state.symbol);
        self.alloc.set_byte(s + 1, state.freq);
        self.set_successor(s, state.successor);
    }

    fn swap_states(&mut self, a: u32, b: u32) {
        let sa = self.state(a);
        let sb = self.state(b);
        self.set_state(a, sb);
        self.set_state(b, sa);
    }

    /// The state of `symbol` in a context with more than one state.
    fn find_state(&self, ctx: u32, symbol: u8) -> Option<u32> {
        let stats = self.stats(ctx);
        (0..self.num_stats(ctx))
            .map(|i| stats + i * STATE_SIZE)
            .find(|&s| self.symbol(s) == symbol)
    }

    fn in_units(&self, at: u32, len: u32) -> bool {
        at > self.alloc.text && at.saturating_add(len) <= self.alloc.heap_end()
    }

    fn valid_context(&self, ctx: u32) -> bool {
        self.in_units(ctx, UNIT_SIZE)
            && (self.num_stats(ctx) == 1
                || self.in_units(self.stats(ctx), self.num_stats(ctx) * STATE_SIZE))
    }

    /// Decode one byte.
    pub fn decode_char<R: Read>(
        &mut self,
        rc: &mut RangeCoder,
        bits: &mut BitReader<R>,
    ) -> Result<u8> {
        if !self.valid_context(self.min_context) {
            return Err(DecompressError::InvalidPpmData);
        }
        let mut masked = [false; 256];
        let ctx = self.min_context;
        let num_stats = self.num_stats(ctx);

        if num_stats != 1 {
            let stats = self.stats(ctx);
            let summ = self.summ_freq(ctx);
            let count = rc.current_count(summ);
            let mut hi = self.freq(stats);
            if count < hi {
                rc.decode(0, hi, bits)?;
                self.found_state = stats;
                let symbol = self.symbol(stats);
                self.update1_0();
                return Ok(symbol);
            }
            self.prev_success = 0;
            for i in 1..num_stats {
                let s = stats + i * STATE_SIZE;
                let freq = self.freq(s);
                hi += freq;
                if hi > count {
                    rc.decode(hi - freq, freq, bits)?;
                    self.found_state = s;
                    let symbol = self.symbol(s);
                    self.update1();
                    return Ok(symbol);
                }
            }
            if count >= summ {
                return Err(DecompressError::InvalidPpmData);
            }
            self.hi_bits_flag = hb2flag(self.symbol(self.found_state));
            rc.decode(hi, summ - hi, bits)?;
            for i in 0..num_stats {
                masked[usize::from(self.symbol(stats + i * STATE_SIZE))] = true;
            }
        } else {
            let one = ctx + 2;
            let (row, col) = self.bin_summ_index();
            let prob = u32::from(self.bin_summ[row][col]);
            if rc.current_count(BIN_SCALE) < prob {
                rc.decode(0, prob, bits)?;
                self.bin_summ[row][col] = (prob + INTERVAL - get_mean(prob)) as u16;
                self.found_state = one;
                let symbol = self.symbol(one);
                self.update_bin();
                return Ok(symbol);
            }
            rc.decode(prob, BIN_SCALE - prob, bits)?;
            let prob = prob - get_mean(prob);
            self.bin_summ[row][col] = prob as u16;
            self.init_esc = u32::from(EXP_ESCAPE[(prob >> 10) as usize & 15]);
            masked[usize::from(self.symbol(one))] = true;
            self.prev_success = 0;
        }

        let mut hops = 0;
        let mut candidates = [0u32; 256];
        loop {
            let num_masked = self.num_stats(self.min_context);
            loop {
                self.order_fall += 1;
                hops += 1;
                let suffix = self.suffix(self.min_context);
                if suffix == 0 || hops > self.max_order + 1 || !self.valid_context(suffix) {
                    return Err(DecompressError::InvalidPpmData);
                }
                self.min_context = suffix;
                if self.num_stats(suffix) != num_masked {
                    break;
                }
            }

            let ctx = self.min_context;
            let stats = self.stats(ctx);
            let mut n = 0;
            let mut hi = 0;
            for i in 0..self.num_stats(ctx) {
                let s = stats + i * STATE_SIZE;
                if !masked[usize::from(self.symbol(s))] {
                    hi += self.freq(s);
                    candidates[n] = s;
                    n += 1;
                }
            }

            let (see, esc_freq) = self.make_esc_freq(num_masked);
            let freq_sum = hi + esc_freq;
            let count = rc.current_count(freq_sum);
            if count < hi {
                let mut acc = 0;
                for &s in &candidates[..n] {
                    let freq = self.freq(s);
                    acc += freq;
                    if acc > count {
                        rc.decode(acc - freq, freq, bits)?;
                        if let Some((row, col)) = see {
                            self.see[row][col].update();
                        }
                        self.found_state = s;
                        let symbol = self.symbol(s);
                        self.update2();
                        return Ok(symbol);
                    }
                }
                return Err(DecompressError::InvalidPpmData);
            }
            if count >= freq_sum {
                return Err(DecompressError::InvalidPpmData);
            }
            rc.decode(hi, freq_sum - hi, bits)?;
            if let Some((row, col)) = see {
                let cell = &mut self.see[row][col];
                cell.summ = cell.summ.wrapping_add(freq_sum as u16);
            }
            for &s in &candidates[..n] {
                masked[usize::from(self.symbol(s))] = true;
            }
        }
    }

    /// Probability cell of the binary context `min_context`.
    fn bin_summ_index(&mut self) -> (usize, usize) {
        let one = self.min_context + 2;
        let suffix_stats = self.num_stats(self.suffix(self.min_context));
        self.hi_bits_flag = hb2flag(self.symbol(self.found_state));
        let row = (self.freq(one) as usize).saturating_sub(1).min(127);
        let col = self.prev_success
            + u32::from(NS2BSINDX[(suffix_stats as usize).saturating_sub(1).min(255)])
            + self.hi_bits_flag
            + 2 * hb2flag(self.symbol(one))
            + ((self.run_length >> 26) as u32 & 0x20);
        (row, col as usize)
    }

    fn make_esc_freq(&mut self, num_masked: u32) -> (SeeRef, u32) {
        let ctx = self.min_context;
        let num_stats = self.num_stats(ctx);
        if num_stats == 256 {
            return (None, 1);
        }
        let non_masked = num_stats.saturating_sub(num_masked).max(1);
        let suffix_diff = i64::from(self.num_stats(self.suffix(ctx))) - i64::from(num_stats);
        let row = usize::from(NS2INDX[(non_masked - 1).min(255) as usize]);
        let col = usize::from(i64::from(non_masked) < suffix_diff)
            + 2 * usize::from(self.summ_freq(ctx) < 11 * num_stats)
            + 4 * usize::from(num_masked > non_masked)
            + self.hi_bits_flag as usize;
        let row = row.min(24);
        (Some((row, col)), self.see[row][col].mean())
    }

    fn update1_0(&mut self) {
        let ctx = self.min_context;
        let s = self.found_state;
        self.prev_success = u32::from(2 * self.freq(s) > self.summ_freq(ctx));
        self.run_length += self.prev_success as i32;
        self.set_summ_freq(ctx, self.summ_freq(ctx) + 4);
        let freq = self.freq(s) + 4;
        self.set_freq(s, freq);
        if freq > MAX_FREQ {
            self.rescale();
        }
        self.next_context();
    }

    fn update1(&mut self) {
        let ctx = self.min_context;
        let s = self.found_state;
        self.set_freq(s, self.freq(s) + 4);
        self.set_summ_freq(ctx, self.summ_freq(ctx) + 4);
        let prev = s - STATE_SIZE;
        if self.freq(s) > self.freq(prev) {
            self.swap_states(s, prev);
            self.found_state = prev;
            if self.freq(prev) > MAX_FREQ {
                self.rescale();
            }
        }
        self.next_context();
    }

    fn update2(&mut self) {
        let ctx = self.min_context;
        let s = self.found_state;
        let freq = self.freq(s) + 4;
        self.set_freq(s, freq);
        self.set_summ_freq(ctx, self.summ_freq(ctx) + 4);
        if freq > MAX_FREQ {
            self.rescale();
        }
        self.run_length = self.init_rl;
        self.update_model();
    }

    fn update_bin(&mut self) {
        let s = self.found_state;
        let freq = self.freq(s);
        self.set_freq(s, freq + u32::from(freq < 128));
        self.prev_success = 1;
        self.run_length += 1;
        self.next_context();
    }

    fn next_context(&mut self) {
        let successor = self.successor(self.found_state);
        if self.order_fall == 0 && successor > self.alloc.text {
            self.min_context = successor;
            self.max_context = successor;
        } else {
            self.update_model();
        }
    }

    /// Halve the frequencies of `min_context`, dropping states that reach
    /// zero. The found state moves to the front.
    fn rescale(&mut self) {
        let ctx = self.min_context;
        let num_stats = self.num_stats(ctx);
        let stats = self.stats(ctx);

        let found = self.state(self.found_state);
        let mut s = self.found_state;
        while s > stats {
            let prev = self.state(s - STATE_SIZE);
            self.set_state(s, prev);
            s -= STATE_SIZE;
        }
        self.set_state(stats, found);

        let mut esc_freq = self.summ_freq(ctx).wrapping_sub(u32::from(found.freq));
        let adder = u32::from(self.order_fall != 0);
        let first = (u32::from(found.freq) + 4 + adder) >> 1;
        self.set_freq(stats, first);
        let mut sum_freq = first;

        for i in 1..num_stats {
            let s = stats + i * STATE_SIZE;
            let freq = self.freq(s);
            esc_freq = esc_freq.wrapping_sub(freq);
            let freq = (freq + adder) >> 1;
            self.set_freq(s, freq);
            sum_freq += freq;
            if freq > self.freq(s - STATE_SIZE) {
                let moving = self.state(s);
                let mut at = s;
                loop {
                    let prev = self.state(at - STATE_SIZE);
                    self.set_state(at, prev);
                    at -= STATE_SIZE;
                    if at == stats || u32::from(moving.freq) <= self.freq(at - STATE_SIZE) {
                        break;
                    }
                }
                self.set_state(at, moving);
            }
        }

        let last = stats + (num_stats - 1) * STATE_SIZE;
        if self.freq(last) == 0 {
            let mut zeros = 0;
            let mut at = last;
            while at > stats && self.freq(at) == 0 {
                zeros += 1;
                at -= STATE_SIZE;
            }
            esc_freq = esc_freq.wrapping_add(zeros);
            let remaining = num_stats - zeros;
            self.set_num_stats(ctx, remaining);
            if remaining == 1 {
                let mut one = self.state(stats);
                loop {
                    one.freq -= one.freq >> 1;
                    esc_freq >>= 1;
                    if esc_freq <= 1 {
                        break;
                    }
                }
                self.alloc.insert_node(stats, u2i((num_stats + 1) >> 1));
                self.found_state = ctx + 2;
                self.set_state(ctx + 2, one);
                return;
            }
            let old_units = (num_stats + 1) >> 1;
            let new_units = (remaining + 1) >> 1;
            if old_units != new_units {
                let moved = self.alloc.shrink_units(stats, old_units, new_units);
                self.set_stats(ctx, moved);
            }
        }
        self.set_summ_freq(ctx, sum_freq.wrapping_add(esc_freq - (esc_freq >> 1)));
        self.found_state = self.stats(ctx);
    }

    /// Create the chain of contexts for the text that follows the found
    /// state, from the deepest suffix that already has one.
    fn create_successors(&mut self, skip: bool) -> Option<u32> {
        let found_symbol = self.symbol(self.found_state);
        let up_branch = self.successor(self.found_state);
        let mut chain = [0u32; MAX_O];
        let mut n = 0;
        if !skip {
            chain[n] = self.found_state;
            n += 1;
        }

        let mut ctx = self.min_context;
        while self.suffix(ctx) != 0 {
            ctx = self.suffix(ctx);
            let s = if self.num_stats(ctx) != 1 {
                self.find_state(ctx, found_symbol)?
            } else {
                ctx + 2
            };
            let successor = self.successor(s);
            if successor != up_branch {
                ctx = successor;
                if n == 0 {
                    return Some(ctx);
                }
                break;
            }
            if n == MAX_O {
                return None;
            }
            chain[n] = s;
            n += 1;
        }

        let up_symbol = self.alloc.byte(up_branch);
        let up_freq = if self.num_stats(ctx) == 1 {
            self.freq(ctx + 2)
        } else {
            let s = self.find_state(ctx, up_symbol)?;
            let cf = self.freq(s).saturating_sub(1);
            let s0 = self
                .summ_freq(ctx)
                .wrapping_sub(self.num_stats(ctx))
                .wrapping_sub(cf);
            1 + if 2 * cf <= s0 {
                u32::from(5 * cf > s0)
            } else {
                (2 * cf + 3 * s0 - 1) / (2 * s0).max(1)
            }
        };
        let up_state = State {
            symbol: up_symbol,
            freq: up_freq as u8,
            successor: up_branch + 1,
        };

        while n > 0 {
            let child = self.alloc.alloc_context()?;
            self.set_num_stats(child, 1);
            self.set_state(child + 2, up_state);
            self.set_suffix(child, ctx);
            n -= 1;
            self.set_successor(chain[n], child);
            ctx = child;
        }
        Some(ctx)
    }

    /// Add the found symbol to every context from `max_context` down to
    /// `min_context` and move to the successor context. Running out of
    /// memory restarts the model.
    fn update_model(&mut self) {
        if self.try_update_model().is_none() {
            self.restart();
        }
    }

    fn try_update_model(&mut self) -> Option<()> {
        let found = self.state(self.found_state);
        let found_freq = u32::from(found.freq);
        let mut found_successor = found.successor;
        let min_ctx = self.min_context;

        let suffix = self.suffix(min_ctx);
        if found_freq < MAX_FREQ / 4 && suffix != 0 {
            if self.num_stats(suffix) == 1 {
                let one = suffix + 2;
                if self.freq(one) < 32 {
                    self.set_freq(one, self.freq(one) + 1);
                }
            } else {
                let stats = self.stats(suffix);
                let mut s = stats;
                if self.symbol(s) != found.symbol {
                    s = self.find_state(suffix, found.symbol)?;
                    if self.freq(s) >= self.freq(s - STATE_SIZE) {
                        self.swap_states(s, s - STATE_SIZE);
                        s -= STATE_SIZE;
                    }
                }
                if self.freq(s) < MAX_FREQ - 9 {
                    self.set_freq(s, self.freq(s) + 2);
                    self.set_summ_freq(suffix, self.summ_freq(suffix) + 2);
                }
            }
        }

        if self.order_fall == 0 {
            let ctx = self.create_successors(true)?;
            self.min_context = ctx;
            self.max_context = ctx;
            self.set_successor(self.found_state, ctx);
            return Some(());
        }

        self.alloc.set_byte(self.alloc.text, found.symbol);
        self.alloc.text += 1;
        let mut successor = self.alloc.text;
        if self.alloc.text >= self.alloc.units_start {
            return None;
        }

        if found_successor != 0 {
            if found_successor <= successor {
                found_successor = self.create_successors(false)?;
            }
            self.order_fall -= 1;
            if self.order_fall == 0 {
                successor = found_successor;
                if self.max_context != self.min_context {
                    self.alloc.text -= 1;
                }
            }
        } else {
            self.set_successor(self.found_state, successor);
            found_successor = self.min_context;
        }

        let ns = self.num_stats(min_ctx);
        let s0 = self
            .summ_freq(min_ctx)
            .wrapping_sub(ns)
            .wrapping_sub(found_freq)
            .wrapping_add(1);

        let mut ctx = self.max_context;
        let mut depth = 0;
        while ctx != min_ctx {
            depth += 1;
            if depth > MAX_O || !self.in_units(ctx, UNIT_SIZE) {
                return None;
            }
            let ns1 = self.num_stats(ctx);
            if ns1 != 1 {
                if ns1 & 1 == 0 {
                    let moved = self.alloc.expand_units(self.stats(ctx), ns1 >> 1)?;
                    self.set_stats(ctx, moved);
                }
                let summ = self.summ_freq(ctx);
                let bump = u32::from(2 * ns1 < ns)
                    + 2 * u32::from(4 * ns1 <= ns && summ <= 8 * ns1);
                self.set_summ_freq(ctx, summ + bump);
            } else {
                let stats = self.alloc.alloc_units(0)?;
                let mut one = self.state(ctx + 2);
                one.freq = if u32::from(one.freq) < MAX_FREQ / 4 - 1 {
                    one.freq * 2
                } else {
                    (MAX_FREQ - 4) as u8
                };
                self.set_state(stats, one);
                self.set_stats(ctx, stats);
                self.set_summ_freq(ctx, u32::from(one.freq) + self.init_esc + u32::from(ns > 3));
            }

            let summ = self.summ_freq(ctx);
            let mut cf = 2 * found_freq * (summ + 6);
            let sf = s0.wrapping_add(summ);
            if cf < 6 * sf {
                cf = 1 + u32::from(cf > sf) + u32::from(cf >= 4 * sf);
                self.set_summ_freq(ctx, summ + 3);
            } else {
                cf = 4 + u32::from(cf >= 9 * sf) + u32::from(cf >= 12 * sf) + u32::from(cf >= 15 * sf);
                self.set_summ_freq(ctx, summ + cf);
            }
            let state = State {
                symbol: found.symbol,
                freq: cf as u8,
                successor,
            };
            self.set_state(self.stats(ctx) + ns1 * STATE_SIZE, state);
            self.set_num_stats(ctx, ns1 + 1);
            ctx = self.suffix(ctx);
        }
        self.max_context = found_successor;
        self.min_context = found_successor;
        Some(())
    }
}

/// Encoder side of [`PpmModel::decode_char`], used to build test streams.
#[cfg(test)]
impl PpmModel {
    pub(crate) fn encode_char(&mut self, rc: &mut super::range_coder::RangeEncoder, symbol: u8) {
        let mut masked = [false; 256];
        let ctx = self.min_context;
        let num_stats = self.num_stats(ctx);

        if num_stats != 1 {
            let stats = self.stats(ctx);
            let summ = self.summ_freq(ctx);
            if self.symbol(stats) == symbol {
                rc.encode(0, self.freq(stats), summ);
                self.found_state = stats;
                self.update1_0();
                return;
            }
            self.prev_success = 0;
            let mut low = self.freq(stats);
            for i in 1..num_stats {
                let s = stats + i * STATE_SIZE;
                if self.symbol(s) == symbol {
                    rc.encode(low, self.freq(s), summ);
                    self.found_state = s;
                    self.update1();
                    return;
                }
                low += self.freq(s);
            }
            self.hi_bits_flag = hb2flag(self.symbol(self.found_state));
            rc.encode(low, summ - low, summ);
            for i in 0..num_stats {
                masked[usize::from(self.symbol(stats + i * STATE_SIZE))] = true;
            }
        } else {
            let one = ctx + 2;
            let (row, col) = self.bin_summ_index();
            let prob = u32::from(self.bin_summ[row][col]);
            if self.symbol(one) == symbol {
                rc.encode(0, prob, BIN_SCALE);
                self.bin_summ[row][col] = (prob + INTERVAL - get_mean(prob)) as u16;
                self.found_state = one;
                self.update_bin();
                return;
            }
            rc.encode(prob, BIN_SCALE - prob, BIN_SCALE);
            let prob = prob - get_mean(prob);
            self.bin_summ[row][col] = prob as u16;
            self.init_esc = u32::from(EXP_ESCAPE[(prob >> 10) as usize & 15]);
            masked[usize::from(self.symbol(one))] = true;
            self.prev_success = 0;
        }

        loop {
            let num_masked = self.num_stats(self.min_context);
            loop {
                self.order_fall += 1;
                self.min_context = self.suffix(self.min_context);
                assert_ne!(self.min_context, 0, "symbol missing from the order-0 context");
                if self.num_stats(self.min_context) != num_masked {
                    break;
                }
            }
            let (see, esc_freq) = self.make_esc_freq(num_masked);
            let ctx = self.min_context;
            let stats = self.stats(ctx);
            let mut target = None;
            let mut total = 0;
            let mut low = 0;
            for i in 0..self.num_stats(ctx) {
                let s = stats + i * STATE_SIZE;
                let sym = self.symbol(s);
                if masked[usize::from(sym)] {
                    continue;
                }
                if sym == symbol {
                    target = Some(s);
                    low = total;
                }
                total += self.freq(s);
                masked[usize::from(sym)] = true;
            }
            if let Some(s) = target {
                rc.encode(low, self.freq(s), total + esc_freq);
                if let Some((row, col)) = see {
                    self.see[row][col].update();
                }
                self.found_state = s;
                self.update2();
                return;
            }
            rc.encode(total, esc_freq, total + esc_freq);
            if let Some((row, col)) = see {
                let cell = &mut self.see[row][col];
                cell.summ = cell.summ.wrapping_add((total + esc_freq) as u16);
            }
        }
    }
}
