//! Rolling bloom filter for relay dedup
//!
//! Remembers roughly the last `items` insertions. Entries are tagged with a
//! 2-bit generation (1, 2, 3); when a generation fills up the next one
//! starts and every bit tagged with the generation being reused is wiped,
//! so an entry survives between one and a half and two generations.

use crate::crypto::{filter_seed, murmur3};

/// Generation-rotated probabilistic set
#[derive(Debug, Clone)]
pub struct RollingFilter {
    /// Pairs of 64-bit wings; bit `b` of pair `p` encodes a generation
    data: Vec<u64>,
    rounds: u32,
    limit: usize,
    entries: usize,
    generation: u8,
    tweak: u32,
}

impl RollingFilter {
    /// Create a filter for `items` elements at false-positive `rate`
    pub fn from_rate(items: usize, rate: f64) -> Self {
        Self::with_tweak(items, rate, rand::random())
    }

    pub(crate) fn with_tweak(items: usize, rate: f64, tweak: u32) -> Self {
        let log_rate = rate.ln();
        let rounds = ((log_rate / 0.5f64.ln()).round() as i64).clamp(1, 50) as u32;
        let limit = (items + 1) / 2;
        let max = limit * 3;
        let bits = (-(rounds as f64) * max as f64 / (1.0 - (log_rate / rounds as f64).exp()).ln())
            .ceil() as usize;
        let slots = ((bits + 63) / 64) * 2;

        Self {
            data: vec![0; slots.max(2)],
            rounds,
            limit: limit.max(1),
            entries: 0,
            generation: 1,
            tweak,
        }
    }

    /// Number of hash rounds
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// Insertions per generation
    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn generation(&self) -> u8 {
        self.generation
    }

    fn position(&self, data: &[u8], n: u32) -> (usize, u32) {
        let hash = murmur3(data, filter_seed(n, self.tweak));
        let bit = hash & 63;
        let pos = ((hash >> 6) as usize % self.data.len()) & !1;
        (pos, bit)
    }

    fn rotate(&mut self) {
        self.entries = 0;
        self.generation += 1;
        if self.generation == 4 {
            self.generation = 1;
        }

        let m1 = 0u64.wrapping_sub((self.generation & 1) as u64);
        let m2 = 0u64.wrapping_sub((self.generation >> 1) as u64);

        for pair in self.data.chunks_exact_mut(2) {
            let (p1, p2) = (pair[0], pair[1]);
            let mask = (p1 ^ m1) | (p2 ^ m2);
            pair[0] = p1 & mask;
            pair[1] = p2 & mask;
        }
    }

    pub fn add(&mut self, data: &[u8]) {
        if self.entries == self.limit {
            self.rotate();
        }
        self.entries += 1;

        let g1 = (self.generation & 1) as u64;
        let g2 = (self.generation >> 1) as u64;

        for n in 0..self.rounds {
            let (pos, bit) = self.position(data, n);
            self.data[pos] = (self.data[pos] & !(1 << bit)) | (g1 << bit);
            self.data[pos + 1] = (self.data[pos + 1] & !(1 << bit)) | (g2 << bit);
        }
    }

    pub fn test(&self, data: &[u8]) -> bool {
        (0..self.rounds).all(|n| {
            let (pos, bit) = self.position(data, n);
            ((self.data[pos] | self.data[pos + 1]) >> bit) & 1 == 1
        })
    }

    /// Add `data`, returning false if it was already present
    pub fn added(&mut self, data: &[u8]) -> bool {
        if self.test(data) {
            return false;
        }
        self.add(data);
        true
    }

    pub fn reset(&mut self) {
        self.data.iter_mut().for_each(|slot| *slot = 0);
        self.entries = 0;
        self.generation = 1;
    }
}
