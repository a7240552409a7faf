/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use bitvec::prelude::*;
use sha2::{Digest, Sha256};

/// Probabilistic membership filter in front of the authoritative lookups.
/// False positives possible, false negatives never.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: BitVec<u8, Lsb0>,
    k: usize,
    m: usize,
}

impl BloomFilter {
    /// Sizes the filter for `expected` elements at the target false
    /// positive rate: m = -n ln p / (ln 2)^2, k = (m / n) ln 2.
    pub fn with_estimates(expected: usize, fpr: f64) -> Self {
        let n = expected.max(1) as f64;
        let p = fpr.clamp(1e-9, 0.5);
        let m = (-(n * p.ln()) / (2f64.ln() * 2f64.ln())).ceil().max(8.0) as usize;
        let k = ((m as f64 / n) * 2f64.ln()).round().max(1.0) as usize;
        Self {
            bits: bitvec![u8, Lsb0; 0; m],
            k,
            m,
        }
    }

    fn positions(&self, item: &[u8]) -> impl Iterator<Item = usize> + '_ {
        // Double hashing over one SHA-256: h_i = h1 + i * h2 (mod m).
        let digest = Sha256::digest(item);
        let h1 = u64::from_le_bytes(digest[0..8].try_into().unwrap());
        let h2 = u64::from_le_bytes(digest[8..16].try_into().unwrap()) | 1;
        let m = self.m as u64;
        (0..self.k as u64).map(move |i| ((h1.wrapping_add(i.wrapping_mul(h2))) % m) as usize)
    }

    pub fn insert(&mut self, item: &str) {
        let positions: Vec<usize> = self.positions(item.as_bytes()).collect();
        for pos in positions {
            self.bits.set(pos, true);
        }
    }

    pub fn contains(&self, item: &str) -> bool {
        self.positions(item.as_bytes()).all(|pos| self.bits[pos])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_false_negatives() {
        let mut filter = BloomFilter::with_estimates(1000, 0.01);
        let dids: Vec<String> = (0..1000).map(|i| format!("plc:user{i:04}")).collect();
        for did in &dids {
            filter.insert(did);
        }
        for did in &dids {
            assert!(filter.contains(did), "false negative for {did}");
        }
    }

    #[test]
    fn false_positive_rate_is_bounded() {
        let mut filter = BloomFilter::with_estimates(1000, 0.01);
        for i in 0..1000 {
            filter.insert(&format!("plc:member{i}"));
        }
        let hits = (0..100_000)
            .filter(|i| filter.contains(&format!("plc:stranger{i}")))
            .count();
        let rate = hits as f64 / 100_000.0;
        assert!(rate < 0.02, "observed fpr {rate}");
    }

    #[test]
    fn zero_estimate_still_works() {
        let mut filter = BloomFilter::with_estimates(0, 0.01);
        assert!(!filter.contains("plc:anyone"));
        filter.insert("plc:anyone");
        assert!(filter.contains("plc:anyone"));
    }
}
