//! HyperLogLog cardinality estimator, 16384 registers (2^14).

use bytes::Bytes;
use murmur3::murmur3_x64_128;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperLogLog {
    pub registers: [u8; Self::REGISTER_COUNT],
    pub alpha: f64,
}

impl Default for HyperLogLog {
    fn default() -> Self {
        Self::new()
    }
}

impl HyperLogLog {
    const MAGIC: &'static [u8] = b"CURIOHLL";
    const ENCODING_VERSION: u8 = 1;
    pub const REGISTER_COUNT: usize = 16384;

    pub fn new() -> Self {
        const M: f64 = 16384.0;
        Self {
            registers: [0; Self::REGISTER_COUNT],
            alpha: 0.7213 / (1.0 + 1.079 / M),
        }
    }

    /// Returns `true` if the item's register increased (i.e. the estimate changed).
    pub fn add(&mut self, item: &Bytes) -> bool {
        let hash = murmur3_x64_128(&mut Cursor::new(item), 0).expect("hashing a Bytes cursor cannot fail");
        let hash_high = (hash >> 64) as u64;

        let index = (hash_high >> 50) as usize;
        let remaining = hash_high << 14;
        let rho = (remaining.leading_zeros() + 1) as u8;

        let old_rho = self.registers[index];
        if rho > old_rho {
            self.registers[index] = rho;
            true
        } else {
            false
        }
    }

    pub fn merge(&mut self, other: &HyperLogLog) {
        for i in 0..Self::REGISTER_COUNT {
            self.registers[i] = self.registers[i].max(other.registers[i]);
        }
    }

    pub fn count(&self) -> u64 {
        const M: f64 = 16384.0;
        let mut sum = 0.0;
        for &register in &self.registers {
            sum += (2.0_f64).powi(-(register as i32));
        }
        let estimate = self.alpha * M * M / sum;

        if estimate <= 2.5 * M {
            let v = self.count_registers_with_value(0) as f64;
            if v > 0.0 {
                return (M * (M / v).ln()) as u64;
            }
        }

        const TWO_POW_64: f64 = 1.844_674_407_370_955_2e19;
        if estimate > (1.0 / 30.0) * TWO_POW_64 {
            return ((-TWO_POW_64) * (1.0 - estimate / TWO_POW_64).ln()) as u64;
        }

        estimate as u64
    }

    fn count_registers_with_value(&self, value: u8) -> u64 {
        self.registers.iter().filter(|&&r| r == value).count() as u64
    }

    /// Compact binary format for persistence and `_PFGET`/`_PFSTORE` transfer:
    /// magic (8 bytes) | version (1 byte) | registers (16384 bytes).
    pub fn serialize(&self) -> Bytes {
        let mut bytes = Vec::with_capacity(Self::MAGIC.len() + 1 + Self::REGISTER_COUNT);
        bytes.extend_from_slice(Self::MAGIC);
        bytes.push(Self::ENCODING_VERSION);
        bytes.extend_from_slice(&self.registers);
        Bytes::from(bytes)
    }

    pub fn deserialize(data: &Bytes) -> Option<Self> {
        if !data.starts_with(Self::MAGIC) {
            return None;
        }
        let header_len = Self::MAGIC.len() + 1;
        if data.len() != header_len + Self::REGISTER_COUNT {
            return None;
        }
        if data[Self::MAGIC.len()] != Self::ENCODING_VERSION {
            return None;
        }
        let mut hll = Self::new();
        hll.registers.copy_from_slice(&data[header_len..header_len + Self::REGISTER_COUNT]);
        Some(hll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_is_approximately_correct_for_distinct_items() {
        let mut hll = HyperLogLog::new();
        for i in 0..10_000 {
            hll.add(&Bytes::from(format!("item-{i}")));
        }
        let estimate = hll.count() as f64;
        let error = (estimate - 10_000.0).abs() / 10_000.0;
        assert!(error < 0.05, "estimate {estimate} too far from 10000");
    }

    #[test]
    fn merge_is_union_like() {
        let mut a = HyperLogLog::new();
        let mut b = HyperLogLog::new();
        for i in 0..500 {
            a.add(&Bytes::from(format!("a-{i}")));
        }
        for i in 0..500 {
            b.add(&Bytes::from(format!("b-{i}")));
        }
        a.merge(&b);
        let estimate = a.count() as f64;
        assert!((estimate - 1000.0).abs() / 1000.0 < 0.1);
    }

    #[test]
    fn serialize_round_trips() {
        let mut hll = HyperLogLog::new();
        hll.add(&Bytes::from_static(b"hello"));
        let bytes = hll.serialize();
        let back = HyperLogLog::deserialize(&bytes).unwrap();
        assert_eq!(hll, back);
    }
}
