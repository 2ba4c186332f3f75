//! CRC-64 content signatures.
//!
//! The persistent repository keys methods by an 8-byte structural hash; the
//! hash has to be stable across runs and across hosts, so a fixed-polynomial
//! CRC (ECMA-182, reflected) is used rather than a process-seeded hasher.

use std::sync::OnceLock;

const POLY: u64 = 0xC96C_5795_D787_0F42;

fn table() -> &'static [u64; 256] {
    static TABLE: OnceLock<[u64; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut t = [0u64; 256];
        for (i, entry) in t.iter_mut().enumerate() {
            let mut crc = i as u64;
            for _ in 0..8 {
                crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
            }
            *entry = crc;
        }
        t
    })
}

/// Incremental CRC-64 digest.
pub struct Crc64 {
    state: u64,
}

impl Crc64 {
    pub fn new() -> Self {
        Self { state: !0 }
    }

    pub fn update(&mut self, data: &[u8]) {
        let t = table();
        for &b in data {
            let idx = ((self.state ^ b as u64) & 0xFF) as usize;
            self.state = (self.state >> 8) ^ t[idx];
        }
    }

    pub fn digest(&self) -> u64 {
        !self.state
    }
}

impl Default for Crc64 {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot convenience digest.
pub fn crc64(data: &[u8]) -> u64 {
    let mut c = Crc64::new();
    c.update(data);
    c.digest()
}
