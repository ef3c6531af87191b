// Copyright (c) the RawDec Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

use crate::error::{Error, Result};

pub const TABLE_SIZE: usize = 65536;

/// A monotonic u16 -> u16 lookup curve. With `dither` each entry also keeps
/// the delta to the next entry so sub-integer positions can be jittered when
/// the curve is applied in the decompressor fast path.
pub struct TableLookUp {
    pub dither: bool,
    // Plain: TABLE_SIZE entries. Dithered: (base, delta) pairs, interleaved.
    tables: Vec<u16>,
}

impl TableLookUp {
    pub fn new(values: &[u16], dither: bool) -> Result<TableLookUp> {
        if values.len() != TABLE_SIZE {
            return Err(Error::UsageError(format!(
                "lookup table has {} entries, expected {TABLE_SIZE}",
                values.len()
            )));
        }
        let tables = if dither {
            let mut t = Vec::new();
            t.try_reserve_exact(2 * TABLE_SIZE)?;
            for (i, &base) in values.iter().enumerate() {
                let next = values[(i + 1).min(TABLE_SIZE - 1)];
                t.push(base);
                t.push(next.saturating_sub(base));
            }
            t
        } else {
            let mut t = Vec::new();
            t.try_reserve_exact(TABLE_SIZE)?;
            t.extend_from_slice(values);
            t
        };
        Ok(TableLookUp { dither, tables })
    }

    pub fn lookup(&self, value: u16) -> u16 {
        let i = usize::from(value);
        if self.dither {
            self.tables[2 * i]
        } else {
            self.tables[i]
        }
    }

    /// Dithered lookup. `random` is the caller-held LCG state; the stream is
    /// deterministic for a given seed.
    pub fn lookup_dithered(&self, value: u16, random: &mut u32) -> u16 {
        if !self.dither {
            return self.lookup(value);
        }
        let i = usize::from(value);
        let base = u32::from(self.tables[2 * i]);
        let delta = u32::from(self.tables[2 * i + 1]);
        let r = *random;
        let pix = base + ((delta * (r & 2047) + 1024) >> 12);
        *random = 15700u32.wrapping_mul(r & 65535).wrapping_add(r >> 16);
        pix as u16
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ramp() -> Vec<u16> {
        (0..TABLE_SIZE as u32).map(|i| (i / 2) as u16).collect()
    }

    #[test]
    fn wrong_size_rejected() {
        assert!(TableLookUp::new(&[0u16; 16], false).is_err());
    }

    #[test]
    fn plain_lookup() {
        let t = TableLookUp::new(&ramp(), false).unwrap();
        assert_eq!(t.lookup(0), 0);
        assert_eq!(t.lookup(1001), 500);
        assert_eq!(t.lookup(65535), 32767);
    }

    #[test]
    fn dithered_lookup_is_deterministic() {
        let t = TableLookUp::new(&ramp(), true).unwrap();
        let mut r1 = 0x1234_5678u32;
        let mut r2 = 0x1234_5678u32;
        let a: Vec<u16> = (0..64).map(|i| t.lookup_dithered(i * 1000, &mut r1)).collect();
        let b: Vec<u16> = (0..64).map(|i| t.lookup_dithered(i * 1000, &mut r2)).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn dither_bounded_on_random_curves() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut values: Vec<u16> = Vec::with_capacity(TABLE_SIZE);
        let mut acc = 0u32;
        for _ in 0..TABLE_SIZE {
            acc = (acc + rng.gen_range(0..3)).min(65535);
            values.push(acc as u16);
        }
        let t = TableLookUp::new(&values, true).unwrap();
        let mut r = 7u32;
        for _ in 0..1000 {
            let v: u16 = rng.gen();
            let base = values[usize::from(v)];
            let next = values[(usize::from(v) + 1).min(TABLE_SIZE - 1)];
            let out = t.lookup_dithered(v, &mut r);
            assert!(out >= base && out <= next.max(base));
        }
    }

    #[test]
    fn dither_stays_within_one_step() {
        let t = TableLookUp::new(&ramp(), true).unwrap();
        let mut r = 1u32;
        for v in [0u16, 3, 999, 40000, 65535] {
            let jittered = t.lookup_dithered(v, &mut r);
            let base = v / 2;
            assert!(jittered >= base && u32::from(jittered) <= u32::from(base) + 1);
        }
    }
}
