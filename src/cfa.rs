// Copyright (c) the RawDec Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::error::{Error, Result};

#[repr(u8)]
#[derive(Debug, FromPrimitive, Clone, Copy, PartialEq, Eq)]
pub enum CfaColor {
    Red = 0,
    Green = 1,
    Blue = 2,
    Green2 = 3,
    Cyan = 4,
    Magenta = 5,
    Yellow = 6,
    White = 7,
    Unknown = 255,
}

impl TryFrom<u32> for CfaColor {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Self::from_u32(value)
            .ok_or_else(|| Error::UsageError(format!("invalid CFA color code {value}")))
    }
}

/// The periodic color mask over the sensor. Indexed in the buffer's cropped
/// coordinate system; the pattern repeats modulo its size.
#[derive(Debug, Clone, Default)]
pub struct ColorFilterArray {
    size: (usize, usize),
    pattern: Vec<CfaColor>,
}

impl ColorFilterArray {
    pub fn new(size: (usize, usize), pattern: &[CfaColor]) -> Result<ColorFilterArray> {
        if size.0 == 0 || size.1 == 0 || pattern.len() != size.0 * size.1 {
            return Err(Error::UsageError(format!(
                "CFA pattern of {} colors does not fill {}x{}",
                pattern.len(),
                size.0,
                size.1
            )));
        }
        Ok(ColorFilterArray {
            size,
            pattern: pattern.to_vec(),
        })
    }

    /// The common Bayer RGGB layout.
    pub fn rggb() -> ColorFilterArray {
        use CfaColor::*;
        ColorFilterArray::new((2, 2), &[Red, Green, Green, Blue]).unwrap()
    }

    pub fn size(&self) -> (usize, usize) {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.pattern.is_empty()
    }

    pub fn color_at(&self, x: usize, y: usize) -> CfaColor {
        self.pattern[(y % self.size.1) * self.size.0 + (x % self.size.0)]
    }

    /// Rotates the pattern left by `n` columns, for crops whose left edge is
    /// not aligned with the pattern.
    pub fn shift_left(&mut self, n: usize) {
        if self.is_empty() {
            return;
        }
        let (w, h) = self.size;
        let old = self.pattern.clone();
        for y in 0..h {
            for x in 0..w {
                self.pattern[y * w + x] = old[y * w + (x + n) % w];
            }
        }
    }

    /// Rotates the pattern up by `n` rows.
    pub fn shift_down(&mut self, n: usize) {
        if self.is_empty() {
            return;
        }
        let (w, h) = self.size;
        let old = self.pattern.clone();
        for y in 0..h {
            self.pattern[y * w..(y + 1) * w].copy_from_slice(&old[((y + n) % h) * w..][..w]);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rggb_lookup_wraps() {
        let cfa = ColorFilterArray::rggb();
        assert_eq!(cfa.color_at(0, 0), CfaColor::Red);
        assert_eq!(cfa.color_at(1, 0), CfaColor::Green);
        assert_eq!(cfa.color_at(0, 1), CfaColor::Green);
        assert_eq!(cfa.color_at(1, 1), CfaColor::Blue);
        assert_eq!(cfa.color_at(2, 2), CfaColor::Red);
        assert_eq!(cfa.color_at(3, 2), CfaColor::Green);
    }

    #[test]
    fn shifts_rotate_pattern() {
        let mut cfa = ColorFilterArray::rggb();
        cfa.shift_left(1);
        assert_eq!(cfa.color_at(0, 0), CfaColor::Green);
        assert_eq!(cfa.color_at(1, 0), CfaColor::Red);
        cfa.shift_down(1);
        assert_eq!(cfa.color_at(0, 0), CfaColor::Blue);
    }

    #[test]
    fn bad_pattern_rejected() {
        assert!(ColorFilterArray::new((2, 2), &[CfaColor::Red]).is_err());
    }
}
