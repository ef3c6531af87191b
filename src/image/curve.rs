// Copyright (c) the RawDec Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

use crate::error::Result;

use super::RawImage;

/// Scoped installation of a tone curve for one decompression session.
///
/// On entry the curve goes in with dither so the decompressor fast path can
/// jitter sub-integer values; on every exit path the dithered table is
/// replaced: kept without dither when the caller wants uncorrected raw
/// values preserved for later application, cleared otherwise.
pub struct CurveGuard<'a> {
    raw: &'a RawImage,
    curve: &'a [u16],
    uncorrected_raw_values: bool,
}

impl<'a> CurveGuard<'a> {
    pub fn new(
        raw: &'a RawImage,
        curve: &'a [u16],
        uncorrected_raw_values: bool,
    ) -> Result<CurveGuard<'a>> {
        if !uncorrected_raw_values {
            raw.write().set_table(curve, true)?;
        }
        Ok(CurveGuard {
            raw,
            curve,
            uncorrected_raw_values,
        })
    }
}

impl Drop for CurveGuard<'_> {
    fn drop(&mut self) {
        let mut img = self.raw.write();
        if self.uncorrected_raw_values {
            if let Err(e) = img.set_table(self.curve, false) {
                img.set_error(format!("failed to keep tone curve: {e}"));
            }
        } else {
            img.set_table_none();
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::{RawImage, RawImageType};
    use super::*;

    fn curve() -> Vec<u16> {
        (0..65536u32).map(|v| v as u16).collect()
    }

    #[test]
    fn installs_dithered_and_clears() {
        let raw = RawImage::create_sized((2, 2), RawImageType::U16, 1).unwrap();
        let c = curve();
        {
            let guard = CurveGuard::new(&raw, &c, false).unwrap();
            assert!(raw.read().has_table());
            drop(guard);
        }
        assert!(!raw.read().has_table());
    }

    #[test]
    fn uncorrected_keeps_plain_table_for_later() {
        let raw = RawImage::create_sized((2, 2), RawImageType::U16, 1).unwrap();
        let c = curve();
        {
            let _guard = CurveGuard::new(&raw, &c, true).unwrap();
            // Nothing installed during the session.
            assert!(!raw.read().has_table());
        }
        assert!(raw.read().has_table());
    }

    #[test]
    fn releases_on_early_exit() {
        let raw = RawImage::create_sized((2, 2), RawImageType::U16, 1).unwrap();
        let c = curve();
        let attempt = || -> Result<()> {
            let _guard = CurveGuard::new(&raw, &c, false)?;
            Err(crate::error::Error::Unsupported("simulated failure"))
        };
        assert!(attempt().is_err());
        assert!(!raw.read().has_table());
    }
}
