// Copyright (c) the RawDec Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

use crate::error::{Error, Result};
use crate::util::tracing_wrappers::*;

use super::rect::Array2DRef;
use super::worker::{hardware_parallelism, run_banded_rows, RawImageWorkerTask};
use super::{Raster, RawImageData};

/// Read-only parameters of one scale pass, captured before the fan-out.
struct ScaleParams {
    black: [i64; 4],
    /// 16.16 fixed-point gain per CFA cell.
    scale: [i64; 4],
    crop_offset: (usize, usize),
    cpp: usize,
    is_cfa: bool,
    dither: bool,
}

/// Per-row dither seed. Seeding by row (not by band) keeps the output
/// independent of how rows are split across workers; runs of the same build
/// on the same input are bit-identical.
fn dither_seed(row: usize) -> u32 {
    (row as u32).wrapping_mul(0x9E37_79B9)
}

fn scale_row(p: &ScaleParams, y: usize, row: &mut [u16]) {
    let mut random = dither_seed(y);
    let row_parity = (y + p.crop_offset.1) & 1;
    for (x, px) in row.iter_mut().enumerate() {
        let cell = if p.is_cfa {
            2 * row_parity + ((x / p.cpp + p.crop_offset.0) & 1)
        } else {
            0
        };
        let diff = i64::from(*px) - p.black[cell];
        let rounding = if p.dither {
            let r = random;
            random = 15700u32.wrapping_mul(r & 65535).wrapping_add(r >> 16);
            i64::from(r & 0xFFFF)
        } else {
            0x8000
        };
        *px = ((diff * p.scale[cell] + rounding) >> 16).clamp(0, 65535) as u16;
    }
}

impl RawImageData {
    /// Derives per-CFA-cell black levels by averaging the masked areas.
    /// With no areas the preset scalar level is used for every cell.
    pub(super) fn calculate_black_areas(&mut self) -> Result<()> {
        let mut sums = [0u64; 4];
        let mut counts = [0u64; 4];
        {
            let view = self.u16_uncropped()?;
            let off = self.crop_offset;
            let dim = self.dim;
            for area in &self.black_areas {
                let (xs, xe, ys, ye) = if area.is_vertical {
                    (area.offset, area.offset + area.size, 0, dim.1)
                } else {
                    (0, dim.0, area.offset, area.offset + area.size)
                };
                if xe > dim.0 || ye > dim.1 {
                    return Err(Error::UsageError(format!(
                        "black area outside image {}x{}",
                        dim.0, dim.1
                    )));
                }
                for y in ys..ye {
                    for x in xs..xe {
                        let cell = 2 * (y & 1) + (x & 1);
                        sums[cell] +=
                            u64::from(view.get(off.1 + y, self.cpp * (off.0 + x)));
                        counts[cell] += 1;
                    }
                }
            }
        }
        let total: u64 = counts.iter().sum();
        if total == 0 {
            self.black_level_separate = [self.black_level.max(0); 4];
            return Ok(());
        }
        let overall = (sums.iter().sum::<u64>() / total) as i32;
        for cell in 0..4 {
            self.black_level_separate[cell] = if counts[cell] == 0 {
                overall
            } else {
                (sums[cell] / counts[cell]) as i32
            };
        }
        self.black_level = overall;
        debug!("derived black levels {:?}", self.black_level_separate);
        Ok(())
    }

    pub(super) fn scale_black_white_u16(&mut self) -> Result<()> {
        if self.black_level_separate.iter().any(|&b| b < 0) {
            self.calculate_black_areas()?;
        }
        for cell in 0..4 {
            if self.white_point <= self.black_level_separate[cell] {
                self.set_error(format!(
                    "white point {} not above black level {}, ignoring black level",
                    self.white_point, self.black_level_separate[cell]
                ));
                self.black_level_separate[cell] = 0;
            }
        }
        self.start_workers(RawImageWorkerTask::ScaleValues)
    }

    pub(super) fn scale_values_u16(&mut self) -> Result<()> {
        let rows = self.worker_rows(RawImageWorkerTask::ScaleValues);
        let rows_per_band = rows.div_ceil(hardware_parallelism());
        self.scale_values_u16_banded(rows_per_band)
    }

    pub(super) fn scale_values_u16_banded(&mut self, rows_per_band: usize) -> Result<()> {
        let mut black = [0i64; 4];
        let mut scale = [0i64; 4];
        for cell in 0..4 {
            black[cell] = i64::from(self.black_level_separate[cell].max(0));
            let range = i64::from(self.white_point) - black[cell];
            scale[cell] = (65535i64 << 16) / range.max(1);
        }
        let params = ScaleParams {
            black,
            scale,
            crop_offset: self.crop_offset,
            cpp: self.cpp,
            is_cfa: self.is_cfa,
            dither: self.dither_scale,
        };
        let rows = self.worker_rows(RawImageWorkerTask::ScaleValues);
        let width = self.cpp * self.uncropped_dim.0;
        let stride = self.pitch_samples();
        let RawImageData { raster, errors, .. } = self;
        let Some(Raster::U16(samples)) = raster.as_mut() else {
            return Err(Error::UsageError("buffer is not allocated".into()));
        };
        let failures = run_banded_rows(samples, stride, rows, rows_per_band, |first_row, band| {
            for (i, row) in band.chunks_mut(stride).enumerate() {
                scale_row(&params, first_row + i, &mut row[..width]);
            }
            Ok(())
        });
        for failure in failures {
            errors.set_error(failure);
        }
        Ok(())
    }

    /// Applies the installed curve to every stored sample. Skipped when no
    /// table is installed.
    pub(super) fn apply_lookup_u16(&mut self) -> Result<()> {
        let rows = self.worker_rows(RawImageWorkerTask::ApplyLookup);
        let rows_per_band = rows.div_ceil(hardware_parallelism());
        let width = self.cpp * self.uncropped_dim.0;
        let stride = self.pitch_samples();
        let RawImageData {
            raster,
            errors,
            table,
            ..
        } = self;
        let Some(table) = table.as_ref() else {
            return Ok(());
        };
        let Some(Raster::U16(samples)) = raster.as_mut() else {
            return Err(Error::UsageError("buffer is not allocated".into()));
        };
        let failures = run_banded_rows(samples, stride, rows, rows_per_band, |_, band| {
            for row in band.chunks_mut(stride) {
                for px in row[..width].iter_mut() {
                    *px = table.lookup(*px);
                }
            }
            Ok(())
        });
        for failure in failures {
            errors.set_error(failure);
        }
        Ok(())
    }

    /// Plans replacements for the bad pixels of rows `[start, end)`. Reads
    /// only pixels whose map bit is clear, so the later writes cannot feed
    /// back into the interpolation.
    pub(super) fn plan_bad_pixel_band_u16(
        &self,
        view: &Array2DRef<'_, u16>,
        start: usize,
        end: usize,
    ) -> Result<Vec<(usize, usize, usize, u16)>> {
        let Some((map, map_pitch)) = self.bad_pixel_map() else {
            return Ok(Vec::new());
        };
        let mut fixes = Vec::new();
        for y in start..end {
            let map_row = &map[y * map_pitch..][..map_pitch];
            for (byte_idx, &bits) in map_row.iter().enumerate() {
                if bits == 0 {
                    continue;
                }
                for bit in 0..8 {
                    if bits & (1 << bit) == 0 {
                        continue;
                    }
                    let x = byte_idx * 8 + bit;
                    if x >= self.uncropped_dim.0 {
                        break;
                    }
                    match self.interpolate_bad_pixel_u16(view, x, y) {
                        Some(values) => {
                            for (c, v) in values.into_iter().enumerate() {
                                fixes.push((x, y, c, v));
                            }
                        }
                        None => self.set_error(format!(
                            "bad pixel ({x}, {y}) has too few good neighbors"
                        )),
                    }
                }
            }
        }
        Ok(fixes)
    }

    /// Interpolated replacement for one bad pixel, or None when fewer than
    /// two good neighbors exist.
    fn interpolate_bad_pixel_u16(
        &self,
        view: &Array2DRef<'_, u16>,
        x: usize,
        y: usize,
    ) -> Option<Vec<u16>> {
        if self.is_cfa && self.cpp == 1 {
            // Nearest good same-color neighbors: the pattern repeats every
            // two pixels along both axes.
            let mut sum = 0u64;
            let mut found = 0u64;
            let mut probe = |px: usize, py: usize| {
                if !self.is_bad_pixel(px, py) {
                    sum += u64::from(view.get(py, px));
                    found += 1;
                    true
                } else {
                    false
                }
            };
            let (w, h) = self.uncropped_dim;
            let mut xx = x;
            while xx >= 2 {
                xx -= 2;
                if probe(xx, y) {
                    break;
                }
            }
            let mut xx = x + 2;
            while xx < w {
                if probe(xx, y) {
                    break;
                }
                xx += 2;
            }
            let mut yy = y;
            while yy >= 2 {
                yy -= 2;
                if probe(x, yy) {
                    break;
                }
            }
            let mut yy = y + 2;
            while yy < h {
                if probe(x, yy) {
                    break;
                }
                yy += 2;
            }
            if found < 2 {
                return None;
            }
            Some(vec![((sum + found / 2) / found) as u16])
        } else {
            let (w, h) = self.uncropped_dim;
            let mut neighbors = Vec::with_capacity(8);
            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nx = x as i64 + dx;
                    let ny = y as i64 + dy;
                    if nx < 0 || ny < 0 || nx >= w as i64 || ny >= h as i64 {
                        continue;
                    }
                    let (nx, ny) = (nx as usize, ny as usize);
                    if !self.is_bad_pixel(nx, ny) {
                        neighbors.push((nx, ny));
                    }
                }
            }
            if neighbors.len() < 2 {
                return None;
            }
            let mut values = Vec::with_capacity(self.cpp);
            for c in 0..self.cpp {
                let sum: u64 = neighbors
                    .iter()
                    .map(|&(nx, ny)| u64::from(view.get(ny, self.cpp * nx + c)))
                    .sum();
                values.push(((sum + neighbors.len() as u64 / 2) / neighbors.len() as u64) as u16);
            }
            Some(values)
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::{RawImage, RawImageType};
    use crate::metadata::BlackArea;

    fn image_with_rows(dim: (usize, usize), f: impl Fn(usize, usize) -> u16) -> RawImage {
        let raw = RawImage::create_sized(dim, RawImageType::U16, 1).unwrap();
        {
            let mut img = raw.write();
            let mut view = img.u16_uncropped_mut().unwrap();
            for y in 0..dim.1 {
                for x in 0..dim.0 {
                    view.set(y, x, f(x, y));
                }
            }
        }
        raw
    }

    #[test]
    fn scale_maps_black_to_zero_and_white_to_full() {
        let raw = image_with_rows((8, 4), |x, _| if x % 2 == 0 { 256 } else { 4096 });
        let mut img = raw.write();
        img.black_level = 256;
        img.black_level_separate = [256; 4];
        img.white_point = 4096;
        img.dither_scale = false;
        img.scale_black_white().unwrap();
        assert_eq!(img.pixel_u16(0, 0).unwrap(), 0);
        assert_eq!(img.pixel_u16(1, 0).unwrap(), 65535);
    }

    #[test]
    fn scale_clamps_below_black() {
        let raw = image_with_rows((4, 2), |_, _| 100);
        let mut img = raw.write();
        img.black_level = 200;
        img.black_level_separate = [200; 4];
        img.white_point = 4096;
        img.dither_scale = false;
        img.scale_black_white().unwrap();
        assert_eq!(img.pixel_u16(0, 0).unwrap(), 0);
    }

    #[test]
    fn black_derived_from_areas_per_cell() {
        // Left two columns are masked; even columns read 100, odd 200.
        let raw = image_with_rows((8, 4), |x, _| if x < 2 { [100, 200][x & 1] } else { 1000 });
        let mut img = raw.write();
        img.black_areas.push(BlackArea::new(0, 2, true));
        img.calculate_black_areas().unwrap();
        assert_eq!(img.black_level_separate, [100, 200, 100, 200]);
    }

    #[test]
    fn banded_scale_is_band_count_invariant() {
        let a = image_with_rows((16, 16), |x, y| (x * 37 + y * 101) as u16);
        let b = image_with_rows((16, 16), |x, y| (x * 37 + y * 101) as u16);
        for raw in [&a, &b] {
            let mut img = raw.write();
            img.black_level = 17;
            img.black_level_separate = [17; 4];
            img.white_point = 2000;
        }
        a.write().scale_values_u16_banded(1).unwrap();
        b.write().scale_values_u16_banded(16).unwrap();
        let (ia, ib) = (a.read(), b.read());
        for y in 0..16 {
            for x in 0..16 {
                assert_eq!(
                    ia.pixel_u16(x, y).unwrap(),
                    ib.pixel_u16(x, y).unwrap(),
                    "at {x},{y}"
                );
            }
        }
    }

    #[test]
    fn dithered_scale_is_deterministic_across_runs() {
        let make = || {
            let raw = image_with_rows((8, 8), |x, y| (x + 8 * y) as u16);
            let mut img = raw.write();
            img.black_level = 0;
            img.black_level_separate = [0; 4];
            img.white_point = 64;
            drop(img);
            raw.write().scale_black_white().unwrap();
            raw
        };
        let (a, b) = (make(), make());
        let (ia, ib) = (a.read(), b.read());
        for y in 0..8 {
            for x in 0..8 {
                assert_eq!(ia.pixel_u16(x, y).unwrap(), ib.pixel_u16(x, y).unwrap());
            }
        }
    }

    #[test]
    fn lookup_pass_applies_table_per_sample() {
        let raw = image_with_rows((4, 2), |x, y| (x + 4 * y) as u16);
        let mut img = raw.write();
        let curve: Vec<u16> = (0..65536u32).map(|v| (v * 2).min(65535) as u16).collect();
        img.set_table(&curve, false).unwrap();
        img.sixteen_bit_lookup().unwrap();
        assert_eq!(img.pixel_u16(3, 1).unwrap(), 14);
    }

    #[test]
    fn lookup_pass_without_table_is_skipped() {
        let raw = image_with_rows((4, 2), |_, _| 123);
        let mut img = raw.write();
        img.sixteen_bit_lookup().unwrap();
        assert_eq!(img.pixel_u16(0, 0).unwrap(), 123);
    }

    #[test]
    fn bad_pixel_is_interpolated_from_same_color_neighbors() {
        let raw = image_with_rows((8, 8), |x, _| if x % 2 == 0 { 400 } else { 800 });
        let mut img = raw.write();
        let mut view = img.u16_uncropped_mut().unwrap();
        view.set(4, 4, 9999);
        drop(view);
        img.mark_bad_pixel(4, 4);
        img.fix_bad_pixels().unwrap();
        // Same-color neighbors all read 400.
        assert_eq!(img.pixel_u16_uncropped(4, 4).unwrap(), 400);
        assert!(!img.error_log().has_errors());
    }

    #[test]
    fn bad_neighbors_are_skipped() {
        let raw = image_with_rows((8, 2), |_, _| 500);
        let mut img = raw.write();
        let mut view = img.u16_uncropped_mut().unwrap();
        view.set(0, 2, 0);
        view.set(0, 4, 0);
        drop(view);
        // (2,0) and (4,0) are both bad; fixing (4,0) must not read (2,0).
        img.mark_bad_pixel(2, 0);
        img.mark_bad_pixel(4, 0);
        img.fix_bad_pixels().unwrap();
        assert_eq!(img.pixel_u16_uncropped(4, 0).unwrap(), 500);
        assert_eq!(img.pixel_u16_uncropped(2, 0).unwrap(), 500);
    }

    #[test]
    fn isolated_bad_pixel_is_left_and_logged() {
        let raw = image_with_rows((1, 1), |_, _| 77);
        let mut img = raw.write();
        img.mark_bad_pixel(0, 0);
        img.fix_bad_pixels().unwrap();
        assert_eq!(img.pixel_u16_uncropped(0, 0).unwrap(), 77);
        assert!(img
            .error_log()
            .errors()
            .iter()
            .any(|e| e.contains("too few good neighbors")));
    }
}
