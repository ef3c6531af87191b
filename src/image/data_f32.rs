// Copyright (c) the RawDec Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

use crate::error::{Error, Result};

use super::rect::Array2DRef;
use super::worker::{hardware_parallelism, run_banded_rows, RawImageWorkerTask};
use super::{Raster, RawImageData};

impl RawImageData {
    /// Floating-point buffers remap affinely into [0, 1]; there is no
    /// per-cell fixed-point machinery and no lookup path.
    pub(super) fn scale_black_white_f32(&mut self) -> Result<()> {
        if self.black_level < 0 && !self.black_areas.is_empty() {
            self.calculate_black_areas_f32()?;
        }
        if self.white_point <= self.black_level {
            self.set_error(format!(
                "white point {} not above black level {}, ignoring black level",
                self.white_point, self.black_level
            ));
            self.black_level = 0;
        }
        self.start_workers(RawImageWorkerTask::ScaleValues)
    }

    fn calculate_black_areas_f32(&mut self) -> Result<()> {
        let mut sum = 0f64;
        let mut count = 0u64;
        {
            let view = self.f32_uncropped()?;
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
                        sum += f64::from(view.get(off.1 + y, self.cpp * (off.0 + x)));
                        count += 1;
                    }
                }
            }
        }
        if count > 0 {
            self.black_level = (sum / count as f64) as i32;
        }
        Ok(())
    }

    pub(super) fn scale_values_f32(&mut self) -> Result<()> {
        let black = self.black_level.max(0) as f32;
        let range = (self.white_point - self.black_level.max(0)).max(1) as f32;
        let rows = self.worker_rows(RawImageWorkerTask::ScaleValues);
        let rows_per_band = rows.div_ceil(hardware_parallelism());
        let width = self.cpp * self.uncropped_dim.0;
        let stride = self.pitch / super::RawImageType::F32.sample_size();
        let RawImageData { raster, errors, .. } = self;
        let Some(Raster::F32(samples)) = raster.as_mut() else {
            return Err(Error::UsageError("buffer is not allocated".into()));
        };
        let failures = run_banded_rows(samples, stride, rows, rows_per_band, |_, band| {
            for row in band.chunks_mut(stride) {
                for px in row[..width].iter_mut() {
                    *px = (*px - black) / range;
                }
            }
            Ok(())
        });
        for failure in failures {
            errors.set_error(failure);
        }
        Ok(())
    }

    /// Minimal float bad-pixel repair: the mean of the good spatial
    /// neighbors, per component.
    pub(super) fn plan_bad_pixel_band_f32(
        &self,
        view: &Array2DRef<'_, f32>,
        start: usize,
        end: usize,
    ) -> Result<Vec<(usize, usize, usize, f32)>> {
        let Some((map, map_pitch)) = self.bad_pixel_map() else {
            return Ok(Vec::new());
        };
        let (w, h) = self.uncropped_dim;
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
                    if x >= w {
                        break;
                    }
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
                        self.set_error(format!(
                            "bad pixel ({x}, {y}) has too few good neighbors"
                        ));
                        continue;
                    }
                    for c in 0..self.cpp {
                        let sum: f32 = neighbors
                            .iter()
                            .map(|&(nx, ny)| view.get(ny, self.cpp * nx + c))
                            .sum();
                        fixes.push((x, y, c, sum / neighbors.len() as f32));
                    }
                }
            }
        }
        Ok(fixes)
    }
}

#[cfg(test)]
mod test {
    use super::super::{RawImage, RawImageType};

    fn filled_f32(dim: (usize, usize), value: f32) -> RawImage {
        let raw = RawImage::create_sized(dim, RawImageType::F32, 1).unwrap();
        {
            let mut img = raw.write();
            let mut view = img.f32_uncropped_mut().unwrap();
            for y in 0..dim.1 {
                view.row_mut(y).fill(value);
            }
        }
        raw
    }

    #[test]
    fn affine_remap() {
        let raw = filled_f32((4, 2), 1024.0);
        let mut img = raw.write();
        img.black_level = 0;
        img.white_point = 4096;
        img.scale_black_white().unwrap();
        assert!((img.pixel_f32(0, 0).unwrap() - 0.25).abs() < 1e-6);
    }

    #[test]
    fn lookup_is_unsupported() {
        let raw = filled_f32((2, 2), 0.0);
        let mut img = raw.write();
        assert!(matches!(
            img.sixteen_bit_lookup(),
            Err(crate::error::Error::Unsupported(_))
        ));
    }

    #[test]
    fn float_bad_pixel_uses_eight_neighbors() {
        let raw = filled_f32((3, 3), 0.5);
        let mut img = raw.write();
        {
            let mut view = img.f32_uncropped_mut().unwrap();
            view.set(1, 1, 42.0);
        }
        img.mark_bad_pixel(1, 1);
        img.fix_bad_pixels().unwrap();
        assert!((img.pixel_f32_uncropped(1, 1).unwrap() - 0.5).abs() < 1e-6);
    }
}
