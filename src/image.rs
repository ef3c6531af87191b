// Copyright (c) the RawDec Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::cfa::ColorFilterArray;
use crate::error::{Error, Result};
use crate::metadata::{BlackArea, ImageMetaData};
use crate::util::round_up;
use crate::util::tracing_wrappers::*;

pub mod curve;
pub mod rect;
pub mod table;
pub mod worker;

mod data_f32;
mod data_u16;

pub use rect::{Array2DRef, Array2DRefMut, Rect};
pub use table::TableLookUp;
pub use worker::RawImageWorkerTask;

/// Rows are padded out to this many bytes so 16-byte SIMD loads may read
/// past the logical row end without leaving the allocation.
pub(crate) const ROW_ALIGNMENT: usize = 16;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RawImageType {
    U16,
    F32,
}

impl RawImageType {
    pub const fn sample_size(self) -> usize {
        match self {
            RawImageType::U16 => 2,
            RawImageType::F32 => 4,
        }
    }
}

/// The decoded sample storage. One variant per pixel type; chosen once for
/// the lifetime of the buffer.
pub(crate) enum Raster {
    U16(Vec<u16>),
    F32(Vec<f32>),
}

/// Append-only per-buffer diagnostics. Containers read these back to surface
/// non-fatal problems; appends may come from concurrent workers.
#[derive(Default)]
pub struct ErrorLog {
    errors: Mutex<Vec<String>>,
}

impl ErrorLog {
    pub fn set_error(&self, error: impl Into<String>) {
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(error.into());
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn has_errors(&self) -> bool {
        !self
            .errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }
}

/// The central decode target: an uncropped raster plus everything needed to
/// turn raw sensor counts into normalized samples.
///
/// All internal indexing uses the uncropped coordinate system; the public
/// cropped accessors offset by `crop_offset`.
pub struct RawImageData {
    data_type: RawImageType,
    /// Visible (cropped) size in pixels.
    dim: (usize, usize),
    uncropped_dim: (usize, usize),
    crop_offset: (usize, usize),
    /// Bytes between row starts; `padding` of them trail each row.
    pitch: usize,
    padding: usize,
    cpp: usize,
    bpp: usize,
    raster: Option<Raster>,

    pub is_cfa: bool,
    pub cfa: ColorFilterArray,
    /// -1 when the camera did not record one.
    pub black_level: i32,
    pub black_level_separate: [i32; 4],
    pub white_point: i32,
    pub black_areas: Vec<BlackArea>,
    /// Scale with dither to minimize banding on upscaled ranges.
    pub dither_scale: bool,
    pub metadata: ImageMetaData,

    /// Positions of pixels that must be interpolated, packed `x | y << 16`
    /// in uncropped coordinates.
    bad_pixel_positions: Mutex<Vec<u32>>,
    bad_pixel_map: Option<Vec<u8>>,
    bad_pixel_map_pitch: usize,

    table: Option<TableLookUp>,
    errors: ErrorLog,
}

impl RawImageData {
    fn new(data_type: RawImageType) -> RawImageData {
        RawImageData {
            data_type,
            dim: (0, 0),
            uncropped_dim: (0, 0),
            crop_offset: (0, 0),
            pitch: 0,
            padding: 0,
            cpp: 1,
            bpp: data_type.sample_size(),
            raster: None,
            is_cfa: true,
            cfa: ColorFilterArray::default(),
            black_level: -1,
            black_level_separate: [-1; 4],
            white_point: 65536,
            black_areas: Vec::new(),
            dither_scale: true,
            metadata: ImageMetaData::default(),
            bad_pixel_positions: Mutex::new(Vec::new()),
            bad_pixel_map: None,
            bad_pixel_map_pitch: 0,
            table: None,
            errors: ErrorLog::default(),
        }
    }

    pub fn data_type(&self) -> RawImageType {
        self.data_type
    }

    pub fn cpp(&self) -> usize {
        self.cpp
    }

    pub fn bpp(&self) -> usize {
        self.bpp
    }

    pub fn dim(&self) -> (usize, usize) {
        self.dim
    }

    pub fn uncropped_dim(&self) -> (usize, usize) {
        self.uncropped_dim
    }

    pub fn crop_offset(&self) -> (usize, usize) {
        self.crop_offset
    }

    pub fn pitch(&self) -> usize {
        self.pitch
    }

    pub fn padding(&self) -> usize {
        self.padding
    }

    pub(crate) fn pitch_samples(&self) -> usize {
        self.pitch / self.data_type.sample_size()
    }

    pub fn is_allocated(&self) -> bool {
        self.raster.is_some()
    }

    pub fn set_error(&self, error: impl Into<String>) {
        self.errors.set_error(error);
    }

    pub fn error_log(&self) -> &ErrorLog {
        &self.errors
    }

    /// Changes the component count, rescaling the pixel width accordingly.
    /// Only legal before allocation.
    pub fn set_cpp(&mut self, cpp: usize) -> Result<()> {
        if self.is_allocated() {
            return Err(Error::UsageError(
                "cannot change components per pixel after allocation".into(),
            ));
        }
        if cpp == 0 || cpp > 4 {
            return Err(Error::UsageError(format!("unsupported cpp {cpp}")));
        }
        self.dim.0 = self.dim.0 * self.cpp / cpp;
        self.cpp = cpp;
        self.bpp = self.data_type.sample_size() * cpp;
        Ok(())
    }

    pub fn set_dim(&mut self, dim: (usize, usize)) -> Result<()> {
        if self.is_allocated() {
            return Err(Error::UsageError(
                "cannot resize an allocated buffer".into(),
            ));
        }
        self.dim = dim;
        Ok(())
    }

    /// Sizes the raster from the current dimensions. Allocation happens
    /// exactly once; calling again with unchanged dimensions is a no-op.
    pub fn create_data(&mut self) -> Result<()> {
        if self.dim.0 == 0 || self.dim.1 == 0 {
            return Err(Error::UsageError(format!(
                "invalid image size {}x{}",
                self.dim.0, self.dim.1
            )));
        }
        let row_bytes = self
            .dim
            .0
            .checked_mul(self.bpp)
            .filter(|&b| b < usize::MAX / 2)
            .ok_or_else(|| Error::UsageError("image row too large".into()))?;
        let pitch = round_up(row_bytes, ROW_ALIGNMENT);
        if self.is_allocated() {
            if self.uncropped_dim == self.dim && self.pitch == pitch {
                return Ok(());
            }
            return Err(Error::UsageError(
                "buffer is already allocated with different dimensions".into(),
            ));
        }
        self.pitch = pitch;
        self.padding = pitch - row_bytes;
        self.uncropped_dim = self.dim;
        self.crop_offset = (0, 0);
        let samples = (pitch / self.data_type.sample_size())
            .checked_mul(self.dim.1)
            .ok_or_else(|| Error::UsageError("image too large".into()))?;
        debug!("allocating {}x{} raster, pitch {}", self.dim.0, self.dim.1, pitch);
        self.raster = Some(match self.data_type {
            RawImageType::U16 => {
                let mut v: Vec<u16> = Vec::new();
                v.try_reserve_exact(samples)?;
                v.resize(samples, 0);
                Raster::U16(v)
            }
            RawImageType::F32 => {
                let mut v: Vec<f32> = Vec::new();
                v.try_reserve_exact(samples)?;
                v.resize(samples, 0.0);
                Raster::F32(v)
            }
        });
        Ok(())
    }

    /// Narrows the visible window to `rect` (given in current cropped
    /// coordinates). Never touches the raster.
    pub fn sub_frame(&mut self, rect: Rect) -> Result<()> {
        if !rect.is_within(self.dim) {
            return Err(Error::UsageError(format!(
                "sub-frame {rect:?} outside image {}x{}",
                self.dim.0, self.dim.1
            )));
        }
        self.crop_offset.0 += rect.origin.0;
        self.crop_offset.1 += rect.origin.1;
        self.dim = rect.size;
        Ok(())
    }

    pub(crate) fn u16_uncropped(&self) -> Result<Array2DRef<'_, u16>> {
        let width = self.cpp * self.uncropped_dim.0;
        let stride = self.pitch_samples();
        match &self.raster {
            Some(Raster::U16(v)) => Ok(Array2DRef::new(v, width, stride)),
            Some(_) => Err(Error::UsageError(
                "buffer does not hold 16-bit samples".into(),
            )),
            None => Err(Error::UsageError("buffer is not allocated".into())),
        }
    }

    pub(crate) fn u16_uncropped_mut(&mut self) -> Result<Array2DRefMut<'_, u16>> {
        let width = self.cpp * self.uncropped_dim.0;
        let stride = self.pitch / RawImageType::U16.sample_size();
        match &mut self.raster {
            Some(Raster::U16(v)) => Ok(Array2DRefMut::new(v, width, stride)),
            Some(_) => Err(Error::UsageError(
                "buffer does not hold 16-bit samples".into(),
            )),
            None => Err(Error::UsageError("buffer is not allocated".into())),
        }
    }

    pub(crate) fn f32_uncropped(&self) -> Result<Array2DRef<'_, f32>> {
        let width = self.cpp * self.uncropped_dim.0;
        let stride = self.pitch_samples();
        match &self.raster {
            Some(Raster::F32(v)) => Ok(Array2DRef::new(v, width, stride)),
            Some(_) => Err(Error::UsageError(
                "buffer does not hold float samples".into(),
            )),
            None => Err(Error::UsageError("buffer is not allocated".into())),
        }
    }

    pub(crate) fn f32_uncropped_mut(&mut self) -> Result<Array2DRefMut<'_, f32>> {
        let width = self.cpp * self.uncropped_dim.0;
        let stride = self.pitch / RawImageType::F32.sample_size();
        match &mut self.raster {
            Some(Raster::F32(v)) => Ok(Array2DRefMut::new(v, width, stride)),
            Some(_) => Err(Error::UsageError(
                "buffer does not hold float samples".into(),
            )),
            None => Err(Error::UsageError("buffer is not allocated".into())),
        }
    }

    /// Sample at `(x, y)` in uncropped coordinates; `x` counts samples, so
    /// interleaved components of one pixel are adjacent.
    pub fn pixel_u16_uncropped(&self, x: usize, y: usize) -> Result<u16> {
        if x >= self.cpp * self.uncropped_dim.0 || y >= self.uncropped_dim.1 {
            return Err(Error::UsageError(format!(
                "pixel ({x}, {y}) outside uncropped {}x{}",
                self.cpp * self.uncropped_dim.0,
                self.uncropped_dim.1
            )));
        }
        Ok(self.u16_uncropped()?.get(y, x))
    }

    /// Sample at `(x, y)` in cropped coordinates.
    pub fn pixel_u16(&self, x: usize, y: usize) -> Result<u16> {
        if x >= self.cpp * self.dim.0 || y >= self.dim.1 {
            return Err(Error::UsageError(format!(
                "pixel ({x}, {y}) outside image {}x{}",
                self.cpp * self.dim.0,
                self.dim.1
            )));
        }
        self.pixel_u16_uncropped(x + self.cpp * self.crop_offset.0, y + self.crop_offset.1)
    }

    pub fn pixel_f32_uncropped(&self, x: usize, y: usize) -> Result<f32> {
        if x >= self.cpp * self.uncropped_dim.0 || y >= self.uncropped_dim.1 {
            return Err(Error::UsageError(format!(
                "pixel ({x}, {y}) outside uncropped {}x{}",
                self.cpp * self.uncropped_dim.0,
                self.uncropped_dim.1
            )));
        }
        Ok(self.f32_uncropped()?.get(y, x))
    }

    pub fn pixel_f32(&self, x: usize, y: usize) -> Result<f32> {
        if x >= self.cpp * self.dim.0 || y >= self.dim.1 {
            return Err(Error::UsageError(format!(
                "pixel ({x}, {y}) outside image {}x{}",
                self.cpp * self.dim.0,
                self.dim.1
            )));
        }
        self.pixel_f32_uncropped(x + self.cpp * self.crop_offset.0, y + self.crop_offset.1)
    }

    /// Byte-copies a pixel rectangle from `src`. Both regions are given in
    /// uncropped pixel coordinates and must lie inside the respective
    /// allocations; pixel layout must match.
    pub fn blit_from(
        &mut self,
        src: &RawImageData,
        src_pos: (usize, usize),
        size: (usize, usize),
        dest_pos: (usize, usize),
    ) -> Result<()> {
        if self.data_type != src.data_type || self.cpp != src.cpp {
            return Err(Error::UsageError(
                "blit between incompatible buffers".into(),
            ));
        }
        if !Rect::new(src_pos, size).is_within(src.uncropped_dim)
            || !Rect::new(dest_pos, size).is_within(self.uncropped_dim)
        {
            return Err(Error::UsageError("blit region out of bounds".into()));
        }
        let cpp = self.cpp;
        match self.data_type {
            RawImageType::U16 => {
                let from = src.u16_uncropped()?;
                let mut to = self.u16_uncropped_mut()?;
                blit_rows(&from, &mut to, cpp, src_pos, size, dest_pos);
            }
            RawImageType::F32 => {
                let from = src.f32_uncropped()?;
                let mut to = self.f32_uncropped_mut()?;
                blit_rows(&from, &mut to, cpp, src_pos, size, dest_pos);
            }
        }
        Ok(())
    }

    /// Overwrites a cropped-coordinate rectangle with a repeated byte value.
    pub fn clear_area(&mut self, area: Rect, value: u8) -> Result<()> {
        if !area.is_within(self.dim) {
            return Err(Error::UsageError(format!(
                "clear area {area:?} outside image"
            )));
        }
        let cpp = self.cpp;
        let off = self.crop_offset;
        match self.data_type {
            RawImageType::U16 => {
                let fill = u16::from_ne_bytes([value, value]);
                let mut view = self.u16_uncropped_mut()?;
                clear_rows(&mut view, cpp, off, area, fill);
            }
            RawImageType::F32 => {
                let fill = f32::from_ne_bytes([value; 4]);
                let mut view = self.f32_uncropped_mut()?;
                clear_rows(&mut view, cpp, off, area, fill);
            }
        }
        Ok(())
    }

    /// Replicates the edge samples of `valid` (cropped coordinates) outward
    /// so interpolators see a finite domain over the whole cropped area.
    pub fn expand_border(&mut self, valid: Rect) -> Result<()> {
        if !valid.is_within(self.dim) {
            return Err(Error::UsageError(format!(
                "valid data {valid:?} outside image"
            )));
        }
        if valid.size.0 == 0 || valid.size.1 == 0 {
            return Err(Error::UsageError("empty valid rectangle".into()));
        }
        let cpp = self.cpp;
        let off = self.crop_offset;
        let dim = self.dim;
        match self.data_type {
            RawImageType::U16 => {
                let mut view = self.u16_uncropped_mut()?;
                expand_border_rows(&mut view, cpp, off, dim, valid);
            }
            RawImageType::F32 => {
                let mut view = self.f32_uncropped_mut()?;
                expand_border_rows(&mut view, cpp, off, dim, valid);
            }
        }
        Ok(())
    }

    /// Installs a 65536-entry tone curve; with `dither`, applications of the
    /// curve jitter sub-integer positions.
    pub fn set_table(&mut self, values: &[u16], dither: bool) -> Result<()> {
        self.table = Some(TableLookUp::new(values, dither)?);
        Ok(())
    }

    /// Removes the lookup. A no-op when none is installed.
    pub fn set_table_none(&mut self) {
        self.table = None;
    }

    pub fn has_table(&self) -> bool {
        self.table.is_some()
    }

    /// Resolves `value` through the installed curve, if any. `random` is the
    /// dither LCG state, carried across calls by decompressor loops.
    pub fn set_with_lookup(&self, value: u16, random: &mut u32) -> u16 {
        match &self.table {
            None => value,
            Some(t) if t.dither => t.lookup_dithered(value, random),
            Some(t) => t.lookup(value),
        }
    }

    /// Records a pixel (uncropped coordinates) for later interpolation.
    /// Callable from concurrent workers.
    pub fn mark_bad_pixel(&self, x: usize, y: usize) {
        debug_assert!(x < 65536 && y < 65536);
        self.bad_pixel_positions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((x as u32) | ((y as u32) << 16));
    }

    pub fn bad_pixel_count(&self) -> usize {
        self.bad_pixel_positions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Allocates the dense bad-pixel bitmap: 1 bit per uncropped pixel,
    /// rows padded to 32 bits.
    pub fn create_bad_pixel_map(&mut self) -> Result<()> {
        if self.bad_pixel_map.is_some() {
            return Ok(());
        }
        let pitch = round_up(self.uncropped_dim.0.div_ceil(8), 4);
        let mut map: Vec<u8> = Vec::new();
        map.try_reserve_exact(pitch * self.uncropped_dim.1)?;
        map.resize(pitch * self.uncropped_dim.1, 0);
        self.bad_pixel_map = Some(map);
        self.bad_pixel_map_pitch = pitch;
        Ok(())
    }

    pub(crate) fn bad_pixel_map(&self) -> Option<(&[u8], usize)> {
        self.bad_pixel_map
            .as_deref()
            .map(|m| (m, self.bad_pixel_map_pitch))
    }

    pub(crate) fn is_bad_pixel(&self, x: usize, y: usize) -> bool {
        match self.bad_pixel_map() {
            Some((map, pitch)) => map[y * pitch + (x >> 3)] & (1 << (x & 7)) != 0,
            None => false,
        }
    }

    /// Drains the recorded positions into the bitmap. Idempotent; draining
    /// order is irrelevant.
    pub fn transfer_bad_pixels_to_map(&mut self) -> Result<()> {
        let positions = {
            let mut guard = self
                .bad_pixel_positions
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        if positions.is_empty() {
            return Ok(());
        }
        self.create_bad_pixel_map()?;
        let pitch = self.bad_pixel_map_pitch;
        let dim = self.uncropped_dim;
        let Some(map) = self.bad_pixel_map.as_mut() else {
            return Ok(());
        };
        for pos in positions {
            let (x, y) = ((pos & 0xFFFF) as usize, (pos >> 16) as usize);
            if x >= dim.0 || y >= dim.1 {
                self.errors
                    .set_error(format!("bad pixel ({x}, {y}) outside image"));
                continue;
            }
            map[y * pitch + (x >> 3)] |= 1 << (x & 7);
        }
        Ok(())
    }

    /// Interpolates away every pixel marked bad. Per-pixel problems are
    /// logged, never fatal.
    pub fn fix_bad_pixels(&mut self) -> Result<()> {
        self.transfer_bad_pixels_to_map()?;
        if self.bad_pixel_map.is_none() {
            return Ok(());
        }
        self.start_workers(RawImageWorkerTask::FixBadPixels)
    }

    /// Rescales raw counts to the full output range using the black and
    /// white levels, deriving per-CFA-cell blacks when necessary.
    pub fn scale_black_white(&mut self) -> Result<()> {
        match self.data_type {
            RawImageType::U16 => self.scale_black_white_u16(),
            RawImageType::F32 => self.scale_black_white_f32(),
        }
    }

    /// Runs the installed curve over every stored sample.
    pub fn sixteen_bit_lookup(&mut self) -> Result<()> {
        match self.data_type {
            RawImageType::U16 => self.start_workers(RawImageWorkerTask::ApplyLookup),
            RawImageType::F32 => Err(Error::Unsupported(
                "lookup tables only apply to 16-bit buffers",
            )),
        }
    }
}

fn blit_rows<T: Copy>(
    from: &Array2DRef<'_, T>,
    to: &mut Array2DRefMut<'_, T>,
    cpp: usize,
    src_pos: (usize, usize),
    size: (usize, usize),
    dest_pos: (usize, usize),
) {
    for row in 0..size.1 {
        let src_row = &from.row(src_pos.1 + row)[cpp * src_pos.0..][..cpp * size.0];
        to.row_mut(dest_pos.1 + row)[cpp * dest_pos.0..][..cpp * size.0].copy_from_slice(src_row);
    }
}

fn clear_rows<T: Copy>(
    view: &mut Array2DRefMut<'_, T>,
    cpp: usize,
    crop_offset: (usize, usize),
    area: Rect,
    fill: T,
) {
    for row in 0..area.size.1 {
        let y = crop_offset.1 + area.origin.1 + row;
        view.row_mut(y)[cpp * (crop_offset.0 + area.origin.0)..][..cpp * area.size.0].fill(fill);
    }
}

fn expand_border_rows<T: Copy>(
    view: &mut Array2DRefMut<'_, T>,
    cpp: usize,
    crop_offset: (usize, usize),
    dim: (usize, usize),
    valid: Rect,
) {
    // Horizontal replication inside the valid rows, then whole-row copies
    // above and below.
    for y in valid.origin.1..valid.bottom() {
        let row = view.row_mut(crop_offset.1 + y);
        let row = &mut row[cpp * crop_offset.0..][..cpp * dim.0];
        for x in 0..valid.origin.0 {
            for c in 0..cpp {
                row[cpp * x + c] = row[cpp * valid.origin.0 + c];
            }
        }
        for x in valid.right()..dim.0 {
            for c in 0..cpp {
                row[cpp * x + c] = row[cpp * (valid.right() - 1) + c];
            }
        }
    }
    let copy_row = |view: &mut Array2DRefMut<'_, T>, from_y: usize, to_y: usize| {
        let from: Vec<T> =
            view.row(crop_offset.1 + from_y)[cpp * crop_offset.0..][..cpp * dim.0].to_vec();
        view.row_mut(crop_offset.1 + to_y)[cpp * crop_offset.0..][..cpp * dim.0]
            .copy_from_slice(&from);
    };
    for y in 0..valid.origin.1 {
        copy_row(view, valid.origin.1, y);
    }
    for y in valid.bottom()..dim.1 {
        copy_row(view, valid.bottom() - 1, y);
    }
}

/// Shared-ownership handle to a [`RawImageData`]. Clones share the same
/// buffer; it is reclaimed when the last handle drops.
#[derive(Clone)]
pub struct RawImage {
    inner: Arc<RwLock<RawImageData>>,
}

impl RawImage {
    /// Creates an unsized buffer of the given pixel type.
    pub fn create(data_type: RawImageType) -> RawImage {
        RawImage {
            inner: Arc::new(RwLock::new(RawImageData::new(data_type))),
        }
    }

    /// Creates and allocates a buffer.
    pub fn create_sized(
        dim: (usize, usize),
        data_type: RawImageType,
        cpp: usize,
    ) -> Result<RawImage> {
        let mut data = RawImageData::new(data_type);
        data.set_cpp(cpp)?;
        data.set_dim(dim)?;
        data.create_data()?;
        Ok(RawImage {
            inner: Arc::new(RwLock::new(data)),
        })
    }

    pub fn read(&self) -> RwLockReadGuard<'_, RawImageData> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, RawImageData> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of live handles sharing this buffer.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}
