// Copyright (c) the RawDec Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

/// A sensor region that never sees light, used to estimate the black level
/// when the camera does not record one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlackArea {
    /// First row (or column, when `is_vertical`) of the area.
    pub offset: usize,
    /// Number of rows (or columns) it spans.
    pub size: usize,
    /// Vertical areas span columns, horizontal ones span rows.
    pub is_vertical: bool,
}

impl BlackArea {
    pub fn new(offset: usize, size: usize, is_vertical: bool) -> BlackArea {
        BlackArea {
            offset,
            size,
            is_vertical,
        }
    }
}

/// Camera identity and shot parameters carried alongside the raster. Opaque
/// to the decompression core; container parsers fill it in.
#[derive(Debug, Clone)]
pub struct ImageMetaData {
    /// <1 means the image needs vertical stretching, >1 horizontal.
    pub pixel_aspect_ratio: f64,
    pub wb_coeffs: [f32; 4],
    /// Corner offset of Fuji 45-degree-rotated sensors.
    pub fuji_rotation_pos: u32,
    pub subsampling: (u32, u32),
    pub make: String,
    pub model: String,
    pub mode: String,
    pub canonical_make: String,
    pub canonical_model: String,
    pub canonical_alias: String,
    pub canonical_id: String,
    /// ISO speed, 0 when unknown.
    pub iso_speed: u32,
}

impl Default for ImageMetaData {
    fn default() -> ImageMetaData {
        ImageMetaData {
            pixel_aspect_ratio: 1.0,
            wb_coeffs: [f32::NAN; 4],
            fuji_rotation_pos: 0,
            subsampling: (1, 1),
            make: String::new(),
            model: String::new(),
            mode: String::new(),
            canonical_make: String::new(),
            canonical_model: String::new(),
            canonical_alias: String::new(),
            canonical_id: String::new(),
            iso_speed: 0,
        }
    }
}
