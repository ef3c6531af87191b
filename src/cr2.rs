// Copyright (c) the RawDec Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

use crate::bit_pump::BitPumpJpeg;
use crate::error::{Error, Result};
use crate::huffman::HuffmanTable;
use crate::image::{RawImage, RawImageData, RawImageType};
use crate::util::tracing_wrappers::*;

pub const MAX_WIDTH: usize = 19440;
pub const MAX_HEIGHT: usize = 5920;

/// How the coded frame is cut into vertical slices: `num_slices - 1` slices
/// of `slice_width` followed by one of `last_slice_width`, concatenated
/// horizontally in the bit stream.
#[derive(Clone, Copy, Debug)]
pub struct Cr2Slicing {
    num_slices: usize,
    slice_width: usize,
    last_slice_width: usize,
}

impl Cr2Slicing {
    pub fn new(num_slices: usize, slice_width: usize, last_slice_width: usize) -> Cr2Slicing {
        Cr2Slicing {
            num_slices,
            slice_width,
            last_slice_width,
        }
    }

    pub fn num_slices(&self) -> usize {
        self.num_slices
    }

    pub fn width_of_slice(&self, slice_id: usize) -> usize {
        if slice_id + 1 == self.num_slices {
            self.last_slice_width
        } else {
            self.slice_width
        }
    }

    pub fn total_width(&self) -> usize {
        (self.num_slices - 1) * self.slice_width + self.last_slice_width
    }
}

/// Per-component decode recipe: the difference table and the value the
/// predictor starts from.
pub struct PerComponentRecipe {
    pub ht: HuffmanTable,
    pub init_pred: u16,
}

/// Decompressor for the Canon CR2 lossless-JPEG variant: an N-component
/// Huffman-coded difference stream cut into vertical slices, reflowed into
/// the sensor frame with optional chroma subsampling.
pub struct Cr2Decompressor<'a> {
    raw: RawImage,
    format: (usize, usize, usize),
    frame: (usize, usize),
    slicing: Cr2Slicing,
    rec: Vec<PerComponentRecipe>,
    input: &'a [u8],
}

impl<'a> Cr2Decompressor<'a> {
    pub fn new(
        raw: RawImage,
        format: (usize, usize, usize),
        frame: (usize, usize),
        slicing: Cr2Slicing,
        rec: Vec<PerComponentRecipe>,
        input: &'a [u8],
    ) -> Result<Cr2Decompressor<'a>> {
        {
            let img = raw.read();
            if img.data_type() != RawImageType::U16 {
                return Err(Error::UsageError("unexpected data type".into()));
            }
            if img.cpp() != 1 || img.bpp() != 2 {
                return Err(Error::UsageError(format!("unexpected cpp: {}", img.cpp())));
            }
            let dim = img.dim();
            if dim.0 == 0 || dim.1 == 0 || dim.0 > MAX_WIDTH || dim.1 > MAX_HEIGHT {
                return Err(Error::BadSliceGeometry(format!(
                    "unexpected image dimensions ({}; {})",
                    dim.0, dim.1
                )));
            }

            if slicing.num_slices() == 0 {
                return Err(Error::BadSliceGeometry("no slices".into()));
            }
            for slice_id in 0..slicing.num_slices() {
                if slicing.width_of_slice(slice_id) == 0 {
                    return Err(Error::BadSliceGeometry(format!(
                        "bad width for slice {slice_id}"
                    )));
                }
            }

            let is_subsampled = format.1 != 1 || format.2 != 1;
            if is_subsampled == img.is_cfa {
                return Err(Error::BadSliceGeometry(
                    "cannot decode subsampled image to CFA data or vice versa".into(),
                ));
            }
        }

        if ![(3, 2, 2), (3, 2, 1), (2, 1, 1), (4, 1, 1)].contains(&format) {
            return Err(Error::BadSliceGeometry(format!(
                "unknown format <{},{},{}>",
                format.0, format.1, format.2
            )));
        }

        if rec.len() != format.0 {
            return Err(Error::BadSliceGeometry(
                "table/initial predictor count does not match component count".into(),
            ));
        }
        for recipe in &rec {
            if !recipe.ht.is_full_decode() {
                return Err(Error::BadHuffmanTable(
                    "table is not of a full decoding variety".into(),
                ));
            }
        }

        Ok(Cr2Decompressor {
            raw,
            format,
            frame,
            slicing,
            rec,
            input,
        })
    }

    pub fn decompress(&self) -> Result<()> {
        let mut img = self.raw.write();
        let res = match self.format {
            (3, 2, 2) => self.decompress_n_x_y::<3, 2, 2>(&mut img), // sRaw1/mRaw
            (3, 2, 1) => self.decompress_n_x_y::<3, 2, 1>(&mut img), // sRaw2/sRaw
            (2, 1, 1) => self.decompress_n_x_y::<2, 1, 1>(&mut img),
            (4, 1, 1) => self.decompress_n_x_y::<4, 1, 1>(&mut img),
            _ => Err(Error::BadSliceGeometry("unknown format".into())),
        };
        if let Err(e) = &res {
            img.set_error(e.to_string());
        }
        res
    }

    fn decompress_n_x_y<const N_COMP: usize, const X_S_F: usize, const Y_S_F: usize>(
        &self,
        img: &mut RawImageData,
    ) -> Result<()> {
        // For the slice handling and sampling factor behavior see
        // https://github.com/lclevy/libcraw2/blob/master/docs/cr2_lossless.pdf

        let sub_sampled = X_S_F != 1 || Y_S_F != 1;

        // The inner loop decodes one group of pixels at a time:
        //  * for <N,1,1>: N  = N*1*1 (full raw)
        //  * for <3,2,1>: 6  = 3*2*1
        //  * for <3,2,2>: 12 = 3*2*2
        // and advances x by N_COMP*X_S_F and y by Y_S_F.
        let slice_col_step = N_COMP * X_S_F;
        let frame_row_step = Y_S_F;
        let pixels_per_group = X_S_F * Y_S_F;
        let group_size = if sub_sampled { 2 + pixels_per_group } else { N_COMP };
        let cpp = if sub_sampled { 3 } else { 1 };
        let cols_per_group = if sub_sampled { group_size } else { cpp };

        let mut real_dim = img.dim();
        if sub_sampled {
            if real_dim.0 % group_size != 0 {
                return Err(Error::BadSliceGeometry(format!(
                    "image width {} is not a whole number of groups",
                    real_dim.0
                )));
            }
            real_dim.0 /= group_size;
        }
        real_dim.0 *= X_S_F;
        real_dim.1 *= Y_S_F;

        let frame = self.frame;
        if frame.0 == 0 || frame.0 % X_S_F != 0 {
            return Err(Error::BadSliceGeometry(format!(
                "frame width {} not a positive multiple of the sampling factor",
                frame.0
            )));
        }
        if frame.1 == 0 || frame.1 % frame_row_step != 0 {
            return Err(Error::BadSliceGeometry(format!(
                "frame height {} not a positive multiple of the sampling factor",
                frame.1
            )));
        }

        for width in [self.slicing.slice_width, self.slicing.last_slice_width] {
            if width > real_dim.0 {
                return Err(Error::BadSliceGeometry(
                    "slice is wider than the image".into(),
                ));
            }
            if width % slice_col_step != 0 {
                return Err(Error::BadSliceGeometry(format!(
                    "slice width ({width}) should be multiple of pixel group size ({slice_col_step})"
                )));
            }
            if width % cpp != 0 {
                return Err(Error::BadSliceGeometry(format!(
                    "slice width ({width}) should be multiple of image cpp ({cpp})"
                )));
            }
        }

        if frame.1 * self.slicing.total_width() < cpp * real_dim.0 * real_dim.1 {
            return Err(Error::BadSliceGeometry(
                "incorrect slice height / slice widths, less than image size".into(),
            ));
        }

        let ht: [&HuffmanTable; N_COMP] = std::array::from_fn(|i| &self.rec[i].ht);
        let mut pred: [u16; N_COMP] = std::array::from_fn(|i| self.rec[i].init_pred);
        // Snapshot of the output position whose row the predictors reload
        // from at the next frame-column wrap.
        let mut pred_next: (usize, usize) = (0, 0);

        let mut bs = BitPumpJpeg::new(self.input);
        let mut out = img.u16_uncropped_mut()?;

        debug!(
            "decoding {} slices into {}x{} samples",
            self.slicing.num_slices(),
            real_dim.0,
            real_dim.1
        );

        let mut global_frame_col = 0usize;
        let mut global_frame_row = 0usize;
        'slices: for slice_id in 0..self.slicing.num_slices() {
            let slice_width = self.slicing.width_of_slice(slice_id);

            let mut slice_frame_row = 0usize;
            while slice_frame_row < frame.1 {
                let mut row = global_frame_row % real_dim.1;
                let mut col = global_frame_row / real_dim.1 * self.slicing.width_of_slice(0) / cpp;
                if col >= real_dim.0 {
                    // The last slice may overhang the image end.
                    continue 'slices;
                }

                let pixels_per_slice_row = slice_width / cpp;
                if col + pixels_per_slice_row > real_dim.0 {
                    return Err(Error::BadSliceGeometry(
                        "bad slice width / frame size / image size combination".into(),
                    ));
                }
                if slice_id + 1 == self.slicing.num_slices()
                    && col + pixels_per_slice_row != real_dim.0
                {
                    return Err(Error::BadSliceGeometry(
                        "insufficient slices - do not fill the entire image".into(),
                    ));
                }

                row /= Y_S_F;
                col /= X_S_F;
                col *= cols_per_group;

                let mut slice_col = 0usize;
                while slice_col < slice_width {
                    // One full coded-frame row consumed: the encoder reloads
                    // every predictor from the row decoded one image-row
                    // above the next group, wherever that is.
                    if global_frame_col == frame.0 {
                        for (c, p) in pred.iter_mut().enumerate() {
                            let off = if c == 0 { 0 } else { group_size - (N_COMP - c) };
                            *p = out.get(pred_next.0, pred_next.1 + off);
                        }
                        pred_next = (row, col);
                        global_frame_col = 0;
                    }

                    // Decode until the end of the frame row (predictor change
                    // time) or of the current slice row, whichever is nearer.
                    let cols_remaining_in_frame_row =
                        slice_col_step * ((frame.0 - global_frame_col) / X_S_F);
                    let cols_remaining_in_slice_row = slice_width - slice_col;
                    let cols_remaining =
                        cols_remaining_in_slice_row.min(cols_remaining_in_frame_row);
                    debug_assert!(
                        cols_remaining >= slice_col_step && cols_remaining % slice_col_step == 0
                    );

                    let slice_col_end = slice_col + cols_remaining;
                    while slice_col < slice_col_end {
                        for p in 0..group_size {
                            let c = if p < pixels_per_group {
                                0
                            } else {
                                p - pixels_per_group + 1
                            };
                            let diff = ht[c].decode_difference(&mut bs)?;
                            pred[c] = pred[c].wrapping_add(diff as u16);
                            out.set(row, col + p, pred[c]);
                        }
                        slice_col += slice_col_step;
                        global_frame_col += X_S_F;
                        col += group_size;
                    }
                }

                slice_frame_row += frame_row_step;
                global_frame_row += frame_row_step;
            }
        }
        Ok(())
    }
}
