// Copyright (c) the RawDec Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

use rawdec::cr2::{Cr2Decompressor, Cr2Slicing, PerComponentRecipe};
use rawdec::huffman::HuffmanTable;
use rawdec::image::curve::CurveGuard;
use rawdec::image::{RawImage, RawImageType, Rect};

fn zero_diff_table() -> HuffmanTable {
    let mut counts = [0u8; 16];
    counts[0] = 2;
    HuffmanTable::new(&counts, &[0, 1]).unwrap()
}

/// Decode, curve-guard, scale and bad-pixel-fix in the order an outer
/// container decoder drives them.
#[test]
fn decode_then_postprocess() {
    let raw = RawImage::create_sized((4, 4), RawImageType::U16, 1).unwrap();

    let curve: Vec<u16> = (0..65536u32).map(|v| v as u16).collect();
    {
        let _curve = CurveGuard::new(&raw, &curve, false).unwrap();
        let rec = vec![
            PerComponentRecipe {
                ht: zero_diff_table(),
                init_pred: 2048,
            },
            PerComponentRecipe {
                ht: zero_diff_table(),
                init_pred: 2048,
            },
        ];
        let d = Cr2Decompressor::new(
            raw.clone(),
            (2, 1, 1),
            (4, 4),
            Cr2Slicing::new(1, 4, 4),
            rec,
            &[0x00, 0x00],
        )
        .unwrap();
        d.decompress().unwrap();
    }
    // The session curve is gone once the guard drops.
    assert!(!raw.read().has_table());

    {
        let mut img = raw.write();
        img.mark_bad_pixel(2, 2);
        assert_eq!(img.pixel_u16_uncropped(2, 2).unwrap(), 2048);
        img.black_level = 0;
        img.black_level_separate = [0; 4];
        img.white_point = 4096;
        img.dither_scale = false;
        img.scale_black_white().unwrap();
        // 2048 of 4096 lands mid-range.
        assert_eq!(img.pixel_u16(0, 0).unwrap(), 32768);
        img.fix_bad_pixels().unwrap();
        assert_eq!(img.pixel_u16_uncropped(2, 2).unwrap(), 32768);
        assert!(!img.error_log().has_errors());
    }

    // Cropping afterwards only narrows the view.
    let mut img = raw.write();
    img.sub_frame(Rect::new((1, 1), (2, 2))).unwrap();
    assert_eq!(img.pixel_u16(0, 0).unwrap(), 32768);
    assert_eq!(
        img.pixel_u16(1, 1).unwrap(),
        img.pixel_u16_uncropped(2, 2).unwrap()
    );
}

/// Two decodes of the same stream produce byte-identical rasters.
#[test]
fn decode_is_deterministic() {
    let run = || {
        let raw = RawImage::create_sized((4, 4), RawImageType::U16, 1).unwrap();
        let rec = vec![
            PerComponentRecipe {
                ht: zero_diff_table(),
                init_pred: 900,
            },
            PerComponentRecipe {
                ht: zero_diff_table(),
                init_pred: 901,
            },
        ];
        Cr2Decompressor::new(
            raw.clone(),
            (2, 1, 1),
            (4, 4),
            Cr2Slicing::new(2, 2, 2),
            rec,
            &[0x00, 0x00],
        )
        .unwrap()
        .decompress()
        .unwrap();
        let mut img = raw.write();
        img.black_level = 16;
        img.black_level_separate = [16; 4];
        img.white_point = 1024;
        img.scale_black_white().unwrap();
        drop(img);
        raw
    };
    let (a, b) = (run(), run());
    let (ia, ib) = (a.read(), b.read());
    for y in 0..4 {
        for x in 0..4 {
            assert_eq!(ia.pixel_u16(x, y).unwrap(), ib.pixel_u16(x, y).unwrap());
        }
    }
}
