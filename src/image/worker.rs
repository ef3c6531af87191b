// Copyright (c) the RawDec Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::error::{Error, Result};

use super::{RawImageData, RawImageType};

/// A post-decode pass over a band of rows. Scale and lookup run over sample
/// rows; the bad-pixel pass plans against a frozen bitmap first.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RawImageWorkerTask {
    ScaleValues,
    FixBadPixels,
    ApplyLookup,
}

impl RawImageWorkerTask {
    /// Whether the pass covers the full uncropped row range instead of the
    /// rows up to the crop bottom. Only the lookup pass does.
    pub fn uses_full_image(self) -> bool {
        matches!(self, RawImageWorkerTask::ApplyLookup)
    }
}

/// Number of bands a pass is split into; fixed at the hardware parallelism
/// of the process, not dynamic.
pub(crate) fn hardware_parallelism() -> usize {
    #[cfg(feature = "parallel")]
    {
        rayon::current_num_threads().max(1)
    }
    #[cfg(not(feature = "parallel"))]
    {
        1
    }
}

/// Runs `f(first_row, band)` over per-band chunks of the leading `rows` rows
/// of `samples`, concurrently when the `parallel` feature is on. Nothing
/// escapes a worker: `Err` results and panics come back as messages for the
/// error log. Joins before returning.
pub(crate) fn run_banded_rows<T, F>(
    samples: &mut [T],
    stride: usize,
    rows: usize,
    rows_per_band: usize,
    f: F,
) -> Vec<String>
where
    T: Send,
    F: Fn(usize, &mut [T]) -> Result<()> + Sync,
{
    if rows == 0 || stride == 0 {
        return Vec::new();
    }
    let rows_per_band = rows_per_band.max(1);
    let region = &mut samples[..rows * stride];
    let chunk = rows_per_band * stride;
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        region
            .par_chunks_mut(chunk)
            .enumerate()
            .filter_map(|(i, band)| run_band(&f, i * rows_per_band, band))
            .collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        region
            .chunks_mut(chunk)
            .enumerate()
            .filter_map(|(i, band)| run_band(&f, i * rows_per_band, band))
            .collect()
    }
}

fn run_band<T, F>(f: &F, first_row: usize, band: &mut [T]) -> Option<String>
where
    F: Fn(usize, &mut [T]) -> Result<()> + Sync,
{
    match catch_unwind(AssertUnwindSafe(|| f(first_row, band))) {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some("worker panicked".into()),
    }
}

/// Read-only fan-out over row ranges `[start, end)`; collects every band's
/// results in band order plus any failure messages.
pub(crate) fn collect_banded<R, F>(
    rows: usize,
    rows_per_band: usize,
    f: F,
) -> (Vec<R>, Vec<String>)
where
    R: Send,
    F: Fn(usize, usize) -> Result<Vec<R>> + Sync,
{
    if rows == 0 {
        return (Vec::new(), Vec::new());
    }
    let rows_per_band = rows_per_band.max(1);
    let bands: Vec<(usize, usize)> = (0..rows.div_ceil(rows_per_band))
        .map(|i| (i * rows_per_band, ((i + 1) * rows_per_band).min(rows)))
        .collect();
    let run = |start: usize, end: usize| -> std::result::Result<Vec<R>, String> {
        match catch_unwind(AssertUnwindSafe(|| f(start, end))) {
            Ok(Ok(r)) => Ok(r),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("worker panicked".into()),
        }
    };
    let outcomes: Vec<std::result::Result<Vec<R>, String>>;
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        outcomes = bands.par_iter().map(|&(start, end)| run(start, end)).collect();
    }
    #[cfg(not(feature = "parallel"))]
    {
        outcomes = bands.iter().map(|&(start, end)| run(start, end)).collect();
    }
    let mut results = Vec::new();
    let mut failures = Vec::new();
    for outcome in outcomes {
        match outcome {
            Ok(mut r) => results.append(&mut r),
            Err(e) => failures.push(e),
        }
    }
    (results, failures)
}

impl RawImageData {
    /// Row range a task's bands cover, decided by its full-image flag.
    pub(super) fn worker_rows(&self, task: RawImageWorkerTask) -> usize {
        if task.uses_full_image() {
            self.uncropped_dim().1
        } else {
            self.crop_offset().1 + self.dim().1
        }
    }

    /// Fans the task out over row bands and joins. Worker failures land in
    /// the error log; only setup misuse is fatal.
    pub fn start_workers(&mut self, task: RawImageWorkerTask) -> Result<()> {
        match (task, self.data_type()) {
            (RawImageWorkerTask::ScaleValues, RawImageType::U16) => self.scale_values_u16(),
            (RawImageWorkerTask::ScaleValues, RawImageType::F32) => self.scale_values_f32(),
            (RawImageWorkerTask::ApplyLookup, RawImageType::U16) => self.apply_lookup_u16(),
            (RawImageWorkerTask::ApplyLookup, RawImageType::F32) => Err(Error::Unsupported(
                "lookup tables only apply to 16-bit buffers",
            )),
            (RawImageWorkerTask::FixBadPixels, _) => self.fix_bad_pixels_task(),
        }
    }

    fn fix_bad_pixels_task(&mut self) -> Result<()> {
        let rows = self.worker_rows(RawImageWorkerTask::FixBadPixels);
        let rows_per_band = rows.div_ceil(hardware_parallelism());
        match self.data_type() {
            RawImageType::U16 => {
                let (fixes, failures) = {
                    let this = &*self;
                    let view = this.u16_uncropped()?;
                    collect_banded(rows, rows_per_band, |start, end| {
                        this.plan_bad_pixel_band_u16(&view, start, end)
                    })
                };
                for failure in failures {
                    self.set_error(failure);
                }
                let cpp = self.cpp();
                let mut view = self.u16_uncropped_mut()?;
                for (x, y, c, value) in fixes {
                    view.set(y, cpp * x + c, value);
                }
            }
            RawImageType::F32 => {
                let (fixes, failures) = {
                    let this = &*self;
                    let view = this.f32_uncropped()?;
                    collect_banded(rows, rows_per_band, |start, end| {
                        this.plan_bad_pixel_band_f32(&view, start, end)
                    })
                };
                for failure in failures {
                    self.set_error(failure);
                }
                let cpp = self.cpp();
                let mut view = self.f32_uncropped_mut()?;
                for (x, y, c, value) in fixes {
                    view.set(y, cpp * x + c, value);
                }
            }
        }
        Ok(())
    }
}
