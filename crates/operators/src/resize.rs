//! Box-filter resampling.
//!
//! Each output element is the mean of the input elements its footprint
//! overlaps along every axis. Output and input regions are related by the
//! scale `out / in` per axis; starts round down and stops round up in both
//! directions, so a mapped region always covers the exact one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use roiflow_core::{with_buffer, Buffer, ConfigurationError, Element, NdArray, Roi};
use roiflow_graph::{ComputeContext, ConfigureContext, DirtyContext, InputSpec, Operator, OutputSpec};
use roiflow_request::{RequestError, RequestPool};
use tracing::debug;

use crate::progress::ProgressSignal;

/// Axes that may never change extent.
const FIXED_AXES: [char; 2] = ['c', 't'];

/// Input region needed to compute `roi` of an output of `out_shape`
/// resampled from `in_shape`.
pub fn input_roi_for(roi: &Roi, in_shape: &[usize], out_shape: &[usize]) -> Roi {
    map_roi(roi, out_shape, in_shape)
}

/// Output region affected by a change to `roi` of the input.
pub fn output_roi_for(roi: &Roi, in_shape: &[usize], out_shape: &[usize]) -> Roi {
    map_roi(roi, in_shape, out_shape)
}

/// Scale `roi` from an array of shape `from` to one of shape `to`.
fn map_roi(roi: &Roi, from: &[usize], to: &[usize]) -> Roi {
    if roi.rank() != from.len() || from.len() != to.len() {
        return Roi::full(to);
    }
    let (start, stop): (Vec<usize>, Vec<usize>) = (0..roi.rank())
        .map(|axis| {
            let (f, t) = (from[axis].max(1), to[axis]);
            let range = roi.axis(axis);
            ((range.start * t / f).min(t), (range.end * t).div_ceil(f).min(t))
        })
        .unzip();
    // Everything is a safe over-approximation.
    Roi::new(start, stop).unwrap_or_else(|_| Roi::full(to))
}

/// Resamples `Input` to the shape given by `ResizedShape`.
///
/// Channel and time axes must keep their extent. When the shapes already
/// match the input is passed through untouched. Otherwise the requested
/// region is cut along the leading axis into parallel parts.
#[derive(Debug, Clone)]
pub struct OpResize {
    parallelism: usize,
    progress: ProgressSignal,
}

impl Default for OpResize {
    fn default() -> Self {
        Self::new()
    }
}

impl OpResize {
    pub const INPUT: usize = 0;
    pub const RESIZED_SHAPE: usize = 1;
    pub const OUTPUT: usize = 0;

    pub fn new() -> Self {
        Self {
            parallelism: 4,
            progress: ProgressSignal::new(),
        }
    }

    /// Maximum number of parts a request is split into.
    pub fn with_parallelism(mut self, parts: usize) -> Self {
        self.parallelism = parts.max(1);
        self
    }

    /// Progress of each compute: 0 when it starts, rising as parts finish,
    /// 100 when the region is assembled.
    pub fn progress(&self) -> ProgressSignal {
        self.progress.clone()
    }
}

#[async_trait]
impl Operator for OpResize {
    fn name(&self) -> &str {
        "OpResize"
    }

    fn inputs(&self) -> Vec<InputSpec> {
        vec![InputSpec::array("Input"), InputSpec::value("ResizedShape")]
    }

    fn outputs(&self) -> Vec<OutputSpec> {
        vec![OutputSpec::array("Output")]
    }

    fn configure(&self, cx: &mut ConfigureContext) -> Result<(), ConfigurationError> {
        let input = cx.input_meta(Self::INPUT)?.clone();
        let resized = cx
            .require_value(Self::RESIZED_SHAPE)?
            .as_shape()
            .map(<[usize]>::to_vec)
            .ok_or_else(|| ConfigurationError::InvalidValue {
                operator: self.name().to_string(),
                slot: "ResizedShape".to_string(),
                reason: "expected a shape".to_string(),
            })?;

        if resized.len() != input.rank() {
            return Err(ConfigurationError::RankMismatch {
                operator: self.name().to_string(),
                expected: input.rank(),
                actual: resized.len(),
            });
        }
        if input.rank() == 0 || resized.contains(&0) {
            return Err(ConfigurationError::InvalidValue {
                operator: self.name().to_string(),
                slot: "ResizedShape".to_string(),
                reason: format!("cannot resize to {resized:?}"),
            });
        }
        for key in FIXED_AXES {
            if let Some(axis) = input.axis_index(key) {
                if resized[axis] != input.shape[axis] {
                    return Err(ConfigurationError::UnsupportedResize {
                        operator: self.name().to_string(),
                        axis: key,
                    });
                }
            }
        }

        let mut output = input;
        output.shape = resized;
        cx.set_output_meta(Self::OUTPUT, output);
        Ok(())
    }

    async fn compute(
        &self,
        cx: &ComputeContext,
        _output: usize,
        roi: &Roi,
        dest: &mut Buffer,
    ) -> Result<(), RequestError> {
        let in_shape = cx.input_meta(Self::INPUT)?.shape.clone();
        let out_shape = cx.output_meta(Self::OUTPUT)?.shape.clone();

        if in_shape == out_shape {
            *dest = cx.request_input(Self::INPUT, roi.clone()).await?;
            return Ok(());
        }

        let parts = roi.split_axis(0, self.parallelism);
        let total = parts.len();
        let finished = Arc::new(AtomicUsize::new(0));
        debug!(%roi, parts = total, "resampling");
        self.progress.emit(0);

        let mut pool = RequestPool::new();
        for (i, part) in parts.into_iter().enumerate() {
            let in_shape = in_shape.clone();
            let out_shape = out_shape.clone();
            let request = cx.spawn(format!("OpResize.part{i}"), move |cx| async move {
                let source_roi = input_roi_for(&part, &in_shape, &out_shape);
                let source = cx.request_input(Self::INPUT, source_roi.clone()).await?;
                cx.check_cancelled()?;
                let data = resample(&source, &source_roi, &part, &in_shape, &out_shape);
                Ok((part, data))
            });
            let progress = self.progress.clone();
            let finished = Arc::clone(&finished);
            request.notify_finished(move |status| {
                if status.is_ok() {
                    let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
                    if done < total {
                        progress.emit((100 * done / total) as u8);
                    }
                }
            });
            pool.add(request);
        }

        let results = pool.await?;
        cx.check_cancelled()?;
        for (part, data) in results {
            let local = part
                .relative_to(roi)
                .map_err(|e| RequestError::InvalidRoi(e.to_string()))?;
            dest.write_region(&local, &data)?;
        }
        self.progress.emit(100);
        Ok(())
    }

    fn notify_dirty(&self, cx: &mut DirtyContext, input: usize, roi: &Roi) {
        let shapes = cx
            .input_meta(Self::INPUT)
            .zip(cx.output_meta(Self::OUTPUT))
            .map(|(i, o)| (i.shape.clone(), o.shape.clone()));
        match shapes {
            Some((in_shape, out_shape)) if input == Self::INPUT => {
                let affected = output_roi_for(roi, &in_shape, &out_shape);
                cx.set_output_dirty(Self::OUTPUT, affected);
            }
            _ => cx.set_output_dirty_all(Self::OUTPUT),
        }
    }
}

/// Box-filter `source` (covering `source_roi` of the input) into `target`
/// of the output.
fn resample(source: &Buffer, source_roi: &Roi, target: &Roi, in_shape: &[usize], out_shape: &[usize]) -> Buffer {
    // Per axis, the input span of every output index in `target`, relative
    // to `source_roi`.
    let spans: Vec<Vec<(usize, usize)>> = (0..target.rank())
        .map(|axis| {
            let (n, m) = (in_shape[axis], out_shape[axis]);
            let offset = source_roi.start()[axis];
            target
                .axis(axis)
                .map(|o| {
                    let lo = o * n / m;
                    let hi = ((o + 1) * n).div_ceil(m).max(lo + 1);
                    (lo - offset, hi - offset)
                })
                .collect()
        })
        .collect();

    with_buffer!(source, a => Element::into_buffer(box_mean(a, &target.shape(), &spans)))
}

fn box_mean<T: Element>(source: &NdArray<T>, shape: &[usize], spans: &[Vec<(usize, usize)>]) -> NdArray<T> {
    let rank = shape.len();
    let mut pos = vec![0; rank];
    NdArray::from_fn(shape, |idx| {
        let bounds: Vec<(usize, usize)> = idx.iter().enumerate().map(|(axis, &i)| spans[axis][i]).collect();
        for (p, (lo, _)) in pos.iter_mut().zip(&bounds) {
            *p = *lo;
        }
        let mut sum = 0.0;
        let mut count = 0usize;
        loop {
            sum += source.get(&pos).map_or(0.0, Element::to_f64);
            count += 1;
            // Odometer over the box, last axis fastest.
            let mut axis = rank;
            loop {
                if axis == 0 {
                    return T::from_f64(sum / count as f64);
                }
                axis -= 1;
                pos[axis] += 1;
                if pos[axis] < bounds[axis].1 {
                    break;
                }
                pos[axis] = bounds[axis].0;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roi(start: &[usize], stop: &[usize]) -> Roi {
        Roi::new(start.to_vec(), stop.to_vec()).unwrap()
    }

    #[test]
    fn downscale_maps_output_to_input() {
        let mapped = input_roi_for(&roi(&[0, 0], &[32, 32]), &[128, 128], &[64, 64]);
        assert_eq!(mapped, roi(&[0, 0], &[64, 64]));
    }

    #[test]
    fn dirty_rows_halve_with_outward_rounding() {
        let mapped = output_roi_for(&roi(&[10], &[20]), &[128], &[64]);
        assert_eq!(mapped, roi(&[5], &[10]));

        let mapped = output_roi_for(&roi(&[10, 5], &[20, 21]), &[128, 128], &[64, 64]);
        assert_eq!(mapped, roi(&[5, 2], &[10, 11]));
    }

    #[test]
    fn non_integer_scales_cover_the_exact_region() {
        // 10 -> 4: output element 1 spans input [2.5, 5).
        let mapped = input_roi_for(&roi(&[1], &[2]), &[10], &[4]);
        assert_eq!(mapped, roi(&[2], &[5]));
        let mapped = output_roi_for(&roi(&[9], &[10]), &[10], &[4]);
        assert_eq!(mapped, roi(&[3], &[4]));
    }

    #[test]
    fn mismatched_ranks_map_to_everything() {
        let mapped = output_roi_for(&roi(&[0, 0, 0], &[1, 1, 1]), &[16, 16], &[8, 8]);
        assert_eq!(mapped, Roi::full(&[8, 8]));
    }

    #[test]
    fn box_filter_averages_blocks() {
        let source: Buffer = NdArray::<f32>::from_fn(&[4, 4], |i| (i[0] * 4 + i[1]) as f32).into();
        let target = roi(&[0, 0], &[2, 2]);
        let out = resample(&source, &roi(&[0, 0], &[4, 4]), &target, &[4, 4], &[2, 2]);
        // Top-left block: 0, 1, 4, 5.
        assert_eq!(out.get_f64(&[0, 0]), Some(2.5));
        assert_eq!(out.get_f64(&[1, 1]), Some(12.5));
    }

    #[test]
    fn upscale_repeats_elements() {
        let source: Buffer = NdArray::<u8>::from_vec(&[2], vec![10, 20]).unwrap().into();
        let out = resample(&source, &roi(&[0], &[2]), &roi(&[0], &[4]), &[2], &[4]);
        assert_eq!(out, Buffer::from(NdArray::<u8>::from_vec(&[4], vec![10, 10, 20, 20]).unwrap()));
    }
}
