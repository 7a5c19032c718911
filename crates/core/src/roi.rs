//! Regions of interest and slicing helpers.
//!
//! A [`Roi`] is a bounded, half-open box `[start, stop)` with one coordinate
//! pair per axis. A [`SliceSpec`] is its unresolved form: stops may be left
//! open and are filled in from a slot's shape with [`SliceSpec::resolve`].

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Number of elements along each axis.
pub type Shape = Vec<usize>;

/// Bounded half-open N-dimensional region.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Roi {
    start: Vec<usize>,
    stop: Vec<usize>,
}

impl Roi {
    pub fn new(start: Vec<usize>, stop: Vec<usize>) -> Result<Self, ConfigurationError> {
        if start.len() != stop.len() {
            return Err(ConfigurationError::InvalidRoi(format!(
                "start has rank {} but stop has rank {}",
                start.len(),
                stop.len()
            )));
        }
        if let Some(axis) = (0..start.len()).find(|&i| start[i] > stop[i]) {
            return Err(ConfigurationError::InvalidRoi(format!(
                "start {} exceeds stop {} on axis {axis}",
                start[axis], stop[axis]
            )));
        }
        Ok(Self { start, stop })
    }

    /// The region covering a whole array of `shape`.
    pub fn full(shape: &[usize]) -> Self {
        Self {
            start: vec![0; shape.len()],
            stop: shape.to_vec(),
        }
    }

    pub fn rank(&self) -> usize {
        self.start.len()
    }

    pub fn start(&self) -> &[usize] {
        &self.start
    }

    pub fn stop(&self) -> &[usize] {
        &self.stop
    }

    pub fn axis(&self, axis: usize) -> Range<usize> {
        self.start[axis]..self.stop[axis]
    }

    pub fn shape(&self) -> Shape {
        self.start
            .iter()
            .zip(&self.stop)
            .map(|(a, b)| b - a)
            .collect()
    }

    /// Number of elements covered.
    pub fn volume(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.start.iter().zip(&self.stop).any(|(a, b)| a == b)
    }

    pub fn contains(&self, other: &Roi) -> bool {
        self.rank() == other.rank()
            && (0..self.rank())
                .all(|i| self.start[i] <= other.start[i] && other.stop[i] <= self.stop[i])
    }

    pub fn intersection(&self, other: &Roi) -> Option<Roi> {
        if self.rank() != other.rank() {
            return None;
        }
        let start: Vec<usize> = (0..self.rank())
            .map(|i| self.start[i].max(other.start[i]))
            .collect();
        let stop: Vec<usize> = (0..self.rank())
            .map(|i| self.stop[i].min(other.stop[i]))
            .collect();
        if start.iter().zip(&stop).any(|(a, b)| a >= b) {
            return None;
        }
        Some(Roi { start, stop })
    }

    /// Express `self` in coordinates local to `outer` (which must contain it).
    pub fn relative_to(&self, outer: &Roi) -> Result<Roi, ConfigurationError> {
        if !outer.contains(self) {
            return Err(ConfigurationError::InvalidRoi(format!(
                "{self} is not inside {outer}"
            )));
        }
        Ok(Roi {
            start: (0..self.rank()).map(|i| self.start[i] - outer.start[i]).collect(),
            stop: (0..self.rank()).map(|i| self.stop[i] - outer.start[i]).collect(),
        })
    }

    /// Shift by `offset` along every axis.
    pub fn translate(&self, offset: &[usize]) -> Roi {
        Roi {
            start: self.start.iter().zip(offset).map(|(a, o)| a + o).collect(),
            stop: self.stop.iter().zip(offset).map(|(b, o)| b + o).collect(),
        }
    }

    /// Fails unless the region lies inside an array of `shape`.
    pub fn check_within(&self, shape: &[usize]) -> Result<(), ConfigurationError> {
        if self.rank() != shape.len() {
            return Err(ConfigurationError::InvalidRoi(format!(
                "{self} has rank {} but the data has rank {}",
                self.rank(),
                shape.len()
            )));
        }
        if !Roi::full(shape).contains(self) {
            return Err(ConfigurationError::InvalidRoi(format!(
                "{self} exceeds shape {shape:?}"
            )));
        }
        Ok(())
    }

    /// Cut the region into at most `pieces` contiguous slabs along `axis`.
    /// Empty slabs are never produced.
    pub fn split_axis(&self, axis: usize, pieces: usize) -> Vec<Roi> {
        let extent = self.stop[axis] - self.start[axis];
        let pieces = pieces.clamp(1, extent.max(1));
        let base = extent / pieces;
        let extra = extent % pieces;
        let mut out = Vec::with_capacity(pieces);
        let mut cursor = self.start[axis];
        for i in 0..pieces {
            let len = base + usize::from(i < extra);
            if len == 0 {
                continue;
            }
            let mut piece = self.clone();
            piece.start[axis] = cursor;
            piece.stop[axis] = cursor + len;
            cursor += len;
            out.push(piece);
        }
        if out.is_empty() {
            out.push(self.clone());
        }
        out
    }
}

impl fmt::Display for Roi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}, {:?})", self.start, self.stop)
    }
}

/// One axis of a [`SliceSpec`]; `stop: None` means "to the end".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisSlice {
    pub start: usize,
    pub stop: Option<usize>,
}

impl From<Range<usize>> for AxisSlice {
    fn from(r: Range<usize>) -> Self {
        Self {
            start: r.start,
            stop: Some(r.end),
        }
    }
}

/// A possibly-unbounded slicing, resolved against a shape when requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceSpec(pub Vec<AxisSlice>);

impl SliceSpec {
    /// Everything, on `rank` axes.
    pub fn all(rank: usize) -> Self {
        Self(vec![
            AxisSlice {
                start: 0,
                stop: None,
            };
            rank
        ])
    }

    pub fn from_ranges(ranges: impl IntoIterator<Item = Range<usize>>) -> Self {
        Self(ranges.into_iter().map(AxisSlice::from).collect())
    }

    /// Do all axes have an upper bound?
    pub fn is_bounded(&self) -> bool {
        self.0.iter().all(|s| s.stop.is_some())
    }

    /// Shape selected by this slicing; fails when any axis is unbounded.
    pub fn shape(&self) -> Result<Shape, ConfigurationError> {
        self.0
            .iter()
            .map(|s| match s.stop {
                Some(stop) if stop >= s.start => Ok(stop - s.start),
                Some(stop) => Err(ConfigurationError::InvalidRoi(format!(
                    "slice {}..{stop} is reversed",
                    s.start
                ))),
                None => Err(ConfigurationError::InvalidRoi(format!(
                    "slicing {:?} is not bounded",
                    self.0
                ))),
            })
            .collect()
    }

    /// Bind open stops to `shape` and check the result fits inside it.
    pub fn resolve(&self, shape: &[usize]) -> Result<Roi, ConfigurationError> {
        if self.0.len() != shape.len() {
            return Err(ConfigurationError::InvalidRoi(format!(
                "slicing has rank {} but the data has rank {}",
                self.0.len(),
                shape.len()
            )));
        }
        let start = self.0.iter().map(|s| s.start).collect();
        let stop = self
            .0
            .iter()
            .zip(shape)
            .map(|(s, &extent)| s.stop.unwrap_or(extent))
            .collect();
        let roi = Roi::new(start, stop)?;
        roi.check_within(shape)?;
        Ok(roi)
    }
}
