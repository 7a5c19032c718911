//! Owned N-dimensional buffers.
//!
//! [`NdArray`] is a plain row-major array with region copy in and out.
//! [`Buffer`] tags one with its element type so slots can carry data of any
//! supported dtype behind a single type.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::roi::{Roi, Shape};

/// Element type of a slot's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    U8,
    U16,
    U32,
    F32,
    F64,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::U8 => "uint8",
            DType::U16 => "uint16",
            DType::U32 => "uint32",
            DType::F32 => "float32",
            DType::F64 => "float64",
        };
        f.write_str(name)
    }
}

/// Scalar types storable in a [`Buffer`].
pub trait Element: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    const DTYPE: DType;

    fn to_f64(self) -> f64;

    /// Convert back from `f64`, rounding and saturating for integer types.
    fn from_f64(v: f64) -> Self;

    fn into_buffer(array: NdArray<Self>) -> Buffer;

    fn array_ref(buffer: &Buffer) -> Option<&NdArray<Self>>;

    fn array_mut(buffer: &mut Buffer) -> Option<&mut NdArray<Self>>;
}

macro_rules! impl_element {
    ($ty:ty, $variant:ident, int) => {
        impl_element!(@impl $ty, $variant, |v: f64| v.round().clamp(<$ty>::MIN as f64, <$ty>::MAX as f64) as $ty);
    };
    ($ty:ty, $variant:ident, float) => {
        impl_element!(@impl $ty, $variant, |v: f64| v as $ty);
    };
    (@impl $ty:ty, $variant:ident, $conv:expr) => {
        impl Element for $ty {
            const DTYPE: DType = DType::$variant;

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_f64(v: f64) -> Self {
                let conv = $conv;
                conv(v)
            }

            fn into_buffer(array: NdArray<Self>) -> Buffer {
                Buffer::$variant(array)
            }

            fn array_ref(buffer: &Buffer) -> Option<&NdArray<Self>> {
                match buffer {
                    Buffer::$variant(a) => Some(a),
                    _ => None,
                }
            }

            fn array_mut(buffer: &mut Buffer) -> Option<&mut NdArray<Self>> {
                match buffer {
                    Buffer::$variant(a) => Some(a),
                    _ => None,
                }
            }
        }
    };
}

impl_element!(u8, U8, int);
impl_element!(u16, U16, int);
impl_element!(u32, U32, int);
impl_element!(f32, F32, float);
impl_element!(f64, F64, float);

/// Row-major strides for `shape`, in elements.
pub fn strides(shape: &[usize]) -> Vec<usize> {
    let mut s = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        s[i] = s[i + 1] * shape[i + 1];
    }
    s
}

/// Call `f` with the index of every innermost row of a box of `extent`
/// (all axes but the last).
fn for_each_row(extent: &[usize], mut f: impl FnMut(&[usize])) {
    if extent.contains(&0) {
        return;
    }
    let outer = extent.len().saturating_sub(1);
    let mut idx = vec![0usize; outer];
    loop {
        f(&idx);
        let mut axis = outer;
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            idx[axis] += 1;
            if idx[axis] < extent[axis] {
                break;
            }
            idx[axis] = 0;
        }
    }
}

/// Owned row-major N-d array.
#[derive(Clone, PartialEq)]
pub struct NdArray<T> {
    shape: Shape,
    data: Vec<T>,
}

impl<T: fmt::Debug> fmt::Debug for NdArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NdArray")
            .field("shape", &self.shape)
            .field("len", &self.data.len())
            .finish()
    }
}

impl<T: Element> NdArray<T> {
    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            data: vec![T::default(); shape.iter().product()],
        }
    }

    pub fn from_vec(shape: &[usize], data: Vec<T>) -> Result<Self, ConfigurationError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(ConfigurationError::UnsupportedShape(format!(
                "shape {shape:?} needs {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    /// Build an array by evaluating `f` at every index.
    pub fn from_fn(shape: &[usize], mut f: impl FnMut(&[usize]) -> T) -> Self {
        let mut data = Vec::with_capacity(shape.iter().product());
        let last = shape.last().copied().unwrap_or(1);
        for_each_row(shape, |outer| {
            let mut idx = outer.to_vec();
            idx.push(0);
            for i in 0..last {
                if let Some(l) = idx.last_mut() {
                    *l = i;
                }
                data.push(f(&idx[..shape.len()]));
            }
        });
        Self {
            shape: shape.to_vec(),
            data,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    fn offset(&self, index: &[usize]) -> Option<usize> {
        if index.len() != self.shape.len() || index.iter().zip(&self.shape).any(|(i, s)| i >= s) {
            return None;
        }
        Some(
            index
                .iter()
                .zip(strides(&self.shape))
                .map(|(i, s)| i * s)
                .sum(),
        )
    }

    pub fn get(&self, index: &[usize]) -> Option<T> {
        self.offset(index).map(|o| self.data[o])
    }

    pub fn set(&mut self, index: &[usize], value: T) -> bool {
        match self.offset(index) {
            Some(o) => {
                self.data[o] = value;
                true
            }
            None => false,
        }
    }

    /// Copy `roi` (in this array's coordinates) out into a new array.
    pub fn region(&self, roi: &Roi) -> Result<Self, ConfigurationError> {
        roi.check_within(&self.shape)?;
        let mut out = Self::zeros(&roi.shape());
        let zero = vec![0; roi.rank()];
        copy_box(
            &self.data,
            &self.shape,
            roi.start(),
            &mut out.data,
            &roi.shape(),
            &zero,
            &roi.shape(),
        );
        Ok(out)
    }

    /// Overwrite `roi` (in this array's coordinates) with `src`, whose shape
    /// must equal the region's.
    pub fn write_region(&mut self, roi: &Roi, src: &NdArray<T>) -> Result<(), ConfigurationError> {
        roi.check_within(&self.shape)?;
        if roi.shape() != src.shape {
            return Err(ConfigurationError::InvalidRoi(format!(
                "region {roi} does not match source shape {:?}",
                src.shape
            )));
        }
        let zero = vec![0; roi.rank()];
        copy_box(
            &src.data,
            &src.shape,
            &zero,
            &mut self.data,
            &self.shape,
            roi.start(),
            &roi.shape(),
        );
        Ok(())
    }
}

fn copy_box<T: Copy>(
    src: &[T],
    src_shape: &[usize],
    src_start: &[usize],
    dst: &mut [T],
    dst_shape: &[usize],
    dst_start: &[usize],
    extent: &[usize],
) {
    let ss = strides(src_shape);
    let ds = strides(dst_shape);
    let rank = extent.len();
    let row = extent.last().copied().unwrap_or(1);
    for_each_row(extent, |idx| {
        let mut so = 0;
        let mut d = 0;
        for (axis, &i) in idx.iter().enumerate() {
            so += (src_start[axis] + i) * ss[axis];
            d += (dst_start[axis] + i) * ds[axis];
        }
        if rank > 0 {
            so += src_start[rank - 1] * ss[rank - 1];
            d += dst_start[rank - 1] * ds[rank - 1];
        }
        dst[d..d + row].copy_from_slice(&src[so..so + row]);
    });
}

/// Dtype-tagged array handed between operators.
#[derive(Debug, Clone, PartialEq)]
pub enum Buffer {
    U8(NdArray<u8>),
    U16(NdArray<u16>),
    U32(NdArray<u32>),
    F32(NdArray<f32>),
    F64(NdArray<f64>),
}

/// Run `$body` with `$arr` bound to the typed array inside a [`Buffer`]
/// (or `&mut Buffer`), whatever its dtype.
#[macro_export]
macro_rules! with_buffer {
    ($buffer:expr, $arr:ident => $body:expr) => {
        match $buffer {
            $crate::array::Buffer::U8($arr) => $body,
            $crate::array::Buffer::U16($arr) => $body,
            $crate::array::Buffer::U32($arr) => $body,
            $crate::array::Buffer::F32($arr) => $body,
            $crate::array::Buffer::F64($arr) => $body,
        }
    };
}

impl Buffer {
    pub fn zeros(dtype: DType, shape: &[usize]) -> Self {
        match dtype {
            DType::U8 => Buffer::U8(NdArray::zeros(shape)),
            DType::U16 => Buffer::U16(NdArray::zeros(shape)),
            DType::U32 => Buffer::U32(NdArray::zeros(shape)),
            DType::F32 => Buffer::F32(NdArray::zeros(shape)),
            DType::F64 => Buffer::F64(NdArray::zeros(shape)),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Buffer::U8(_) => DType::U8,
            Buffer::U16(_) => DType::U16,
            Buffer::U32(_) => DType::U32,
            Buffer::F32(_) => DType::F32,
            Buffer::F64(_) => DType::F64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        with_buffer!(self, a => a.shape())
    }

    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn typed<T: Element>(&self) -> Option<&NdArray<T>> {
        T::array_ref(self)
    }

    pub fn typed_mut<T: Element>(&mut self) -> Option<&mut NdArray<T>> {
        T::array_mut(self)
    }

    pub fn get_f64(&self, index: &[usize]) -> Option<f64> {
        with_buffer!(self, a => a.get(index).map(Element::to_f64))
    }

    /// Sum of all elements as `f64`.
    pub fn sum(&self) -> f64 {
        with_buffer!(self, a => a.as_slice().iter().map(|v| v.to_f64()).sum())
    }

    pub fn region(&self, roi: &Roi) -> Result<Buffer, ConfigurationError> {
        Ok(with_buffer!(self, a => Element::into_buffer(a.region(roi)?)))
    }

    /// Overwrite `roi` with `src`; dtypes must match.
    pub fn write_region(&mut self, roi: &Roi, src: &Buffer) -> Result<(), ConfigurationError> {
        let expected = self.dtype();
        let mismatch = || ConfigurationError::DTypeMismatch {
            expected: expected.to_string(),
            actual: src.dtype().to_string(),
        };
        match self {
            Buffer::U8(a) => a.write_region(roi, src.typed().ok_or_else(mismatch)?),
            Buffer::U16(a) => a.write_region(roi, src.typed().ok_or_else(mismatch)?),
            Buffer::U32(a) => a.write_region(roi, src.typed().ok_or_else(mismatch)?),
            Buffer::F32(a) => a.write_region(roi, src.typed().ok_or_else(mismatch)?),
            Buffer::F64(a) => a.write_region(roi, src.typed().ok_or_else(mismatch)?),
        }
    }
}

impl<T: Element> From<NdArray<T>> for Buffer {
    fn from(array: NdArray<T>) -> Self {
        T::into_buffer(array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(shape: &[usize]) -> NdArray<u32> {
        let mut n = 0;
        NdArray::from_fn(shape, |_| {
            n += 1;
            n - 1
        })
    }

    #[test]
    fn strides_are_row_major() {
        assert_eq!(strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(strides(&[7]), vec![1]);
        assert!(strides(&[]).is_empty());
    }

    #[test]
    fn from_fn_visits_in_row_major_order() {
        let a = NdArray::<u32>::from_fn(&[2, 3], |idx| (idx[0] * 10 + idx[1]) as u32);
        assert_eq!(a.as_slice(), &[0, 1, 2, 10, 11, 12]);
    }

    #[test]
    fn region_round_trip() {
        let a = ramp(&[4, 5]);
        let roi = Roi::new(vec![1, 2], vec![3, 5]).unwrap();
        let sub = a.region(&roi).unwrap();
        assert_eq!(sub.shape(), &[2, 3]);
        assert_eq!(sub.as_slice(), &[7, 8, 9, 12, 13, 14]);

        let mut b = NdArray::<u32>::zeros(&[4, 5]);
        b.write_region(&roi, &sub).unwrap();
        assert_eq!(b.get(&[2, 4]), Some(14));
        assert_eq!(b.get(&[0, 0]), Some(0));
    }

    #[test]
    fn region_out_of_bounds_is_rejected() {
        let a = ramp(&[4, 5]);
        let roi = Roi::new(vec![0, 0], vec![5, 1]).unwrap();
        assert!(a.region(&roi).is_err());
    }

    #[test]
    fn buffer_write_checks_dtype() {
        let mut dst = Buffer::zeros(DType::F32, &[2, 2]);
        let src = Buffer::zeros(DType::U8, &[1, 1]);
        let roi = Roi::new(vec![0, 0], vec![1, 1]).unwrap();
        assert!(matches!(
            dst.write_region(&roi, &src),
            Err(ConfigurationError::DTypeMismatch { .. })
        ));
    }

    #[test]
    fn integer_conversion_saturates() {
        assert_eq!(u8::from_f64(300.0), 255);
        assert_eq!(u8::from_f64(-4.0), 0);
        assert_eq!(u16::from_f64(2.5), 3);
    }
}
