//! Activation tensor type.
//!
//! Activations wrap an `ndarray::ArrayD<f32>`, either 4-D
//! `(batch, channel, width, height)` for convolutional inputs or 2-D
//! `(batch, feature)` for linear inputs. Only the handful of operations the
//! capture path needs are provided: batch concatenation and adaptive 2-D
//! average pooling.

use ndarray::{
    concatenate, s, Array4, ArrayD, ArrayView2, ArrayView4, Axis, Dimension, Ix2, Ix4, IxDyn,
};

use crate::error::{GradMemError, Result};

/// A dense activation tensor.
#[derive(Clone, Debug, PartialEq)]
pub struct Activation {
    data: ArrayD<f32>,
}

impl Activation {
    /// Create a tensor from a shape and row-major data.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        let got = data.len();
        let data = ArrayD::from_shape_vec(IxDyn(&shape), data)
            .map_err(|_| GradMemError::DimensionMismatch { expected, got })?;
        Ok(Self { data })
    }

    /// Create a zero tensor.
    pub fn zeros(shape: Vec<usize>) -> Self {
        Self {
            data: ArrayD::zeros(IxDyn(&shape)),
        }
    }

    /// Create a tensor by evaluating `f` at every multi-index.
    pub fn from_fn(shape: Vec<usize>, mut f: impl FnMut(&[usize]) -> f32) -> Self {
        Self {
            data: ArrayD::from_shape_fn(IxDyn(&shape), |idx| f(idx.slice())),
        }
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn array(&self) -> &ArrayD<f32> {
        &self.data
    }

    pub fn into_array(self) -> ArrayD<f32> {
        self.data
    }

    pub fn ndim(&self) -> usize {
        self.data.ndim()
    }

    /// Leading (batch) dimension, 0 for a scalar.
    pub fn batch(&self) -> usize {
        self.shape().first().copied().unwrap_or(0)
    }

    /// True if any dimension is zero.
    pub fn is_degenerate(&self) -> bool {
        self.ndim() == 0 || self.data.is_empty()
    }

    /// 4-D view, `None` for any other rank.
    pub fn view4(&self) -> Option<ArrayView4<'_, f32>> {
        self.data.view().into_dimensionality::<Ix4>().ok()
    }

    /// 2-D view, `None` for any other rank.
    pub fn view2(&self) -> Option<ArrayView2<'_, f32>> {
        self.data.view().into_dimensionality::<Ix2>().ok()
    }

    /// Concatenate `other` onto `self` along the batch dimension.
    ///
    /// All trailing dimensions must agree.
    pub fn concat_batch(&mut self, other: &Activation) -> Result<()> {
        if self.ndim() == 0
            || self.ndim() != other.ndim()
            || self.shape()[1..] != other.shape()[1..]
        {
            let row: usize = self.shape().iter().skip(1).product();
            let other_row: usize = other.shape().iter().skip(1).product();
            return Err(GradMemError::DimensionMismatch {
                expected: row,
                got: other_row,
            });
        }
        self.data = concatenate(Axis(0), &[self.data.view(), other.data.view()]).map_err(|_| {
            GradMemError::DimensionMismatch {
                expected: self.ndim(),
                got: other.ndim(),
            }
        })?;
        Ok(())
    }

    /// Adaptive average pooling over the two spatial axes of a 4-D tensor.
    ///
    /// Output cell `i` along an axis of input length `n` and output length
    /// `m` averages input indices `floor(i·n/m) .. ceil((i+1)·n/m)`, so the
    /// output always has exactly `(out_w, out_h)` spatial extent whether the
    /// input is larger or smaller.
    pub fn adaptive_avg_pool2d(&self, out_w: usize, out_h: usize) -> Result<Activation> {
        let input = self.view4().ok_or(GradMemError::DimensionMismatch {
            expected: 4,
            got: self.ndim(),
        })?;
        let (batch, channels, width, height) = input.dim();
        if width == out_w && height == out_h {
            return Ok(self.clone());
        }

        let mut out = Array4::<f32>::zeros((batch, channels, out_w, out_h));
        for (i, (w0, w1)) in pool_bins(width, out_w).into_iter().enumerate() {
            for (j, (h0, h1)) in pool_bins(height, out_h).into_iter().enumerate() {
                let cell = (w1 - w0) * (h1 - h0);
                let window = input.slice(s![.., .., w0..w1, h0..h1]);
                let mean = window.sum_axis(Axis(3)).sum_axis(Axis(2)) / cell as f32;
                out.slice_mut(s![.., .., i, j]).assign(&mean);
            }
        }
        Ok(Self {
            data: out.into_dyn(),
        })
    }
}

impl From<ArrayD<f32>> for Activation {
    fn from(data: ArrayD<f32>) -> Self {
        Self { data }
    }
}

/// `[start, end)` input ranges for each adaptive pooling output cell.
fn pool_bins(input: usize, output: usize) -> Vec<(usize, usize)> {
    (0..output)
        .map(|i| {
            let start = i * input / output;
            let end = ((i + 1) * input).div_ceil(output);
            (start, end)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(t: &Activation, idx: &[usize]) -> f32 {
        t.array()[idx]
    }

    #[test]
    fn test_new_rejects_bad_length() {
        let err = Activation::new(vec![2, 3], vec![0.0; 5]).unwrap_err();
        assert!(matches!(err, GradMemError::DimensionMismatch { expected: 6, got: 5 }));
    }

    #[test]
    fn test_from_fn_row_major() {
        let t = Activation::from_fn(vec![2, 3], |i| (i[0] * 10 + i[1]) as f32);
        let flat: Vec<f32> = t.array().iter().copied().collect();
        assert_eq!(flat, vec![0.0, 1.0, 2.0, 10.0, 11.0, 12.0]);
        assert_eq!(t.view2().unwrap()[[1, 2]], 12.0);
        assert!(t.view4().is_none());
    }

    #[test]
    fn test_concat_batch() {
        let mut a = Activation::from_fn(vec![1, 2, 2, 2], |_| 1.0);
        let b = Activation::from_fn(vec![2, 2, 2, 2], |_| 2.0);
        a.concat_batch(&b).unwrap();
        assert_eq!(a.shape(), &[3, 2, 2, 2]);
        assert_eq!(at(&a, &[0, 1, 1, 1]), 1.0);
        assert_eq!(at(&a, &[2, 0, 0, 0]), 2.0);
    }

    #[test]
    fn test_concat_batch_shape_mismatch() {
        let mut a = Activation::zeros(vec![1, 4]);
        let b = Activation::zeros(vec![1, 5]);
        assert!(a.concat_batch(&b).is_err());
        let c = Activation::zeros(vec![1, 4, 1, 1]);
        assert!(a.concat_batch(&c).is_err());
        assert_eq!(a.shape(), &[1, 4]);
    }

    #[test]
    fn test_adaptive_pool_halves() {
        // 4x4 plane of index values pooled to 2x2
        let t = Activation::from_fn(vec![1, 1, 4, 4], |i| (i[2] * 4 + i[3]) as f32);
        let p = t.adaptive_avg_pool2d(2, 2).unwrap();
        assert_eq!(p.shape(), &[1, 1, 2, 2]);
        // Top-left block {0,1,4,5}
        assert!((at(&p, &[0, 0, 0, 0]) - 2.5).abs() < 1e-6);
        // Bottom-right block {10,11,14,15}
        assert!((at(&p, &[0, 0, 1, 1]) - 12.5).abs() < 1e-6);
    }

    #[test]
    fn test_adaptive_pool_uneven() {
        let t = Activation::from_fn(vec![1, 1, 5, 3], |_| 3.0);
        let p = t.adaptive_avg_pool2d(2, 2).unwrap();
        assert_eq!(p.shape(), &[1, 1, 2, 2]);
        assert!(p.array().iter().all(|&v| (v - 3.0).abs() < 1e-6));
    }

    #[test]
    fn test_adaptive_pool_keeps_channels_apart() {
        let t = Activation::from_fn(vec![2, 3, 6, 6], |i| (i[0] * 10 + i[1]) as f32);
        let p = t.adaptive_avg_pool2d(3, 2).unwrap();
        assert_eq!(p.shape(), &[2, 3, 3, 2]);
        assert!((at(&p, &[1, 2, 2, 1]) - 12.0).abs() < 1e-6);
        assert!((at(&p, &[0, 1, 0, 0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_adaptive_pool_identity() {
        let t = Activation::from_fn(vec![2, 3, 4, 4], |i| i.iter().sum::<usize>() as f32);
        assert_eq!(t.adaptive_avg_pool2d(4, 4).unwrap(), t);
    }

    #[test]
    fn test_adaptive_pool_rejects_2d() {
        let t = Activation::zeros(vec![2, 4]);
        assert!(t.adaptive_avg_pool2d(1, 1).is_err());
    }

    #[test]
    fn test_degenerate() {
        assert!(Activation::zeros(vec![0, 256]).is_degenerate());
        assert!(!Activation::zeros(vec![1, 256]).is_degenerate());
    }
}
