//! Flattened gradients.
//!
//! A [`GradientVector`] is every trainable parameter's gradient concatenated
//! in parameter order. [`GradientLayout`] remembers which slice belongs to
//! which parameter so a recombined vector can be scattered back.

use crate::error::{GradMemError, Result};

/// A model parameter with its gradient slot.
#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    name: String,
    shape: Vec<usize>,
    requires_grad: bool,
    /// Row-major gradient, one entry per element of `shape`.
    grad: Vec<f32>,
}

impl Parameter {
    /// A trainable parameter with a zeroed gradient.
    pub fn new(name: impl Into<String>, shape: Vec<usize>) -> Self {
        let numel = shape.iter().product();
        Self {
            name: name.into(),
            shape,
            requires_grad: true,
            grad: vec![0.0; numel],
        }
    }

    /// A parameter excluded from gradient flattening.
    pub fn frozen(name: impl Into<String>, shape: Vec<usize>) -> Self {
        Self {
            requires_grad: false,
            ..Self::new(name, shape)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn grad(&self) -> &[f32] {
        &self.grad
    }

    pub fn grad_mut(&mut self) -> &mut [f32] {
        &mut self.grad
    }

    /// Add `delta` into the gradient (backward-pass accumulation).
    pub fn accumulate_grad(&mut self, delta: &[f32]) -> Result<()> {
        if delta.len() != self.grad.len() {
            return Err(GradMemError::DimensionMismatch {
                expected: self.grad.len(),
                got: delta.len(),
            });
        }
        for (g, d) in self.grad.iter_mut().zip(delta) {
            *g += d;
        }
        Ok(())
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }
}

/// A flattened gradient.
#[derive(Clone, Debug, PartialEq)]
pub struct GradientVector {
    data: Vec<f32>,
}

impl GradientVector {
    pub fn from_vec(data: Vec<f32>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Inner product, accumulated in `f64`.
    pub fn dot(&self, other: &GradientVector) -> f64 {
        assert_eq!(self.len(), other.len(), "Dimension mismatch in dot product");
        self.data
            .iter()
            .zip(&other.data)
            .map(|(&a, &b)| a as f64 * b as f64)
            .sum()
    }

    pub fn norm_squared(&self) -> f64 {
        self.dot(self)
    }

    pub fn norm(&self) -> f64 {
        self.norm_squared().sqrt()
    }

    /// `a·self + b·other`.
    pub fn combine(&self, a: f64, other: &GradientVector, b: f64) -> GradientVector {
        assert_eq!(self.len(), other.len(), "Dimension mismatch in combine");
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(&x, &y)| (a * x as f64 + b * y as f64) as f32)
            .collect();
        Self { data }
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }
}

/// Per-parameter slice sizes of a flattened gradient, in parameter order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GradientLayout {
    entries: Vec<(String, usize)>,
}

impl GradientLayout {
    /// Layout of the trainable parameters in `params`.
    pub fn of(params: &[Parameter]) -> Self {
        Self {
            entries: params
                .iter()
                .filter(|p| p.requires_grad())
                .map(|p| (p.name().to_string(), p.numel()))
                .collect(),
        }
    }

    /// Total number of flattened elements.
    pub fn len(&self) -> usize {
        self.entries.iter().map(|(_, n)| n).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> &[(String, usize)] {
        &self.entries
    }

    /// Concatenate the gradients of every trainable parameter.
    pub fn flatten(&self, params: &[Parameter]) -> Result<GradientVector> {
        self.check(params)?;
        let mut data = Vec::with_capacity(self.len());
        for p in params.iter().filter(|p| p.requires_grad()) {
            data.extend_from_slice(p.grad());
        }
        Ok(GradientVector { data })
    }

    /// Overwrite each trainable parameter's gradient with its slice of `grad`.
    pub fn scatter(&self, params: &mut [Parameter], grad: &GradientVector) -> Result<()> {
        self.check(params)?;
        if grad.len() != self.len() {
            return Err(GradMemError::LayoutMismatch(format!(
                "vector has {} elements, layout covers {}",
                grad.len(),
                self.len()
            )));
        }
        let mut offset = 0;
        for p in params.iter_mut().filter(|p| p.requires_grad()) {
            let n = p.numel();
            p.grad_mut().copy_from_slice(&grad.data[offset..offset + n]);
            offset += n;
        }
        Ok(())
    }

    fn check(&self, params: &[Parameter]) -> Result<()> {
        let mut trainable = params.iter().filter(|p| p.requires_grad());
        for (name, numel) in &self.entries {
            let p = trainable.next().ok_or_else(|| {
                GradMemError::LayoutMismatch(format!("parameter '{}' is missing", name))
            })?;
            if p.name() != name || p.numel() != *numel || p.grad().len() != *numel {
                return Err(GradMemError::LayoutMismatch(format!(
                    "expected '{}' with {} elements, found '{}' with {} (gradient {})",
                    name,
                    numel,
                    p.name(),
                    p.numel(),
                    p.grad().len()
                )));
            }
        }
        if let Some(extra) = trainable.next() {
            return Err(GradMemError::LayoutMismatch(format!(
                "unexpected parameter '{}'",
                extra.name()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Vec<Parameter> {
        let mut ps = vec![
            Parameter::new("conv.weight", vec![2, 1, 2, 2]),
            Parameter::frozen("bn.running_mean", vec![2]),
            Parameter::new("conv.bias", vec![2]),
            Parameter::new("fc.weight", vec![3, 2]),
        ];
        let mut v = 0.0;
        for p in ps.iter_mut() {
            for g in p.grad_mut() {
                v += 1.0;
                *g = v;
            }
        }
        ps
    }

    #[test]
    fn test_flatten_skips_frozen() {
        let ps = params();
        let layout = GradientLayout::of(&ps);
        assert_eq!(layout.len(), 8 + 2 + 6);
        let flat = layout.flatten(&ps).unwrap();
        assert_eq!(flat.len(), 16);
        // conv.weight 1..=8, then conv.bias after the frozen 9, 10
        assert_eq!(flat.as_slice()[7], 8.0);
        assert_eq!(flat.as_slice()[8], 11.0);
    }

    #[test]
    fn test_scatter_restores_slices() {
        let mut ps = params();
        let layout = GradientLayout::of(&ps);
        let replacement = GradientVector::from_vec((0..16).map(|i| -(i as f32)).collect());
        layout.scatter(&mut ps, &replacement).unwrap();

        assert_eq!(ps[0].shape(), &[2, 1, 2, 2]);
        assert_eq!(ps[0].grad()[7], -7.0);
        assert_eq!(ps[1].grad(), &[9.0, 10.0], "frozen parameter untouched");
        assert_eq!(ps[2].grad(), &[-8.0, -9.0]);
        assert_eq!(ps[3].grad()[5], -15.0);

        let back = layout.flatten(&ps).unwrap();
        assert_eq!(back, replacement);
    }

    #[test]
    fn test_scatter_overwrites_not_accumulates() {
        let mut ps = params();
        let layout = GradientLayout::of(&ps);
        let ones = GradientVector::from_vec(vec![1.0; 16]);
        layout.scatter(&mut ps, &ones).unwrap();
        layout.scatter(&mut ps, &ones).unwrap();
        assert!(ps[3].grad().iter().all(|&g| g == 1.0));
    }

    #[test]
    fn test_scatter_length_mismatch() {
        let mut ps = params();
        let layout = GradientLayout::of(&ps);
        let short = GradientVector::from_vec(vec![0.0; 15]);
        assert!(matches!(
            layout.scatter(&mut ps, &short),
            Err(GradMemError::LayoutMismatch(_))
        ));
    }

    #[test]
    fn test_layout_detects_reordering() {
        let ps = params();
        let layout = GradientLayout::of(&ps);
        let mut swapped = ps.clone();
        swapped.swap(0, 3);
        assert!(layout.flatten(&swapped).is_err());
    }

    #[test]
    fn test_dot_norm_combine() {
        let a = GradientVector::from_vec(vec![3.0, 4.0]);
        let b = GradientVector::from_vec(vec![1.0, -1.0]);
        assert_eq!(a.norm(), 5.0);
        assert_eq!(a.dot(&b), -1.0);
        let c = a.combine(2.0, &b, 3.0);
        assert_eq!(c.as_slice(), &[9.0, 5.0]);
    }

    #[test]
    fn test_accumulate_and_zero() {
        let mut p = Parameter::new("w", vec![2]);
        p.accumulate_grad(&[1.0, 2.0]).unwrap();
        p.accumulate_grad(&[1.0, 2.0]).unwrap();
        assert_eq!(p.grad(), &[2.0, 4.0]);
        p.zero_grad();
        assert_eq!(p.grad(), &[0.0, 0.0]);
        assert!(p.accumulate_grad(&[1.0]).is_err());
    }
}
