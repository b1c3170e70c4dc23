//! Representation matrices: captured activations unfolded for SVD.
//!
//! For a convolution with kernel `(kh, kw)` over `C` channels and a buffer of
//! shape `(B, C, W, H)`, the matrix has `C·kh·kw` rows and one column per
//! stride-1 patch position `(x, y)` with `x < W − kh`, `y < H − kw`, for each
//! of the first `B` samples. Columns are ordered sample-major, then `x`, then
//! `y`; each column is the patch flattened channel-major (`c`, then kernel
//! row, then kernel column), which is the same order a conv weight of shape
//! `(out, C, kh, kw)` flattens to.
//!
//! For a linear layer with buffer `(B, F)` the matrix is the transpose of
//! the first `budget` rows: `F × budget`.
//!
//! Values are raw activations widened to `f64`; nothing is normalised.

use std::collections::BTreeMap;
use std::time::Instant;

use nalgebra::DMatrix;
use ndarray::s;
use tracing::{debug, info};

use crate::capture::ActivationCapture;
use crate::error::{GradMemError, Result};
use crate::layer::{conv_output_size, LayerKind, LayerSpec};
use crate::tensor::Activation;

/// Builds per-layer representation matrices from an [`ActivationCapture`].
pub struct RepresentationMatrixBuilder;

impl RepresentationMatrixBuilder {
    /// Build the matrix of every registered layer, keyed by layer name.
    pub fn build_all(capture: &ActivationCapture) -> Result<BTreeMap<String, DMatrix<f64>>> {
        info!("Computing representation matrix");
        let start = Instant::now();
        let mut mats = BTreeMap::new();
        for spec in capture.layers() {
            let act = capture
                .get(spec.name())
                .ok_or_else(|| GradMemError::InsufficientSamples {
                    layer: spec.name().to_string(),
                    needed: spec.sample_budget(),
                    got: 0,
                })?;
            mats.insert(spec.name().to_string(), Self::build(spec, act)?);
        }
        debug!(
            "Representation matrix computation time: {:?}",
            start.elapsed()
        );
        Ok(mats)
    }

    /// Build one layer's matrix from its accumulated buffer.
    pub fn build(spec: &LayerSpec, act: &Activation) -> Result<DMatrix<f64>> {
        let budget = spec.sample_budget();
        if act.batch() < budget {
            return Err(GradMemError::InsufficientSamples {
                layer: spec.name().to_string(),
                needed: budget,
                got: act.batch(),
            });
        }
        match spec.kind() {
            LayerKind::Conv {
                kernel,
                in_channels,
            } => Self::build_conv(spec.name(), act, kernel, in_channels, budget),
            LayerKind::Linear { in_features } => {
                Self::build_linear(spec.name(), act, in_features, budget)
            }
        }
    }

    fn build_conv(
        name: &str,
        act: &Activation,
        (kh, kw): (usize, usize),
        in_channels: usize,
        budget: usize,
    ) -> Result<DMatrix<f64>> {
        let input = act
            .view4()
            .filter(|v| v.dim().1 == in_channels)
            .ok_or_else(|| GradMemError::ShapeMismatch {
                layer: name.to_string(),
                expected: format!("(batch, {}, width, height)", in_channels),
                got: act.shape().to_vec(),
            })?;
        let (_, _, width, height) = input.dim();
        let (pos_w, pos_h) = conv_output_size((width, height), (kh, kw), (0, 0), (1, 1));
        let rows = in_channels * kh * kw;
        let cols = budget * pos_w * pos_h;
        if rows == 0 || cols == 0 {
            return Err(GradMemError::EmptyMatrix(name.to_string()));
        }

        let mut mat = DMatrix::<f64>::zeros(rows, cols);
        let mut k = 0;
        for b in 0..budget {
            for x in 0..pos_w {
                for y in 0..pos_h {
                    // Iterates c, then kernel row, then kernel column
                    let patch = input.slice(s![b, .., x..x + kh, y..y + kw]);
                    for (row, &v) in patch.iter().enumerate() {
                        mat[(row, k)] = v as f64;
                    }
                    k += 1;
                }
            }
        }
        Ok(mat)
    }

    fn build_linear(
        name: &str,
        act: &Activation,
        in_features: usize,
        budget: usize,
    ) -> Result<DMatrix<f64>> {
        let input = act
            .view2()
            .filter(|v| v.ncols() == in_features)
            .ok_or_else(|| GradMemError::ShapeMismatch {
                layer: name.to_string(),
                expected: format!("(batch, {})", in_features),
                got: act.shape().to_vec(),
            })?;
        if in_features == 0 || budget == 0 {
            return Err(GradMemError::EmptyMatrix(name.to_string()));
        }
        Ok(DMatrix::from_fn(in_features, budget, |f, b| input[[b, f]] as f64))
    }
}
