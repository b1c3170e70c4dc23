//! Gradient Projection Memory: per-layer subspaces of "do not disturb"
//! activation directions.
//!
//! Each layer's basis starts empty. The first [`SubspaceMemory::update`]
//! for a layer keeps the leading left singular vectors of its
//! representation matrix whose cumulative energy ratio stays below the
//! layer's threshold. Later updates project the new representation onto
//! the orthogonal complement of the stored basis and greedily append
//! residual directions until the total explained energy reaches the
//! threshold. Bases only grow, and never beyond the row dimension.
//!
//! # Usage
//!
//! ```rust
//! use gradmem::memory::SubspaceMemory;
//! use nalgebra::DMatrix;
//! use std::collections::{BTreeMap, HashMap};
//!
//! let mut gpm = SubspaceMemory::new();
//! let mut mats = BTreeMap::new();
//! mats.insert("fc".to_string(), DMatrix::<f64>::identity(8, 8) * 2.0);
//! let thresholds = HashMap::from([("fc".to_string(), 0.5)]);
//!
//! gpm.update(&mats, &thresholds)?;
//! assert_eq!(gpm.retained("fc"), 3); // 3/8 < 0.5 <= 4/8
//! # Ok::<(), gradmem::GradMemError>(())
//! ```

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GradMemError, Result};
use crate::linalg::{energy_rank, hstack, left_svd};
use crate::report::Reporter;

/// Serializable form of one layer's basis.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BasisSnapshot {
    pub rows: usize,
    pub cols: usize,
    /// Column-major: column j occupies `data[j * rows .. (j + 1) * rows]`.
    pub data: Vec<f64>,
}

/// Serializable snapshot of every populated layer.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SubspaceSnapshot {
    pub layers: BTreeMap<String, BasisSnapshot>,
}

/// What an update did to one layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerUpdate {
    /// First task: basis set to the leading `retained` directions (possibly 0).
    Initialized { retained: usize },
    /// Later task: `added` residual directions appended.
    Extended { added: usize, retained: usize },
    /// Threshold already met by the stored basis; nothing appended.
    Unchanged,
    /// Representation matrix carried no energy.
    Degenerate,
}

/// Per-layer orthonormal bases.
#[derive(Clone, Debug, Default)]
pub struct SubspaceMemory {
    bases: BTreeMap<String, DMatrix<f64>>,
    reporter: Reporter,
}

impl SubspaceMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Memory that routes its summary through `reporter`.
    pub fn with_reporter(reporter: Reporter) -> Self {
        Self {
            bases: BTreeMap::new(),
            reporter,
        }
    }

    // --- Accessors ---

    /// Stored basis for a layer, `None` while the layer is empty.
    pub fn basis(&self, layer: &str) -> Option<&DMatrix<f64>> {
        self.bases.get(layer)
    }

    /// Number of retained directions for a layer (0 when empty).
    pub fn retained(&self, layer: &str) -> usize {
        self.bases.get(layer).map_or(0, |b| b.ncols())
    }

    pub fn is_empty(&self) -> bool {
        self.bases.is_empty()
    }

    pub fn layers(&self) -> impl Iterator<Item = (&str, &DMatrix<f64>)> {
        self.bases.iter().map(|(k, v)| (k.as_str(), v))
    }

    // --- Core methods ---

    /// Fold a task's representation matrices into the stored bases.
    ///
    /// `thresholds` must hold an energy ratio for every layer in `mats`.
    pub fn update(
        &mut self,
        mats: &BTreeMap<String, DMatrix<f64>>,
        thresholds: &HashMap<String, f64>,
    ) -> Result<BTreeMap<String, LayerUpdate>> {
        let mut outcome = BTreeMap::new();
        for (layer, mat) in mats {
            let threshold = *thresholds
                .get(layer)
                .ok_or_else(|| GradMemError::MissingThreshold(layer.clone()))?;
            let start = Instant::now();
            let result = self.update_layer(layer, mat, threshold)?;
            if self.reporter.is_primary() {
                debug!("SVD time for {}: {:?}", layer, start.elapsed());
            }
            outcome.insert(layer.clone(), result);
        }
        self.log_summary();
        Ok(outcome)
    }

    fn update_layer(
        &mut self,
        layer: &str,
        mat: &DMatrix<f64>,
        threshold: f64,
    ) -> Result<LayerUpdate> {
        if mat.nrows() == 0 || mat.ncols() == 0 {
            return Err(GradMemError::EmptyMatrix(layer.to_string()));
        }

        let Some(existing) = self.bases.get(layer) else {
            let svd = left_svd(mat)
                .ok_or_else(|| GradMemError::SvdNotConverged(layer.to_string()))?;
            if svd.energy() <= 0.0 {
                debug!("Zero-energy representation for layer {}, basis left empty", layer);
                return Ok(LayerUpdate::Degenerate);
            }
            let r = energy_rank(&svd.s, threshold);
            if r > 0 {
                self.bases.insert(layer.to_string(), svd.leading(r));
            }
            return Ok(LayerUpdate::Initialized { retained: r });
        };

        if existing.nrows() != mat.nrows() {
            return Err(GradMemError::DimensionMismatch {
                expected: existing.nrows(),
                got: mat.nrows(),
            });
        }

        let total = mat.norm_squared();
        if total <= 0.0 {
            debug!("Zero-energy representation for layer {}, basis unchanged", layer);
            return Ok(LayerUpdate::Degenerate);
        }

        // Residual after removing what the stored basis already reconstructs
        let projected = existing * (existing.transpose() * mat);
        let residual = mat - projected;
        let svd = left_svd(&residual)
            .ok_or_else(|| GradMemError::SvdNotConverged(layer.to_string()))?;

        let mut accumulated = (total - svd.energy()) / total;
        let mut r = 0;
        for s in &svd.s {
            if accumulated >= threshold {
                break;
            }
            accumulated += s * s / total;
            r += 1;
        }
        if r == 0 {
            debug!("Skip updating GPM for layer: {}", layer);
            return Ok(LayerUpdate::Unchanged);
        }

        let mut grown = hstack(existing, &svd.leading(r));
        if grown.ncols() > grown.nrows() {
            grown = grown.columns(0, grown.nrows()).into_owned();
        }
        let added = grown.ncols() - existing.ncols();
        let retained = grown.ncols();
        self.bases.insert(layer.to_string(), grown);
        Ok(LayerUpdate::Extended { added, retained })
    }

    /// Remove from a weight gradient its component inside the layer's basis.
    ///
    /// `grad` is read as a row-major `(grad.len() / rows) × rows` matrix, the
    /// layout of a conv weight `(out, C, kh, kw)` or linear weight
    /// `(out, in)`; each row `g` becomes `g − g·U·Uᵀ`. Layers with no basis
    /// are left untouched.
    pub fn project_gradient(&self, layer: &str, grad: &mut [f32]) -> Result<()> {
        let Some(basis) = self.bases.get(layer) else {
            return Ok(());
        };
        let rows = basis.nrows();
        if grad.len() % rows != 0 {
            return Err(GradMemError::DimensionMismatch {
                expected: rows,
                got: grad.len(),
            });
        }
        let out = grad.len() / rows;
        let g = DMatrix::from_fn(out, rows, |o, i| grad[o * rows + i] as f64);
        let inside = (&g * basis) * basis.transpose();
        for o in 0..out {
            for i in 0..rows {
                grad[o * rows + i] -= inside[(o, i)] as f32;
            }
        }
        Ok(())
    }

    /// Export the stored bases.
    pub fn snapshot(&self) -> SubspaceSnapshot {
        SubspaceSnapshot {
            layers: self
                .bases
                .iter()
                .map(|(name, basis)| {
                    (
                        name.clone(),
                        BasisSnapshot {
                            rows: basis.nrows(),
                            cols: basis.ncols(),
                            data: basis.as_slice().to_vec(),
                        },
                    )
                })
                .collect(),
        }
    }

    /// Restore from a snapshot.
    pub fn from_snapshot(snap: SubspaceSnapshot, reporter: Reporter) -> Result<Self> {
        let mut bases = BTreeMap::new();
        for (name, b) in snap.layers {
            if b.data.len() != b.rows * b.cols {
                return Err(GradMemError::DimensionMismatch {
                    expected: b.rows * b.cols,
                    got: b.data.len(),
                });
            }
            if b.cols > 0 {
                bases.insert(name, DMatrix::from_vec(b.rows, b.cols, b.data));
            }
        }
        Ok(Self { bases, reporter })
    }

    fn log_summary(&self) {
        if !self.reporter.is_primary() {
            return;
        }
        debug!("{}", "-".repeat(40));
        debug!("Gradient Constraints Summary");
        debug!("{}", "-".repeat(40));
        for (layer, basis) in &self.bases {
            debug!("Layer {} : {}/{}", layer, basis.ncols(), basis.nrows());
        }
        debug!("{}", "-".repeat(40));
    }
}

// =============================================================================
// Tests
// =============================================================================
