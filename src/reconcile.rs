//! Dual-gradient reconciliation (MEGA-II).
//!
//! Given the gradient of the current (novel) batch and the gradient of a
//! memory (base) batch, find the rotation angle `θ ∈ [0, π/2]` that
//! maximises
//!
//! ```text
//! current_loss · cos θ + memory_loss · cos(angle − θ)
//! ```
//!
//! where `angle` is the angle between the two gradients, then rebuild the
//! update as `a·current + b·memory`.
//!
//! # Algorithm
//!
//! Three candidate angles are drawn uniformly from `[0, π/2]` and each is
//! refined by eleven fixed-point steps of
//!
//! ```text
//! θ ← clamp(θ + (−sin θ + ratio · sin(angle − θ)) / (1 + ratio), 0, π/2)
//! ```
//!
//! with `ratio = memory_loss / current_loss`. The refined candidate with
//! the largest objective wins. Degenerate inputs (zero norms, zero current
//! loss, near-collinear gradients) skip the combination and leave the
//! current gradient as the update.
//!
//! Candidates are drawn from a `ChaCha8Rng` seeded per step from
//! SHA-256(seed ‖ step), so replicated workers draw the same angles.

use std::f64::consts::FRAC_PI_2;
use std::fmt;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{GradMemError, Result};
use crate::gradient::GradientVector;

/// Tunables for [`Reconciler`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Random starting angles per step.
    pub candidates: usize,
    /// Fixed-point refinement iterations per candidate.
    pub refine_steps: usize,
    /// Gram determinant below which the gradients are treated as collinear.
    pub sensitivity: f64,
    /// Global seed for candidate sampling; entropy when absent.
    pub seed: Option<u64>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            candidates: 3,
            refine_steps: 11,
            sensitivity: 1e-10,
            seed: None,
        }
    }
}

/// Scalars derived from one step's gradient pair.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReconciliationState {
    pub current_loss: f64,
    pub memory_loss: f64,
    /// ‖current‖²
    pub tt: f64,
    /// ‖memory‖²
    pub rr: f64,
    /// current · memory
    pub tr: f64,
    /// Angle between the gradients, radians in `[0, π]`.
    pub angle: f64,
}

impl ReconciliationState {
    /// Measure a gradient pair. Returns `None` if either norm is zero.
    pub fn measure(
        current: &GradientVector,
        memory: &GradientVector,
        current_loss: f64,
        memory_loss: f64,
    ) -> Option<Self> {
        let tt = current.norm_squared();
        let rr = memory.norm_squared();
        let tr = current.dot(memory);
        let deno = tt.sqrt() * rr.sqrt();
        if deno == 0.0 {
            return None;
        }
        let angle = (tr / deno).clamp(-1.0, 1.0).acos();
        Some(Self {
            current_loss,
            memory_loss,
            tt,
            rr,
            tr,
            angle,
        })
    }

    pub fn ratio(&self) -> f64 {
        self.memory_loss / self.current_loss
    }

    /// Joint loss-reduction objective at rotation `theta`.
    pub fn objective(&self, theta: f64) -> f64 {
        self.current_loss * theta.cos() + self.memory_loss * (self.angle - theta).cos()
    }

    /// 2×2 Gram determinant `‖c‖²‖m‖² − (c·m)²`.
    pub fn gram_determinant(&self) -> f64 {
        self.tt * self.rr - self.tr * self.tr
    }

    /// Combination weights `(a, b)` for rotation `theta`.
    pub fn coefficients(&self, theta: f64) -> (f64, f64) {
        let deno = self.gram_determinant();
        let norms = self.tt.sqrt() * self.rr.sqrt();
        let a = (self.rr * self.tt * theta.cos() - self.tr * norms * (self.angle - theta).cos())
            / deno;
        let b = (-self.tr * self.tt * theta.cos() + self.tt * norms * (self.angle - theta).cos())
            / deno;
        (a, b)
    }
}

/// Why a step kept the raw current gradient.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// One of the gradients has zero norm.
    ZeroNorm,
    /// Current loss is zero, so the loss ratio is undefined.
    ZeroCurrentLoss,
    /// Gram determinant under the sensitivity floor.
    Collinear,
    /// Combination produced non-finite values.
    NonFinite,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::ZeroNorm => "zero gradient norm",
            SkipReason::ZeroCurrentLoss => "zero current loss",
            SkipReason::Collinear => "near-collinear gradients",
            SkipReason::NonFinite => "non-finite combination",
        };
        f.write_str(s)
    }
}

/// Outcome of one reconciliation.
#[derive(Clone, Debug, PartialEq)]
pub enum Reconciliation {
    /// Use `gradient` in place of the current gradient.
    Combined {
        gradient: GradientVector,
        theta: f64,
        angle: f64,
        a: f64,
        b: f64,
    },
    /// Keep the current gradient.
    Skipped(SkipReason),
}

impl Reconciliation {
    pub fn is_combined(&self) -> bool {
        matches!(self, Reconciliation::Combined { .. })
    }
}

/// MEGA-II gradient reconciler.
#[derive(Clone, Debug)]
pub struct Reconciler {
    config: ReconcilerConfig,
    /// Used only when no seed is configured.
    entropy: ChaCha8Rng,
    step: u64,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            config,
            entropy: ChaCha8Rng::from_entropy(),
            step: 0,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Number of reconciliations performed so far.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Reconcile one gradient pair.
    ///
    /// Losses are plain scalars: nothing flows back through them.
    pub fn reconcile(
        &mut self,
        current: &GradientVector,
        memory: &GradientVector,
        current_loss: f64,
        memory_loss: f64,
    ) -> Result<Reconciliation> {
        if current.len() != memory.len() {
            return Err(GradMemError::DimensionMismatch {
                expected: current.len(),
                got: memory.len(),
            });
        }
        let mut rng = self.step_rng();
        self.step += 1;

        let Some(state) = ReconciliationState::measure(current, memory, current_loss, memory_loss)
        else {
            return Ok(skip(SkipReason::ZeroNorm));
        };
        if current_loss == 0.0 {
            return Ok(skip(SkipReason::ZeroCurrentLoss));
        }

        let theta = self.search_angle(&state, &mut rng);

        if state.gram_determinant() < self.config.sensitivity {
            return Ok(skip(SkipReason::Collinear));
        }
        let (a, b) = state.coefficients(theta);
        let gradient = current.combine(a, memory, b);
        if !gradient.is_finite() {
            return Ok(skip(SkipReason::NonFinite));
        }
        Ok(Reconciliation::Combined {
            gradient,
            theta,
            angle: state.angle,
            a,
            b,
        })
    }

    /// Best refined candidate angle for `state`.
    pub fn search_angle(&self, state: &ReconciliationState, rng: &mut impl Rng) -> f64 {
        let ratio = state.ratio();
        let mut best = (f64::NEG_INFINITY, 0.0);
        for _ in 0..self.config.candidates.max(1) {
            let mut theta = rng.gen::<f64>() * FRAC_PI_2;
            for _ in 0..self.config.refine_steps {
                theta += (1.0 / (1.0 + ratio)) * (-theta.sin() + ratio * (state.angle - theta).sin());
                theta = theta.clamp(0.0, FRAC_PI_2);
            }
            let objective = state.objective(theta);
            if objective > best.0 {
                best = (objective, theta);
            }
        }
        best.1
    }

    fn step_rng(&mut self) -> ChaCha8Rng {
        match self.config.seed {
            Some(seed) => {
                let mut hasher = Sha256::new();
                hasher.update(seed.to_le_bytes());
                hasher.update(self.step.to_le_bytes());
                let hash = hasher.finalize();
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&hash[0..8]);
                ChaCha8Rng::seed_from_u64(u64::from_le_bytes(bytes))
            }
            None => ChaCha8Rng::from_rng(&mut self.entropy)
                .unwrap_or_else(|_| ChaCha8Rng::seed_from_u64(self.step)),
        }
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(ReconcilerConfig::default())
    }
}

fn skip(reason: SkipReason) -> Reconciliation {
    debug!("Skipping gradient reconciliation: {}", reason);
    Reconciliation::Skipped(reason)
}
