//! Memory trainer: GPM consolidation and the MEGA-II training step.
//!
//! [`MemoryTrainer`] owns the model together with everything gradient
//! memory needs between steps: the activation capture, the per-layer
//! subspace memory and the reconciler.
//!
//! A training step runs two forward/backward passes, one on a novel batch
//! and one on a memory (base) batch, then replaces the parameter gradients
//! with the MEGA-II combination of the two. The optimizer update that
//! follows is the caller's.
//!
//! Consolidation after a task runs observed forward passes through the
//! model: one calibration pass to learn each layer's representative input
//! size, then accumulation passes whose pooled inputs become the
//! representation matrices folded into the subspace memory.

use std::collections::{BTreeMap, HashMap};

use nalgebra::DMatrix;
use tracing::{debug, info};

use crate::capture::{ActivationCapture, ObserveActivations};
use crate::config::MemoryConfig;
use crate::error::{GradMemError, Result};
use crate::gradient::{GradientLayout, GradientVector, Parameter};
use crate::memory::{LayerUpdate, SubspaceMemory};
use crate::reconcile::{Reconciler, Reconciliation};
use crate::report::Reporter;
use crate::representation::RepresentationMatrixBuilder;

/// Named scalar losses from one forward pass.
pub type LossDict = BTreeMap<String, f64>;

/// A trainable model.
///
/// `forward_backward` computes the losses for a batch and adds their
/// gradients into the parameter slots, the way an autograd backward pass
/// accumulates.
pub trait Model {
    type Batch;

    fn forward_backward(&mut self, batch: &Self::Batch) -> Result<LossDict>;

    /// Parameters in a fixed order.
    fn parameters(&self) -> &[Parameter];

    fn parameters_mut(&mut self) -> &mut [Parameter];

    fn zero_grad(&mut self) {
        for p in self.parameters_mut() {
            p.zero_grad();
        }
    }

    /// False once the model has been switched to evaluation mode.
    fn is_training(&self) -> bool {
        true
    }
}

/// Metrics of one MEGA-II step.
#[derive(Clone, Debug, PartialEq)]
pub struct StepReport {
    /// Losses on the novel batch.
    pub losses: LossDict,
    /// Losses on the memory batch, keys prefixed with `memory_`.
    pub memory_losses: LossDict,
    pub reconciliation: Reconciliation,
}

impl StepReport {
    /// Both loss dicts merged into one metrics map.
    pub fn metrics(&self) -> LossDict {
        let mut all = self.losses.clone();
        all.extend(self.memory_losses.iter().map(|(k, v)| (k.clone(), *v)));
        all
    }
}

/// Trains a model against a memory of earlier tasks.
pub struct MemoryTrainer<M> {
    model: M,
    reconciler: Reconciler,
    memory: SubspaceMemory,
    capture: ActivationCapture,
    thresholds: HashMap<String, f64>,
    reporter: Reporter,
}

impl<M> MemoryTrainer<M> {
    /// Trainer for the primary worker.
    pub fn new(model: M, config: &MemoryConfig) -> Result<Self> {
        Self::with_reporter(model, config, Reporter::default())
    }

    /// Trainer for worker `reporter.rank()` of a replicated run.
    pub fn with_reporter(model: M, config: &MemoryConfig, reporter: Reporter) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            model,
            reconciler: Reconciler::new(config.reconciler.clone()),
            memory: SubspaceMemory::with_reporter(reporter),
            capture: ActivationCapture::new(config.layer_specs()),
            thresholds: config.thresholds(),
            reporter,
        })
    }

    // --- Accessors ---

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// The subspace memory (GPM).
    pub fn gpm(&self) -> &SubspaceMemory {
        &self.memory
    }

    /// Replace the subspace memory, e.g. with one restored from a snapshot.
    pub fn set_gpm(&mut self, memory: SubspaceMemory) {
        self.memory = memory;
    }

    pub fn capture(&self) -> &ActivationCapture {
        &self.capture
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn reporter(&self) -> Reporter {
        self.reporter
    }
}

impl<M: Model> MemoryTrainer<M> {
    /// One MEGA-II step over a memory batch and a novel batch.
    ///
    /// Leaves the reconciled gradient in the model's parameter slots. When
    /// reconciliation is skipped the novel-batch gradient is written back.
    pub fn step(&mut self, memory_batch: &M::Batch, novel_batch: &M::Batch) -> Result<StepReport> {
        if !self.model.is_training() {
            return Err(GradMemError::ModelNotTraining);
        }
        let layout = GradientLayout::of(self.model.parameters());

        // Current task gradient
        self.model.zero_grad();
        let losses = self.model.forward_backward(novel_batch)?;
        let current_loss = losses.values().sum::<f64>();
        let current = layout.flatten(self.model.parameters())?;

        // Memory gradient
        self.model.zero_grad();
        let memory_losses = self.model.forward_backward(memory_batch)?;
        let memory_loss = memory_losses.values().sum::<f64>();
        let memory = layout.flatten(self.model.parameters())?;

        let reconciliation = self
            .reconciler
            .reconcile(&current, &memory, current_loss, memory_loss)?;
        let update: &GradientVector = match &reconciliation {
            Reconciliation::Combined {
                gradient,
                theta,
                angle,
                ..
            } => {
                debug!("MEGA-II theta {:.4} for gradient angle {:.4}", theta, angle);
                gradient
            }
            Reconciliation::Skipped(_) => &current,
        };
        layout.scatter(self.model.parameters_mut(), update)?;

        Ok(StepReport {
            losses,
            memory_losses: memory_losses
                .into_iter()
                .map(|(k, v)| (format!("memory_{}", k), v))
                .collect(),
            reconciliation,
        })
    }
}

impl<M: ObserveActivations> MemoryTrainer<M> {
    /// Learn each captured layer's representative input size.
    ///
    /// Every batch is observed in calibration mode; the size recorded for a
    /// layer is the shape of the last input it saw.
    pub fn calibrate<'a, I>(&mut self, batches: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a M::Batch>,
        M::Batch: 'a,
    {
        self.capture.begin_calibration();
        for batch in batches {
            self.model.observe(batch, &mut self.capture)?;
        }
        self.capture.discover_sizes()
    }

    /// Accumulate pooled layer inputs over `batches` and build one
    /// representation matrix per layer.
    ///
    /// Requires a prior [`calibrate`](Self::calibrate).
    pub fn collect_representations<'a, I>(
        &mut self,
        batches: I,
    ) -> Result<BTreeMap<String, DMatrix<f64>>>
    where
        I: IntoIterator<Item = &'a M::Batch>,
        M::Batch: 'a,
    {
        self.capture.begin_accumulation()?;
        for batch in batches {
            self.model.observe(batch, &mut self.capture)?;
        }
        let mats = RepresentationMatrixBuilder::build_all(&self.capture);
        self.capture.clear();
        mats
    }

    /// Fold a finished task into the subspace memory.
    pub fn consolidate<'a, I>(
        &mut self,
        calibration: &M::Batch,
        batches: I,
    ) -> Result<BTreeMap<String, LayerUpdate>>
    where
        I: IntoIterator<Item = &'a M::Batch>,
        M::Batch: 'a,
    {
        if self.reporter.is_primary() {
            info!("Updating gradient memory");
        }
        self.calibrate([calibration])?;
        let mats = self.collect_representations(batches)?;
        self.memory.update(&mats, &self.thresholds)
    }
}
