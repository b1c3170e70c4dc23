//! # gradmem: Gradient Memory for Continual Few-Shot Detection
//!
//! Two ways of keeping a detector from forgetting earlier classes while it
//! learns new ones from a few shots:
//!
//! - **GPM** (gradient projection memory): after a task, layer inputs are
//!   captured, unfolded into representation matrices and compressed by SVD
//!   into per-layer bases of directions later updates should not disturb.
//! - **MEGA-II**: every step computes a gradient on the novel batch and one
//!   on a memory batch of base images, then rotates between them to
//!   balance both losses.
//!
//! ## Quick Start
//!
//! ```rust
//! use gradmem::{GradientVector, Reconciler, ReconcilerConfig};
//!
//! let mut reconciler = Reconciler::new(ReconcilerConfig {
//!     seed: Some(0),
//!     ..Default::default()
//! });
//!
//! let current = GradientVector::from_vec(vec![2.0, 0.0]);
//! let memory = GradientVector::from_vec(vec![0.0, 2.0]);
//! let outcome = reconciler.reconcile(&current, &memory, 1.0, 1.0)?;
//! assert!(outcome.is_combined());
//! # Ok::<(), gradmem::GradMemError>(())
//! ```
//!
//! ## Core Concepts
//!
//! - **Capture**: a model reports its layer inputs to an [`ActivationSink`]
//! - **Representation**: captured inputs unfolded to `rows × samples` matrices
//! - **Subspace memory**: per-layer orthonormal bases grown task by task
//! - **Reconciliation**: the MEGA-II combination of two flattened gradients
//! - **Trainer**: [`MemoryTrainer`] wires all of the above around a [`Model`]

pub mod capture;
pub mod config;
pub mod error;
pub mod gradient;
pub mod layer;
pub mod linalg;
pub mod memory;
pub mod prototype;
pub mod reconcile;
pub mod report;
pub mod representation;
pub mod tensor;
pub mod trainer;

// Re-exports for convenience
pub use capture::{ActivationCapture, ActivationSink, CaptureMode, ObserveActivations};
pub use config::{memory_split_name, LayerConfig, MemoryConfig};
pub use error::{GradMemError, Result};
pub use gradient::{GradientLayout, GradientVector, Parameter};
pub use layer::{InputSize, LayerKind, LayerSpec};
pub use memory::{LayerUpdate, SubspaceMemory, SubspaceSnapshot};
pub use prototype::{ImageFeatures, PrototypeSampler, SamplerConfig};
pub use reconcile::{Reconciler, ReconcilerConfig, Reconciliation, SkipReason};
pub use report::Reporter;
pub use representation::RepresentationMatrixBuilder;
pub use tensor::Activation;
pub use trainer::{LossDict, MemoryTrainer, Model, StepReport};
