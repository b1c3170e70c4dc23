//! Error types for gradmem.

use thiserror::Error;

/// Gradmem error types.
#[derive(Error, Debug)]
pub enum GradMemError {
    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// A layer name that no configured [`LayerSpec`](crate::layer::LayerSpec) covers
    #[error("Unknown layer '{0}': not registered for capture")]
    UnknownLayer(String),

    /// No retention threshold configured for a layer
    #[error("No energy threshold configured for layer '{0}'")]
    MissingThreshold(String),

    /// Zero-sized activation captured (e.g. a detection head fed no proposals)
    #[error("Empty dimension in activation for layer '{layer}' (shape {shape:?}); feed valid proposals through before capturing")]
    EmptyActivation { layer: String, shape: Vec<usize> },

    /// Representative input size requested before calibration
    #[error("Representative input size for layer '{0}' has not been discovered; run calibration first")]
    InputSizeUnknown(String),

    /// Captured activation has the wrong rank or channel count for its layer
    #[error("Shape mismatch for layer '{layer}': expected {expected}, got {got:?}")]
    ShapeMismatch {
        layer: String,
        expected: String,
        got: Vec<usize>,
    },

    /// Fewer buffered samples than the layer's declared budget
    #[error("Layer '{layer}' buffered {got} samples, budget requires {needed}")]
    InsufficientSamples {
        layer: String,
        needed: usize,
        got: usize,
    },

    /// Matrix or vector dimensions disagree
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Gradient vector does not match the parameter layout it is scattered into
    #[error("Gradient layout mismatch: {0}")]
    LayoutMismatch(String),

    /// Representation matrix with no rows or columns
    #[error("Empty representation matrix for layer '{0}'")]
    EmptyMatrix(String),

    /// SVD did not converge
    #[error("SVD failed to converge for layer '{0}'")]
    SvdNotConverged(String),

    /// The model was switched out of training mode
    #[error("Model is not in training mode")]
    ModelNotTraining,

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Dataset split name the memory loader cannot map
    #[error("Unsupported dataset split name: {0}")]
    UnsupportedDataset(String),

    /// A class id with no prototype or pool
    #[error("Unknown class id {0}")]
    UnknownClass(usize),
}

/// Result type alias for gradmem operations.
pub type Result<T> = std::result::Result<T, GradMemError>;
