//! Activation capture: per-layer input buffers fed by observed forward passes.
//!
//! A model exposes its named layers through [`ObserveActivations`]: during
//! an observed forward pass it hands each registered layer's input to an
//! [`ActivationSink`]. [`ActivationCapture`] is the sink used for gradient
//! memory and runs in two modes:
//!
//! - **Calibration** keeps the last raw input per layer so
//!   [`ActivationCapture::discover_sizes`] can record each layer's
//!   representative input size.
//! - **Accumulation** pools convolution inputs down to that representative
//!   size and stacks them along the batch axis, up to whatever the caller
//!   feeds; linear inputs are stacked unchanged.
//!
//! # Usage
//!
//! ```rust
//! use gradmem::capture::{ActivationCapture, ActivationSink};
//! use gradmem::layer::LayerSpec;
//! use gradmem::tensor::Activation;
//!
//! let mut capture = ActivationCapture::new(vec![LayerSpec::linear("fc", 4, 2)]);
//! capture.begin_calibration();
//! capture.record("fc", &Activation::zeros(vec![2, 4]))?;
//! capture.discover_sizes()?;
//!
//! capture.begin_accumulation()?;
//! capture.record("fc", &Activation::zeros(vec![1, 4]))?;
//! capture.record("fc", &Activation::zeros(vec![1, 4]))?;
//! assert_eq!(capture.get("fc").unwrap().batch(), 2);
//! # Ok::<(), gradmem::GradMemError>(())
//! ```

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{GradMemError, Result};
use crate::layer::{InputSize, LayerKind, LayerSpec};
use crate::tensor::Activation;

/// Receives layer inputs during an observed forward pass.
pub trait ActivationSink {
    /// Report the input tensor `input` seen by layer `layer`.
    fn record(&mut self, layer: &str, input: &Activation) -> Result<()>;
}

/// A model that can run a forward pass reporting its layer inputs.
///
/// How the inputs are intercepted (hooks, explicit calls) is up to the
/// implementor; only layers registered with the sink need be reported.
pub trait ObserveActivations {
    type Batch;

    /// Run a gradient-free forward pass over `batch`, reporting layer inputs to `sink`.
    fn observe(&mut self, batch: &Self::Batch, sink: &mut dyn ActivationSink) -> Result<()>;
}

/// Capture mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureMode {
    /// Keep each layer's raw input for size discovery.
    Calibration,
    /// Pool and concatenate inputs for representation building.
    Accumulation,
}

/// Owns the per-layer activation buffers.
#[derive(Clone, Debug)]
pub struct ActivationCapture {
    /// Registered layers in deterministic (name) order.
    layers: BTreeMap<String, LayerSpec>,
    buffers: BTreeMap<String, Activation>,
    mode: CaptureMode,
}

impl ActivationCapture {
    /// Register the layers to capture. Starts in calibration mode.
    pub fn new(layers: Vec<LayerSpec>) -> Self {
        Self {
            layers: layers
                .into_iter()
                .map(|spec| (spec.name().to_string(), spec))
                .collect(),
            buffers: BTreeMap::new(),
            mode: CaptureMode::Calibration,
        }
    }

    // --- Accessors ---

    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    pub fn layer(&self, name: &str) -> Result<&LayerSpec> {
        self.layers
            .get(name)
            .ok_or_else(|| GradMemError::UnknownLayer(name.to_string()))
    }

    pub fn layers(&self) -> impl Iterator<Item = &LayerSpec> {
        self.layers.values()
    }

    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.layers.keys().map(|s| s.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.layers.contains_key(name)
    }

    /// Current buffer for a layer, if anything was captured.
    pub fn get(&self, name: &str) -> Option<&Activation> {
        self.buffers.get(name)
    }

    // --- Lifecycle ---

    /// Clear all buffers and switch to raw capture.
    pub fn begin_calibration(&mut self) {
        self.buffers.clear();
        self.mode = CaptureMode::Calibration;
    }

    /// Record the representative input size of every layer from its
    /// calibration capture, then clear the buffers.
    ///
    /// Every registered layer must have been observed.
    pub fn discover_sizes(&mut self) -> Result<()> {
        let mut sizes = Vec::with_capacity(self.layers.len());
        for (name, spec) in &self.layers {
            let act = self
                .buffers
                .get(name)
                .ok_or_else(|| GradMemError::InputSizeUnknown(name.clone()))?;
            let size = match (spec.kind(), act.shape()) {
                (LayerKind::Conv { .. }, &[_, _, w, h]) => InputSize::Spatial(w, h),
                (LayerKind::Linear { .. }, &[_, f]) => InputSize::Features(f),
                (LayerKind::Conv { .. }, got) => {
                    return Err(shape_mismatch(name, "(batch, channel, width, height)", got))
                }
                (LayerKind::Linear { .. }, got) => {
                    return Err(shape_mismatch(name, "(batch, feature)", got))
                }
            };
            debug!("Representative input size for {}: {:?}", name, size);
            sizes.push((name.clone(), size));
        }
        for (name, size) in sizes {
            if let Some(spec) = self.layers.get_mut(&name) {
                spec.set_input_size(size);
            }
        }
        self.buffers.clear();
        Ok(())
    }

    /// Clear all buffers and switch to pooled accumulation.
    ///
    /// Fails if any layer's representative size is still unknown.
    pub fn begin_accumulation(&mut self) -> Result<()> {
        if let Some(spec) = self.layers.values().find(|s| s.input_size().is_none()) {
            return Err(GradMemError::InputSizeUnknown(spec.name().to_string()));
        }
        self.buffers.clear();
        self.mode = CaptureMode::Accumulation;
        Ok(())
    }

    /// Reset all buffers, keeping the mode and discovered sizes.
    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    fn accumulate(&mut self, spec: &LayerSpec, input: &Activation) -> Result<()> {
        let name = spec.name();
        let act = match (spec.kind(), spec.input_size()) {
            (LayerKind::Conv { in_channels, .. }, Some(InputSize::Spatial(w, h))) => {
                if input.ndim() != 4 || input.shape()[1] != in_channels {
                    return Err(shape_mismatch(
                        name,
                        &format!("(batch, {}, width, height)", in_channels),
                        input.shape(),
                    ));
                }
                input.adaptive_avg_pool2d(w, h)?
            }
            (LayerKind::Linear { .. }, Some(InputSize::Features(f))) => {
                if input.ndim() != 2 || input.shape()[1] != f {
                    return Err(shape_mismatch(name, &format!("(batch, {})", f), input.shape()));
                }
                input.clone()
            }
            (_, None) => return Err(GradMemError::InputSizeUnknown(name.to_string())),
            (_, Some(size)) => {
                return Err(shape_mismatch(name, &format!("{:?}", size), input.shape()))
            }
        };

        match self.buffers.get_mut(name) {
            Some(buffer) => buffer.concat_batch(&act),
            None => {
                self.buffers.insert(name.to_string(), act);
                Ok(())
            }
        }
    }
}

impl ActivationSink for ActivationCapture {
    fn record(&mut self, layer: &str, input: &Activation) -> Result<()> {
        let spec = self.layer(layer)?.clone();
        if input.is_degenerate() {
            return Err(GradMemError::EmptyActivation {
                layer: layer.to_string(),
                shape: input.shape().to_vec(),
            });
        }
        match self.mode {
            CaptureMode::Calibration => {
                self.buffers.insert(layer.to_string(), input.clone());
                Ok(())
            }
            CaptureMode::Accumulation => self.accumulate(&spec, input),
        }
    }
}

fn shape_mismatch(layer: &str, expected: &str, got: &[usize]) -> GradMemError {
    GradMemError::ShapeMismatch {
        layer: layer.to_string(),
        expected: expected.to_string(),
        got: got.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture() -> ActivationCapture {
        ActivationCapture::new(vec![
            LayerSpec::conv("conv", 3, (3, 3), 2),
            LayerSpec::linear("fc", 16, 4),
        ])
    }

    fn calibrate(cap: &mut ActivationCapture) {
        cap.begin_calibration();
        cap.record("conv", &Activation::zeros(vec![2, 3, 8, 8])).unwrap();
        cap.record("fc", &Activation::zeros(vec![2, 16])).unwrap();
        cap.discover_sizes().unwrap();
    }

    #[test]
    fn test_discover_sizes() {
        let mut cap = capture();
        calibrate(&mut cap);
        assert_eq!(cap.layer("conv").unwrap().input_size(), Some(InputSize::Spatial(8, 8)));
        assert_eq!(cap.layer("fc").unwrap().input_size(), Some(InputSize::Features(16)));
        assert!(cap.get("conv").is_none(), "buffers cleared after discovery");
    }

    #[test]
    fn test_calibration_overwrites() {
        let mut cap = capture();
        cap.record("conv", &Activation::zeros(vec![2, 3, 10, 12])).unwrap();
        cap.record("conv", &Activation::zeros(vec![1, 3, 8, 9])).unwrap();
        assert_eq!(cap.get("conv").unwrap().shape(), &[1, 3, 8, 9]);
    }

    #[test]
    fn test_discover_requires_every_layer() {
        let mut cap = capture();
        cap.record("conv", &Activation::zeros(vec![2, 3, 8, 8])).unwrap();
        assert!(matches!(cap.discover_sizes(), Err(GradMemError::InputSizeUnknown(l)) if l == "fc"));
    }

    #[test]
    fn test_accumulation_requires_sizes() {
        let mut cap = capture();
        assert!(matches!(cap.begin_accumulation(), Err(GradMemError::InputSizeUnknown(_))));
    }

    #[test]
    fn test_accumulation_pools_and_concatenates() {
        let mut cap = capture();
        calibrate(&mut cap);
        cap.begin_accumulation().unwrap();
        assert_eq!(cap.mode(), CaptureMode::Accumulation);

        // Larger input is pooled to 8x8
        cap.record("conv", &Activation::from_fn(vec![1, 3, 16, 16], |_| 1.0)).unwrap();
        cap.record("conv", &Activation::zeros(vec![1, 3, 8, 8])).unwrap();
        let conv = cap.get("conv").unwrap();
        assert_eq!(conv.shape(), &[2, 3, 8, 8]);
        let pooled = conv.view4().unwrap();
        assert!((pooled[[0, 2, 7, 7]] - 1.0).abs() < 1e-6);
        assert_eq!(pooled[[1, 0, 0, 0]], 0.0);

        cap.record("fc", &Activation::zeros(vec![3, 16])).unwrap();
        cap.record("fc", &Activation::zeros(vec![2, 16])).unwrap();
        assert_eq!(cap.get("fc").unwrap().shape(), &[5, 16]);
    }

    #[test]
    fn test_empty_activation_fails_fast() {
        let mut cap = capture();
        let err = cap.record("fc", &Activation::zeros(vec![0, 16])).unwrap_err();
        assert!(matches!(err, GradMemError::EmptyActivation { ref layer, .. } if layer == "fc"));
    }

    #[test]
    fn test_unknown_layer() {
        let mut cap = capture();
        let err = cap.record("roi_heads", &Activation::zeros(vec![1, 4])).unwrap_err();
        assert!(matches!(err, GradMemError::UnknownLayer(_)));
    }

    #[test]
    fn test_accumulation_rejects_wrong_channels() {
        let mut cap = capture();
        calibrate(&mut cap);
        cap.begin_accumulation().unwrap();
        let err = cap.record("conv", &Activation::zeros(vec![1, 4, 8, 8])).unwrap_err();
        assert!(matches!(err, GradMemError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_clear_keeps_sizes() {
        let mut cap = capture();
        calibrate(&mut cap);
        cap.begin_accumulation().unwrap();
        cap.record("fc", &Activation::zeros(vec![1, 16])).unwrap();
        cap.clear();
        assert!(cap.get("fc").is_none());
        assert_eq!(cap.mode(), CaptureMode::Accumulation);
        assert!(cap.layer("fc").unwrap().input_size().is_some());
    }
}
