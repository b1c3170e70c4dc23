//! Layer descriptions for activation capture.

use serde::{Deserialize, Serialize};

/// What kind of module a captured layer is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum LayerKind {
    /// 2-D convolution with a `(kh, kw)` kernel over `in_channels` input planes.
    Conv {
        kernel: (usize, usize),
        in_channels: usize,
    },
    /// Fully connected layer with `in_features` inputs.
    Linear { in_features: usize },
}

impl LayerKind {
    pub fn is_conv(&self) -> bool {
        matches!(self, LayerKind::Conv { .. })
    }

    /// Row count of this layer's representation matrix.
    pub fn representation_rows(&self) -> usize {
        match *self {
            LayerKind::Conv {
                kernel: (kh, kw),
                in_channels,
            } => in_channels * kh * kw,
            LayerKind::Linear { in_features } => in_features,
        }
    }
}

/// Representative input size discovered by a calibration pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputSize {
    /// Spatial `(width, height)` of a convolution input.
    Spatial(usize, usize),
    /// Feature dimensionality of a linear input.
    Features(usize),
}

/// A named layer whose inputs are captured for representation building.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerSpec {
    name: String,
    kind: LayerKind,
    /// How many samples must be accumulated before a representation matrix is built.
    sample_budget: usize,
    input_size: Option<InputSize>,
}

impl LayerSpec {
    pub fn new(name: impl Into<String>, kind: LayerKind, sample_budget: usize) -> Self {
        Self {
            name: name.into(),
            kind,
            sample_budget,
            input_size: None,
        }
    }

    pub fn conv(
        name: impl Into<String>,
        in_channels: usize,
        kernel: (usize, usize),
        sample_budget: usize,
    ) -> Self {
        Self::new(
            name,
            LayerKind::Conv {
                kernel,
                in_channels,
            },
            sample_budget,
        )
    }

    pub fn linear(name: impl Into<String>, in_features: usize, sample_budget: usize) -> Self {
        Self::new(name, LayerKind::Linear { in_features }, sample_budget)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    pub fn sample_budget(&self) -> usize {
        self.sample_budget
    }

    pub fn input_size(&self) -> Option<InputSize> {
        self.input_size
    }

    pub(crate) fn set_input_size(&mut self, size: InputSize) {
        self.input_size = Some(size);
    }
}

/// Output spatial size of a convolution.
///
/// `in + 2·pad − dilation·(k − 1) − 1` per axis, without the stride term.
/// With no padding and unit dilation this is `in − k`, the number of
/// patch positions the representation builder walks along that axis.
pub fn conv_output_size(
    input: (usize, usize),
    kernel: (usize, usize),
    padding: (usize, usize),
    dilation: (usize, usize),
) -> (usize, usize) {
    let dim = |i: usize, k: usize, p: usize, d: usize| {
        (i + 2 * p).saturating_sub(d * k.saturating_sub(1) + 1)
    };
    (
        dim(input.0, kernel.0, padding.0, dilation.0),
        dim(input.1, kernel.1, padding.1, dilation.1),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_representation_rows() {
        let conv = LayerKind::Conv {
            kernel: (3, 3),
            in_channels: 64,
        };
        assert_eq!(conv.representation_rows(), 576);
        assert_eq!(LayerKind::Linear { in_features: 1024 }.representation_rows(), 1024);
    }

    #[test]
    fn test_conv_output_size() {
        assert_eq!(conv_output_size((8, 8), (3, 3), (0, 0), (1, 1)), (5, 5));
        assert_eq!(conv_output_size((8, 6), (3, 1), (1, 0), (1, 1)), (7, 5));
        assert_eq!(conv_output_size((2, 2), (3, 3), (0, 0), (1, 1)), (0, 0));
    }

    #[test]
    fn test_layer_kind_serde() {
        let kind: LayerKind =
            serde_json::from_str(r#"{"type": "conv", "kernel": [3, 3], "in_channels": 256}"#)
                .unwrap();
        assert!(kind.is_conv());
        let kind: LayerKind =
            serde_json::from_str(r#"{"type": "linear", "in_features": 1024}"#).unwrap();
        assert_eq!(kind, LayerKind::Linear { in_features: 1024 });
    }

    #[test]
    fn test_input_size_starts_unknown() {
        let spec = LayerSpec::conv("res4", 3, (3, 3), 2);
        assert_eq!(spec.input_size(), None);
        assert_eq!(spec.sample_budget(), 2);
    }
}
