//! Configuration for gradient memory.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{GradMemError, Result};
use crate::layer::{LayerKind, LayerSpec};
use crate::prototype::SamplerConfig;
use crate::reconcile::ReconcilerConfig;

/// One captured layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    pub name: String,
    pub kind: LayerKind,
    /// Samples used to build the representation matrix.
    pub sample_budget: usize,
    /// Energy ratio the subspace must explain, in (0, 1).
    pub threshold: f64,
}

impl LayerConfig {
    pub fn new(name: impl Into<String>, kind: LayerKind, sample_budget: usize, threshold: f64) -> Self {
        Self {
            name: name.into(),
            kind,
            sample_budget,
            threshold,
        }
    }
}

/// Configuration for the memory trainer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Layers to capture, in any order.
    pub layers: Vec<LayerConfig>,
    pub reconciler: ReconcilerConfig,
    pub sampler: SamplerConfig,
}

impl MemoryConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for layer in &self.layers {
            if !seen.insert(layer.name.as_str()) {
                return Err(GradMemError::InvalidConfig(format!(
                    "duplicate layer '{}'",
                    layer.name
                )));
            }
            if layer.threshold.is_nan() || layer.threshold <= 0.0 || layer.threshold >= 1.0 {
                return Err(GradMemError::InvalidConfig(format!(
                    "threshold for '{}' must be in (0, 1), got {}",
                    layer.name, layer.threshold
                )));
            }
            if layer.sample_budget == 0 {
                return Err(GradMemError::InvalidConfig(format!(
                    "sample_budget for '{}' must be greater than 0",
                    layer.name
                )));
            }
            match layer.kind {
                LayerKind::Conv {
                    kernel: (kh, kw),
                    in_channels,
                } if kh == 0 || kw == 0 || in_channels == 0 => {
                    return Err(GradMemError::InvalidConfig(format!(
                        "conv layer '{}' needs a non-empty kernel and channels",
                        layer.name
                    )));
                }
                LayerKind::Linear { in_features: 0 } => {
                    return Err(GradMemError::InvalidConfig(format!(
                        "linear layer '{}' needs in_features > 0",
                        layer.name
                    )));
                }
                _ => {}
            }
        }

        if self.reconciler.candidates == 0 {
            return Err(GradMemError::InvalidConfig(
                "reconciler.candidates must be greater than 0".into(),
            ));
        }
        if self.reconciler.sensitivity.is_nan() || self.reconciler.sensitivity < 0.0 {
            return Err(GradMemError::InvalidConfig(format!(
                "reconciler.sensitivity must be non-negative, got {}",
                self.reconciler.sensitivity
            )));
        }
        if self.sampler.samples_needed > self.sampler.pool_size {
            return Err(GradMemError::InvalidConfig(format!(
                "sampler.samples_needed ({}) exceeds pool_size ({})",
                self.sampler.samples_needed, self.sampler.pool_size
            )));
        }
        Ok(())
    }

    /// Energy threshold per layer name.
    pub fn thresholds(&self) -> HashMap<String, f64> {
        self.layers
            .iter()
            .map(|l| (l.name.clone(), l.threshold))
            .collect()
    }

    /// Sample budget per layer name.
    pub fn sample_budgets(&self) -> HashMap<String, usize> {
        self.layers
            .iter()
            .map(|l| (l.name.clone(), l.sample_budget))
            .collect()
    }

    /// Capture specs with sizes still undiscovered.
    pub fn layer_specs(&self) -> Vec<LayerSpec> {
        self.layers
            .iter()
            .map(|l| LayerSpec::new(l.name.clone(), l.kind, l.sample_budget))
            .collect()
    }
}

/// Name of the memory split that goes with a training split.
///
/// `voc_2007_trainval_all1_10shot_seed03` becomes
/// `voc_2007_trainval_base_mem1_10shot_seed3`: every `novel_mem` or `all`
/// in the name part turns into `base_mem` and the seed is normalised.
pub fn memory_split_name(train_set: &str) -> Result<String> {
    let mut parts = train_set.split("_seed");
    let (Some(name), Some(seed), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(GradMemError::UnsupportedDataset(train_set.to_string()));
    };
    let seed: i64 = seed
        .trim()
        .parse()
        .map_err(|_| GradMemError::UnsupportedDataset(train_set.to_string()))?;

    let name = name.replace("novel_mem", "base_mem").replace("all", "base_mem");
    Ok(format!("{}_seed{}", name, seed))
}
