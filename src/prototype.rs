//! Prototype-based sample selection.
//!
//! Builds a per-class pool of candidate images from a stream of RoI
//! features, averages them into one prototype per class, and ranks each
//! pool by distance to its class prototype. The closest images become the
//! memory (base) split.
//!
//! Feature extraction itself happens upstream; this module only sees one
//! feature row and one class label per ground-truth box.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{GradMemError, Result};

/// Pool and selection sizes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Candidate images gathered per class before ranking.
    pub pool_size: usize,
    /// Images kept per class after ranking; the default for [`PrototypeSampler::select`].
    pub samples_needed: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            pool_size: 50,
            samples_needed: 10,
        }
    }
}

/// RoI features of one image.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageFeatures {
    pub file_name: String,
    /// One feature row per ground-truth box.
    pub features: Vec<Vec<f32>>,
    /// Class label of each box, same length as `features`.
    pub labels: Vec<usize>,
}

/// Per-label averaged features of a pooled image.
#[derive(Clone, Debug, PartialEq)]
struct StoredImage {
    by_label: BTreeMap<usize, Vec<f64>>,
}

/// Gathers class pools and ranks them against class prototypes.
#[derive(Clone, Debug)]
pub struct PrototypeSampler {
    config: SamplerConfig,
    pools: BTreeMap<usize, BTreeSet<String>>,
    images: BTreeMap<String, StoredImage>,
}

impl PrototypeSampler {
    /// Sampler for classes `0..num_classes`.
    pub fn new(num_classes: usize, config: SamplerConfig) -> Self {
        Self {
            config,
            pools: (0..num_classes).map(|c| (c, BTreeSet::new())).collect(),
            images: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// File names pooled for a class.
    pub fn pool(&self, class: usize) -> Option<&BTreeSet<String>> {
        self.pools.get(&class)
    }

    /// True once every class pool holds `pool_size` images.
    pub fn is_saturated(&self) -> bool {
        self.pools.values().all(|p| p.len() >= self.config.pool_size)
    }

    /// Offer an image to the pools.
    ///
    /// The image joins the pool of the first of its labels whose pool is
    /// not yet full. Returns `false` if it was not needed by any class.
    pub fn offer(&mut self, image: ImageFeatures) -> Result<bool> {
        if image.features.len() != image.labels.len() {
            return Err(GradMemError::DimensionMismatch {
                expected: image.labels.len(),
                got: image.features.len(),
            });
        }
        if image.features.is_empty() {
            return Ok(false);
        }

        let by_label = average_by_label(&image.features, &image.labels)?;
        let pool_size = self.config.pool_size;
        let mut joined = false;
        for &label in &image.labels {
            let pool = self
                .pools
                .get_mut(&label)
                .ok_or(GradMemError::UnknownClass(label))?;
            if pool.len() < pool_size {
                pool.insert(image.file_name.clone());
                if pool.len() >= pool_size {
                    info!("Sample pool for class {} has been filled", label);
                }
                joined = true;
                break;
            }
        }
        if !joined {
            return Ok(false);
        }

        self.images.insert(image.file_name, StoredImage { by_label });
        Ok(true)
    }

    /// Mean of every stored per-label feature, one prototype per class seen.
    pub fn build_prototypes(&self) -> Result<BTreeMap<usize, Vec<f64>>> {
        let mut sums: BTreeMap<usize, (Vec<f64>, usize)> = BTreeMap::new();
        for image in self.images.values() {
            for (&label, feature) in &image.by_label {
                let entry = sums
                    .entry(label)
                    .or_insert_with(|| (vec![0.0; feature.len()], 0));
                if entry.0.len() != feature.len() {
                    return Err(GradMemError::DimensionMismatch {
                        expected: entry.0.len(),
                        got: feature.len(),
                    });
                }
                for (s, f) in entry.0.iter_mut().zip(feature) {
                    *s += f;
                }
                entry.1 += 1;
            }
        }
        Ok(sums
            .into_iter()
            .map(|(label, (sum, n))| (label, sum.into_iter().map(|s| s / n as f64).collect()))
            .collect())
    }

    /// Rank every class pool by distance to its prototype, closest first,
    /// keeping `samples_needed` file names per class.
    pub fn rank(
        &self,
        prototypes: &BTreeMap<usize, Vec<f64>>,
        samples_needed: usize,
    ) -> Result<BTreeMap<usize, Vec<String>>> {
        let mut selected = BTreeMap::new();
        for (&class, pool) in &self.pools {
            let mut scored: Vec<(&str, f64)> = Vec::with_capacity(pool.len());
            for file_name in pool {
                let Some(image) = self.images.get(file_name) else {
                    continue;
                };
                let distance = match image.by_label.get(&class) {
                    Some(feature) => {
                        let proto = prototypes
                            .get(&class)
                            .ok_or(GradMemError::UnknownClass(class))?;
                        euclidean(proto, feature)?
                    }
                    None => 0.0,
                };
                scored.push((file_name.as_str(), distance));
            }
            scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            selected.insert(
                class,
                scored
                    .into_iter()
                    .take(samples_needed)
                    .map(|(name, _)| name.to_string())
                    .collect(),
            );
        }
        info!("Samples have been ranked!");
        Ok(selected)
    }

    /// Build prototypes and rank with the configured `samples_needed`.
    pub fn select(&self) -> Result<BTreeMap<usize, Vec<String>>> {
        let prototypes = self.build_prototypes()?;
        self.rank(&prototypes, self.config.samples_needed)
    }
}

/// Average the rows sharing a label so multi-instance images are not over-weighted.
fn average_by_label(features: &[Vec<f32>], labels: &[usize]) -> Result<BTreeMap<usize, Vec<f64>>> {
    let dim = features.first().map_or(0, |f| f.len());
    let mut sums: BTreeMap<usize, (Vec<f64>, usize)> = BTreeMap::new();
    for (row, &label) in features.iter().zip(labels) {
        if row.len() != dim {
            return Err(GradMemError::DimensionMismatch {
                expected: dim,
                got: row.len(),
            });
        }
        let entry = sums.entry(label).or_insert_with(|| (vec![0.0; dim], 0));
        for (s, &v) in entry.0.iter_mut().zip(row) {
            *s += v as f64;
        }
        entry.1 += 1;
    }
    Ok(sums
        .into_iter()
        .map(|(label, (sum, n))| (label, sum.into_iter().map(|s| s / n as f64).collect()))
        .collect())
}

fn euclidean(a: &[f64], b: &[f64]) -> Result<f64> {
    if a.len() != b.len() {
        return Err(GradMemError::DimensionMismatch {
            expected: a.len(),
            got: b.len(),
        });
    }
    Ok(a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(name: &str, rows: &[(&[f32], usize)]) -> ImageFeatures {
        ImageFeatures {
            file_name: name.to_string(),
            features: rows.iter().map(|(f, _)| f.to_vec()).collect(),
            labels: rows.iter().map(|(_, l)| *l).collect(),
        }
    }

    fn sampler(pool_size: usize, samples_needed: usize) -> PrototypeSampler {
        PrototypeSampler::new(
            2,
            SamplerConfig {
                pool_size,
                samples_needed,
            },
        )
    }

    #[test]
    fn test_offer_fills_first_open_pool() {
        let mut s = sampler(1, 1);
        assert!(s.offer(image("a.jpg", &[(&[1.0, 0.0], 0), (&[0.0, 1.0], 1)])).unwrap());
        assert!(s.pool(0).unwrap().contains("a.jpg"));
        assert!(s.pool(1).unwrap().is_empty());

        // Class 0 full, so this one goes to class 1
        assert!(s.offer(image("b.jpg", &[(&[1.0, 0.0], 0), (&[0.0, 1.0], 1)])).unwrap());
        assert!(s.pool(1).unwrap().contains("b.jpg"));
        assert!(s.is_saturated());

        assert!(!s.offer(image("c.jpg", &[(&[1.0, 0.0], 0)])).unwrap());
    }

    #[test]
    fn test_unknown_class() {
        let mut s = sampler(1, 1);
        let err = s.offer(image("a.jpg", &[(&[1.0], 7)])).unwrap_err();
        assert!(matches!(err, GradMemError::UnknownClass(7)));
    }

    #[test]
    fn test_prototypes_average_per_label_first() {
        let mut s = sampler(4, 4);
        // Two class-0 boxes in one image average to [2, 0] before the prototype
        s.offer(image("a.jpg", &[(&[1.0, 0.0], 0), (&[3.0, 0.0], 0)])).unwrap();
        s.offer(image("b.jpg", &[(&[4.0, 0.0], 0)])).unwrap();
        let protos = s.build_prototypes().unwrap();
        assert_eq!(protos[&0], vec![3.0, 0.0]);
    }

    #[test]
    fn test_rank_orders_by_distance() {
        let mut s = sampler(3, 2);
        s.offer(image("far.jpg", &[(&[10.0, 10.0], 0)])).unwrap();
        s.offer(image("near.jpg", &[(&[1.0, 1.0], 0)])).unwrap();
        s.offer(image("mid.jpg", &[(&[2.0, 2.0], 0)])).unwrap();
        let mut protos = BTreeMap::new();
        protos.insert(0, vec![0.0, 0.0]);
        let ranked = s.rank(&protos, 2).unwrap();
        assert_eq!(ranked[&0], vec!["near.jpg".to_string(), "mid.jpg".to_string()]);
        assert!(ranked[&1].is_empty());
    }

    #[test]
    fn test_select_uses_own_prototypes() {
        let mut s = sampler(3, 1);
        s.offer(image("a.jpg", &[(&[0.0], 0)])).unwrap();
        s.offer(image("b.jpg", &[(&[1.0], 0)])).unwrap();
        s.offer(image("c.jpg", &[(&[5.0], 0)])).unwrap();
        // Prototype is 2.0, closest is b.jpg
        let picked = s.select().unwrap();
        assert_eq!(picked[&0], vec!["b.jpg".to_string()]);
    }

    #[test]
    fn test_mismatched_rows_and_labels() {
        let mut s = sampler(1, 1);
        let bad = ImageFeatures {
            file_name: "x.jpg".into(),
            features: vec![vec![1.0]],
            labels: vec![0, 1],
        };
        assert!(s.offer(bad).is_err());
    }
}
