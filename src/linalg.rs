//! Dense linear-algebra helpers for subspace maintenance.

use nalgebra::DMatrix;

/// Left singular vectors and singular values of a thin SVD, ordered by
/// descending singular value.
#[derive(Clone, Debug)]
pub struct LeftSvd {
    /// `rows × min(rows, cols)`, columns orthonormal.
    pub u: DMatrix<f64>,
    pub s: Vec<f64>,
}

impl LeftSvd {
    /// Σ sᵢ², the squared Frobenius norm of the decomposed matrix.
    pub fn energy(&self) -> f64 {
        self.s.iter().map(|s| s * s).sum()
    }

    /// First `r` left singular vectors.
    pub fn leading(&self, r: usize) -> DMatrix<f64> {
        self.u.columns(0, r.min(self.u.ncols())).into_owned()
    }
}

/// Thin SVD keeping only `U` and `S`.
///
/// Returns `None` if the iteration does not converge.
pub fn left_svd(mat: &DMatrix<f64>) -> Option<LeftSvd> {
    let svd = mat.clone().try_svd(true, false, f64::EPSILON, 0)?;
    let u = svd.u?;
    let values: Vec<f64> = svd.singular_values.iter().copied().collect();

    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| {
        values[b]
            .partial_cmp(&values[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let sorted_u = DMatrix::from_fn(u.nrows(), order.len(), |r, c| u[(r, order[c])]);
    let s = order.iter().map(|&i| values[i]).collect();
    Some(LeftSvd { u: sorted_u, s })
}

/// Number of leading components whose cumulative energy ratio stays
/// strictly below `threshold`.
///
/// With ratios `pᵢ = sᵢ² / Σ s²`, counts the prefixes `k` for which
/// `p₁ + … + p_k < threshold`.
pub fn energy_rank(s: &[f64], threshold: f64) -> usize {
    let total: f64 = s.iter().map(|v| v * v).sum();
    if total <= 0.0 {
        return 0;
    }
    let mut cumulative = 0.0;
    s.iter()
        .map(|v| {
            cumulative += v * v / total;
            cumulative
        })
        .filter(|&c| c < threshold)
        .count()
}

/// Concatenate the columns of `a` and `b`.
pub fn hstack(a: &DMatrix<f64>, b: &DMatrix<f64>) -> DMatrix<f64> {
    debug_assert_eq!(a.nrows(), b.nrows());
    let split = a.ncols();
    DMatrix::from_fn(a.nrows(), split + b.ncols(), |r, c| {
        if c < split {
            a[(r, c)]
        } else {
            b[(r, c - split)]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_left_svd_sorted_and_orthonormal() {
        let m = DMatrix::from_row_slice(3, 4, &[
            1.0, 0.0, 0.0, 2.0, //
            0.0, 5.0, 0.0, 0.0, //
            0.0, 0.0, 3.0, 0.0,
        ]);
        let svd = left_svd(&m).unwrap();
        assert_eq!(svd.u.shape(), (3, 3));
        for w in svd.s.windows(2) {
            assert!(w[0] >= w[1]);
        }
        assert!((svd.s[0] - 5.0).abs() < 1e-10);
        let gram = svd.u.transpose() * &svd.u;
        assert!((gram - DMatrix::<f64>::identity(3, 3)).norm() < 1e-10);
        assert!((svd.energy() - m.norm_squared()).abs() < 1e-9);
    }

    #[test]
    fn test_energy_rank_boundaries() {
        // Energies 16, 9, 0 over 25: cumulative 0.64, 1.0, 1.0
        let s = [4.0, 3.0, 0.0];
        assert_eq!(energy_rank(&s, 0.0), 0);
        assert_eq!(energy_rank(&s, 0.64), 0);
        assert_eq!(energy_rank(&s, 0.65), 1);
        assert_eq!(energy_rank(&s, 0.99), 1);
        assert_eq!(energy_rank(&s, 1.01), 3);
    }

    #[test]
    fn test_energy_rank_zero_energy() {
        assert_eq!(energy_rank(&[0.0, 0.0], 0.9), 0);
    }

    #[test]
    fn test_hstack() {
        let a = DMatrix::from_element(2, 1, 1.0);
        let b = DMatrix::from_element(2, 2, 2.0);
        let c = hstack(&a, &b);
        assert_eq!(c.shape(), (2, 3));
        assert_eq!(c[(1, 0)], 1.0);
        assert_eq!(c[(1, 2)], 2.0);
    }
}
