//! Thin SVD of small square matrices via one-sided (Hestenes) Jacobi.
//!
//! The engine only decomposes 4x4 DCT blocks, modulates the largest
//! singular value, and recomposes. U and V must come back orthogonal so the
//! reconstruction error stays at rounding level.

const SWEEP_LIMIT: usize = 60;
const OFF_DIAG_EPS: f64 = 1e-14;
const RANK_EPS: f64 = 1e-12;

/// Decomposition `M = U * diag(sigma) * V^T` with `sigma` non-increasing
/// and U, V orthogonal. All matrices are row-major `n x n`.
#[derive(Clone, Debug)]
pub struct Svd {
    pub u: Vec<f64>,
    pub sigma: Vec<f64>,
    pub v: Vec<f64>,
    pub n: usize,
}

impl Svd {
    /// Decompose a row-major `n x n` matrix.
    pub fn decompose(m: &[f64], n: usize) -> Self {
        debug_assert_eq!(m.len(), n * n);

        // Work column-wise: g[c] is the c-th column of the working matrix.
        let mut g: Vec<Vec<f64>> = (0..n).map(|c| (0..n).map(|r| m[r * n + c]).collect()).collect();
        let mut v = identity(n);

        for _ in 0..SWEEP_LIMIT {
            let mut rotated = false;
            for p in 0..n {
                for q in (p + 1)..n {
                    let alpha: f64 = dot(&g[p], &g[p]);
                    let beta: f64 = dot(&g[q], &g[q]);
                    let gamma: f64 = dot(&g[p], &g[q]);
                    if gamma.abs() <= OFF_DIAG_EPS * (alpha * beta).sqrt().max(OFF_DIAG_EPS) {
                        continue;
                    }
                    rotated = true;
                    let zeta = (beta - alpha) / (2.0 * gamma);
                    let t = zeta.signum() / (zeta.abs() + (1.0 + zeta * zeta).sqrt());
                    let cs = 1.0 / (1.0 + t * t).sqrt();
                    let sn = cs * t;
                    for r in 0..n {
                        let (gp, gq) = (g[p][r], g[q][r]);
                        g[p][r] = cs * gp - sn * gq;
                        g[q][r] = sn * gp + cs * gq;
                        let (vp, vq) = (v[r * n + p], v[r * n + q]);
                        v[r * n + p] = cs * vp - sn * vq;
                        v[r * n + q] = sn * vp + cs * vq;
                    }
                }
            }
            if !rotated {
                break;
            }
        }

        // Singular values are the column norms; normalise into U.
        let mut order: Vec<usize> = (0..n).collect();
        let norms: Vec<f64> = g.iter().map(|col| dot(col, col).sqrt()).collect();
        order.sort_by(|&a, &b| norms[b].partial_cmp(&norms[a]).unwrap_or(std::cmp::Ordering::Equal));

        let mut sigma = vec![0.0; n];
        let mut u = vec![0.0; n * n];
        let mut v_sorted = vec![0.0; n * n];
        for (dst, &src) in order.iter().enumerate() {
            sigma[dst] = norms[src];
            for r in 0..n {
                v_sorted[r * n + dst] = v[r * n + src];
            }
            if norms[src] > RANK_EPS {
                for r in 0..n {
                    u[r * n + dst] = g[src][r] / norms[src];
                }
            }
        }
        fill_null_columns(&mut u, &sigma, n);

        Svd {
            u,
            sigma,
            v: v_sorted,
            n,
        }
    }

    /// Recompose `U * diag(sigma) * V^T` into a row-major matrix.
    pub fn recompose(&self) -> Vec<f64> {
        let n = self.n;
        let mut out = vec![0.0; n * n];
        for r in 0..n {
            for c in 0..n {
                let mut acc = 0.0;
                for k in 0..n {
                    acc += self.u[r * n + k] * self.sigma[k] * self.v[c * n + k];
                }
                out[r * n + c] = acc;
            }
        }
        out
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn identity(n: usize) -> Vec<f64> {
    let mut m = vec![0.0; n * n];
    for i in 0..n {
        m[i * n + i] = 1.0;
    }
    m
}

/// Replace U columns belonging to (numerically) zero singular values with
/// unit vectors orthogonal to the columns already present, so U stays
/// orthogonal and the recomposition is well defined after sigma[0] is
/// raised above zero.
fn fill_null_columns(u: &mut [f64], sigma: &[f64], n: usize) {
    for c in 0..n {
        if sigma[c] > RANK_EPS {
            continue;
        }
        // Gram-Schmidt a standard basis vector against the existing columns.
        'candidates: for e in 0..n {
            let mut cand = vec![0.0; n];
            cand[e] = 1.0;
            for prev in 0..n {
                if prev == c || (sigma[prev] <= RANK_EPS && prev > c) {
                    continue;
                }
                let proj: f64 = (0..n).map(|r| cand[r] * u[r * n + prev]).sum();
                for (r, item) in cand.iter_mut().enumerate() {
                    *item -= proj * u[r * n + prev];
                }
            }
            let norm = dot(&cand, &cand).sqrt();
            if norm > 0.1 {
                for r in 0..n {
                    u[r * n + c] = cand[r] / norm;
                }
                break 'candidates;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn max_abs_diff(a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
    }

    fn assert_orthogonal(m: &[f64], n: usize) {
        for i in 0..n {
            for j in 0..n {
                let mut acc = 0.0;
                for r in 0..n {
                    acc += m[r * n + i] * m[r * n + j];
                }
                let expect = if i == j { 1.0 } else { 0.0 };
                assert!((acc - expect).abs() < 1e-9, "col {i} . col {j} = {acc}");
            }
        }
    }

    #[test]
    fn decompose_recompose_random_4x4() {
        let mut rng = StdRng::seed_from_u64(31);
        for _ in 0..50 {
            let m: Vec<f64> = (0..16).map(|_| rng.gen_range(-200.0..200.0)).collect();
            let svd = Svd::decompose(&m, 4);
            assert_orthogonal(&svd.u, 4);
            assert_orthogonal(&svd.v, 4);
            assert!(svd.sigma.windows(2).all(|w| w[0] >= w[1] - 1e-12));
            assert!(svd.sigma.iter().all(|&s| s >= 0.0));
            assert!(max_abs_diff(&m, &svd.recompose()) < 1e-9);
        }
    }

    #[test]
    fn largest_singular_value_modulation_round_trips() {
        // The embedding path: decompose, overwrite sigma[0], recompose,
        // decompose again. The new sigma[0] must read back exactly.
        let mut rng = StdRng::seed_from_u64(32);
        for _ in 0..25 {
            let m: Vec<f64> = (0..16).map(|_| rng.gen_range(-100.0..100.0)).collect();
            let mut svd = Svd::decompose(&m, 4);
            let target = (svd.sigma[0] / 36.0).floor().mul_add(36.0, 27.0);
            svd.sigma[0] = target;
            let rebuilt = Svd::decompose(&svd.recompose(), 4);
            assert!((rebuilt.sigma[0] - target).abs() < 1e-7);
        }
    }

    #[test]
    fn rank_deficient_matrix_keeps_u_orthogonal() {
        // All-zero block: every sigma is 0 and U must still be orthogonal
        // so raising sigma[0] produces a valid reconstruction.
        let svd = Svd::decompose(&[0.0; 16], 4);
        assert!(svd.sigma.iter().all(|&s| s == 0.0));
        assert_orthogonal(&svd.u, 4);
        assert_orthogonal(&svd.v, 4);
    }

    #[test]
    fn diagonal_matrix_recovers_entries() {
        let m = [
            5.0, 0.0, 0.0, 0.0, //
            0.0, 0.5, 0.0, 0.0, //
            0.0, 0.0, 9.0, 0.0, //
            0.0, 0.0, 0.0, 2.0,
        ];
        let svd = Svd::decompose(&m, 4);
        let got = &svd.sigma;
        assert!((got[0] - 9.0).abs() < 1e-10);
        assert!((got[1] - 5.0).abs() < 1e-10);
        assert!((got[2] - 2.0).abs() < 1e-10);
        assert!((got[3] - 0.5).abs() < 1e-10);
    }
}
