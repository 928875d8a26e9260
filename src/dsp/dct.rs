//! Orthonormal DCT-II and its inverse (DCT-III).
//!
//! X[k] = s(k) * sum_n x[n] * cos(pi * k * (2n+1) / (2N))
//! with s(0) = sqrt(1/N) and s(k>0) = sqrt(2/N). The inverse applies the
//! same coefficients transposed, so forward followed by inverse is the
//! identity up to floating-point rounding.

use std::f64::consts::PI;

fn scale(k: usize, n: usize) -> f64 {
    if k == 0 {
        (1.0 / n as f64).sqrt()
    } else {
        (2.0 / n as f64).sqrt()
    }
}

/// 1-D orthonormal DCT-II of `src` into `dst`. Both slices share a length.
pub fn dct1_forward(src: &[f64], dst: &mut [f64]) {
    let n = src.len();
    debug_assert_eq!(n, dst.len());
    for (k, out) in dst.iter_mut().enumerate() {
        let mut acc = 0.0;
        for (i, &x) in src.iter().enumerate() {
            acc += x * (PI * k as f64 * (2.0 * i as f64 + 1.0) / (2.0 * n as f64)).cos();
        }
        *out = scale(k, n) * acc;
    }
}

/// 1-D inverse (DCT-III): x[i] = sum_k s(k) * X[k] * cos(pi*k*(2i+1)/(2N)).
pub fn dct1_inverse(src: &[f64], dst: &mut [f64]) {
    let n = src.len();
    debug_assert_eq!(n, dst.len());
    for (i, out) in dst.iter_mut().enumerate() {
        let mut acc = 0.0;
        for (k, &x) in src.iter().enumerate() {
            acc += scale(k, n) * x * (PI * k as f64 * (2.0 * i as f64 + 1.0) / (2.0 * n as f64)).cos();
        }
        *out = acc;
    }
}

/// Separable 2-D DCT-II over a row-major `rows x cols` plane, in place.
/// Rows first, then columns of the intermediate.
pub fn dct2_forward(plane: &mut [f64], rows: usize, cols: usize) {
    apply_separable(plane, rows, cols, dct1_forward, Axis::RowsThenCols);
}

/// Separable 2-D inverse. Columns first, then rows, mirroring the forward
/// order so the pair round-trips exactly.
pub fn dct2_inverse(plane: &mut [f64], rows: usize, cols: usize) {
    apply_separable(plane, rows, cols, dct1_inverse, Axis::ColsThenRows);
}

enum Axis {
    RowsThenCols,
    ColsThenRows,
}

fn apply_separable(
    plane: &mut [f64],
    rows: usize,
    cols: usize,
    kernel: fn(&[f64], &mut [f64]),
    order: Axis,
) {
    debug_assert_eq!(plane.len(), rows * cols);
    let mut scratch_in = vec![0.0; rows.max(cols)];
    let mut scratch_out = vec![0.0; rows.max(cols)];

    match order {
        Axis::RowsThenCols => {
            row_pass(plane, rows, cols, kernel, &mut scratch_in, &mut scratch_out);
            col_pass(plane, rows, cols, kernel, &mut scratch_in, &mut scratch_out);
        }
        Axis::ColsThenRows => {
            col_pass(plane, rows, cols, kernel, &mut scratch_in, &mut scratch_out);
            row_pass(plane, rows, cols, kernel, &mut scratch_in, &mut scratch_out);
        }
    }
}

fn row_pass(
    plane: &mut [f64],
    rows: usize,
    cols: usize,
    kernel: fn(&[f64], &mut [f64]),
    scratch_in: &mut [f64],
    scratch_out: &mut [f64],
) {
    for r in 0..rows {
        let row = &mut plane[r * cols..(r + 1) * cols];
        scratch_in[..cols].copy_from_slice(row);
        kernel(&scratch_in[..cols], &mut scratch_out[..cols]);
        row.copy_from_slice(&scratch_out[..cols]);
    }
}

fn col_pass(
    plane: &mut [f64],
    rows: usize,
    cols: usize,
    kernel: fn(&[f64], &mut [f64]),
    scratch_in: &mut [f64],
    scratch_out: &mut [f64],
) {
    for c in 0..cols {
        for r in 0..rows {
            scratch_in[r] = plane[r * cols + c];
        }
        kernel(&scratch_in[..rows], &mut scratch_out[..rows]);
        for r in 0..rows {
            plane[r * cols + c] = scratch_out[r];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn max_abs_diff(a: &[f64], b: &[f64]) -> f64 {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f64::max)
    }

    #[test]
    fn constant_block_concentrates_in_dc() {
        // 4x4 all-4.0: orthonormal DC is sqrt(1/4)*sqrt(1/4)*sum = 16.0 exactly.
        let mut plane = vec![4.0; 16];
        dct2_forward(&mut plane, 4, 4);
        assert!((plane[0] - 16.0).abs() < 1e-12, "dc = {}", plane[0]);
        for (i, &c) in plane.iter().enumerate().skip(1) {
            assert!(c.abs() <= 1e-9, "ac coefficient {i} = {c}");
        }
    }

    #[test]
    fn one_dimensional_round_trip() {
        let mut rng = StdRng::seed_from_u64(11);
        for n in [1usize, 2, 3, 8, 17, 64] {
            let src: Vec<f64> = (0..n).map(|_| rng.gen_range(-100.0..100.0)).collect();
            let mut freq = vec![0.0; n];
            let mut back = vec![0.0; n];
            dct1_forward(&src, &mut freq);
            dct1_inverse(&freq, &mut back);
            assert!(max_abs_diff(&src, &back) < 1e-9, "n={n}");
        }
    }

    #[test]
    fn two_dimensional_round_trip_64x64() {
        let mut rng = StdRng::seed_from_u64(12);
        let src: Vec<f64> = (0..64 * 64).map(|_| rng.gen_range(-128.0..128.0)).collect();
        let mut plane = src.clone();
        dct2_forward(&mut plane, 64, 64);
        dct2_inverse(&mut plane, 64, 64);
        assert!(max_abs_diff(&src, &plane) < 1e-9);
    }

    #[test]
    fn rectangular_round_trip() {
        let mut rng = StdRng::seed_from_u64(13);
        let (rows, cols) = (12, 20);
        let src: Vec<f64> = (0..rows * cols).map(|_| rng.gen_range(-50.0..50.0)).collect();
        let mut plane = src.clone();
        dct2_forward(&mut plane, rows, cols);
        dct2_inverse(&mut plane, rows, cols);
        assert!(max_abs_diff(&src, &plane) < 1e-9);
    }

    #[test]
    fn forward_preserves_energy() {
        // Orthonormal transform: Parseval holds.
        let mut rng = StdRng::seed_from_u64(14);
        let src: Vec<f64> = (0..16 * 16).map(|_| rng.gen_range(-10.0..10.0)).collect();
        let mut plane = src.clone();
        dct2_forward(&mut plane, 16, 16);
        let before: f64 = src.iter().map(|x| x * x).sum();
        let after: f64 = plane.iter().map(|x| x * x).sum();
        assert!((before - after).abs() < 1e-6);
    }
}
