//! Single-level Haar DWT in the averaging form.
//!
//! For even-length input, a[i] = (src[2i] + src[2i+1]) / 2 and
//! d[i] = (src[2i] - src[2i+1]) / 2; the inverse recombines as a[i] + d[i]
//! and a[i] - d[i]. This form is not orthonormal, and it is kept on purpose:
//! the quantisation embedding was calibrated against it and the round trip
//! is exact for dyadic inputs.

/// The four subbands of one 2-D Haar level, each `rows/2 x cols/2` row-major.
#[derive(Clone, Debug)]
pub struct Subbands {
    pub ll: Vec<f64>,
    pub lh: Vec<f64>,
    pub hl: Vec<f64>,
    pub hh: Vec<f64>,
    /// Subband height (half the input height).
    pub rows: usize,
    /// Subband width (half the input width).
    pub cols: usize,
}

/// 1-D forward step: `src` (even length) into `[a | d]` halves of `dst`.
pub fn haar1_forward(src: &[f64], dst: &mut [f64]) {
    let half = src.len() / 2;
    debug_assert_eq!(src.len() % 2, 0);
    debug_assert_eq!(src.len(), dst.len());
    for i in 0..half {
        let (x0, x1) = (src[2 * i], src[2 * i + 1]);
        dst[i] = (x0 + x1) / 2.0;
        dst[half + i] = (x0 - x1) / 2.0;
    }
}

/// 1-D inverse step: `[a | d]` halves of `src` back into interleaved `dst`.
pub fn haar1_inverse(src: &[f64], dst: &mut [f64]) {
    let half = src.len() / 2;
    debug_assert_eq!(src.len() % 2, 0);
    debug_assert_eq!(src.len(), dst.len());
    for i in 0..half {
        let (a, d) = (src[i], src[half + i]);
        dst[2 * i] = a + d;
        dst[2 * i + 1] = a - d;
    }
}

/// 2-D forward: separable, rows then columns, split into four subbands.
/// `rows` and `cols` must both be even.
pub fn haar2_forward(plane: &[f64], rows: usize, cols: usize) -> Subbands {
    debug_assert_eq!(plane.len(), rows * cols);
    debug_assert!(rows % 2 == 0 && cols % 2 == 0);

    // Row pass over the full plane.
    let mut inter = vec![0.0; rows * cols];
    let mut line = vec![0.0; cols.max(rows)];
    for r in 0..rows {
        haar1_forward(&plane[r * cols..(r + 1) * cols], &mut line[..cols]);
        inter[r * cols..(r + 1) * cols].copy_from_slice(&line[..cols]);
    }

    // Column pass, then scatter into subbands.
    let (hr, hc) = (rows / 2, cols / 2);
    let mut ll = vec![0.0; hr * hc];
    let mut lh = vec![0.0; hr * hc];
    let mut hl = vec![0.0; hr * hc];
    let mut hh = vec![0.0; hr * hc];
    let mut col_in = vec![0.0; rows];
    let mut col_out = vec![0.0; rows];
    for c in 0..cols {
        for r in 0..rows {
            col_in[r] = inter[r * cols + c];
        }
        haar1_forward(&col_in, &mut col_out);
        for r in 0..hr {
            let (lo, hi) = (col_out[r], col_out[hr + r]);
            if c < hc {
                ll[r * hc + c] = lo;
                hl[r * hc + c] = hi;
            } else {
                lh[r * hc + (c - hc)] = lo;
                hh[r * hc + (c - hc)] = hi;
            }
        }
    }

    Subbands {
        ll,
        lh,
        hl,
        hh,
        rows: hr,
        cols: hc,
    }
}

/// 2-D inverse: recombine the four subbands into a `2*rows x 2*cols` plane.
pub fn haar2_inverse(bands: &Subbands) -> Vec<f64> {
    let (hr, hc) = (bands.rows, bands.cols);
    let (rows, cols) = (hr * 2, hc * 2);

    // Undo the column pass: stack [lo | hi] per column and invert.
    let mut inter = vec![0.0; rows * cols];
    let mut col_in = vec![0.0; rows];
    let mut col_out = vec![0.0; rows];
    for c in 0..cols {
        for r in 0..hr {
            let (lo, hi) = if c < hc {
                (bands.ll[r * hc + c], bands.hl[r * hc + c])
            } else {
                (bands.lh[r * hc + (c - hc)], bands.hh[r * hc + (c - hc)])
            };
            col_in[r] = lo;
            col_in[hr + r] = hi;
        }
        haar1_inverse(&col_in, &mut col_out);
        for r in 0..rows {
            inter[r * cols + c] = col_out[r];
        }
    }

    // Undo the row pass.
    let mut out = vec![0.0; rows * cols];
    let mut line = vec![0.0; cols];
    for r in 0..rows {
        haar1_inverse(&inter[r * cols..(r + 1) * cols], &mut line);
        out[r * cols..(r + 1) * cols].copy_from_slice(&line);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn constant_plane_collapses_to_ll() {
        let plane = vec![4.0; 16];
        let bands = haar2_forward(&plane, 4, 4);
        assert!(bands.ll.iter().all(|&v| (v - 4.0).abs() < 1e-12));
        assert!(bands.lh.iter().all(|&v| v == 0.0));
        assert!(bands.hl.iter().all(|&v| v == 0.0));
        assert!(bands.hh.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn one_dimensional_round_trip_is_exact() {
        let src = [3.0, 7.0, -1.0, 5.5, 0.25, -8.0];
        let mut fwd = [0.0; 6];
        let mut back = [0.0; 6];
        haar1_forward(&src, &mut fwd);
        haar1_inverse(&fwd, &mut back);
        assert_eq!(src, back);
    }

    #[test]
    fn two_dimensional_round_trip_up_to_256() {
        let mut rng = StdRng::seed_from_u64(21);
        for (rows, cols) in [(2usize, 2usize), (4, 8), (30, 14), (256, 256)] {
            let src: Vec<f64> = (0..rows * cols).map(|_| rng.gen_range(0.0..255.0)).collect();
            let bands = haar2_forward(&src, rows, cols);
            let back = haar2_inverse(&bands);
            let worst = src
                .iter()
                .zip(&back)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max);
            assert!(worst < 1e-10, "{rows}x{cols}: worst={worst}");
        }
    }

    #[test]
    fn ll_modification_survives_round_trip() {
        // The embedder rewrites LL and feeds the untouched detail bands back.
        let mut rng = StdRng::seed_from_u64(22);
        let src: Vec<f64> = (0..64).map(|_| rng.gen_range(0.0..255.0)).collect();
        let mut bands = haar2_forward(&src, 8, 8);
        for v in bands.ll.iter_mut() {
            *v += 9.0;
        }
        let modified = haar2_inverse(&bands);
        let reread = haar2_forward(&modified, 8, 8);
        for (a, b) in bands.ll.iter().zip(&reread.ll) {
            assert!((a - b).abs() < 1e-10);
        }
        for (a, b) in bands.hh.iter().zip(&reread.hh) {
            assert!((a - b).abs() < 1e-10);
        }
    }
}
