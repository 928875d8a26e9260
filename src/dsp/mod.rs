//! Numeric kernels for the watermark transform chain.
//!
//! Plain `f64` loops, no external linear algebra. The watermark engine only
//! ever feeds these fixed small shapes (even-sized planes, 4x4 blocks), but
//! the kernels are written for arbitrary sizes so they can be tested in
//! isolation.

pub mod dct;
pub mod dwt;
pub mod svd;

pub use dct::{dct2_forward, dct2_inverse};
pub use dwt::{haar2_forward, haar2_inverse, Subbands};
pub use svd::Svd;
