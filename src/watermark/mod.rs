//! Blind frequency-domain watermarking.
//!
//! The invisible mark lives in the U chrominance plane: one Haar level, 4x4
//! DCT blocks over the LL subband, and quantisation of the largest singular
//! value of each block. `image` holds the still engine, `video` the I-frame
//! wrapper, `yuv` the Rec.601 plane conversion.

pub mod image;
pub mod video;
pub mod yuv;

/// Quantisation step applied to the largest singular value.
pub const ALPHA: f64 = 36.0;
/// Side length of the DCT/SVD blocks cut from the LL subband.
pub const BLOCK: usize = 4;
/// Identifier written to the forensic index next to each embed.
pub const ALGORITHM_TAG: &str = "dwtDctSvd-native";

/// JPEG quality used for published stills unless the caller overrides it.
pub const DEFAULT_JPEG_QUALITY: u8 = 92;
