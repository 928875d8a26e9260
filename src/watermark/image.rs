//! Blind still-image watermark engine.
//!
//! Embed: trim to a 4-aligned region, convert to YUV, one Haar level on U,
//! then per 4x4 LL block: DCT, SVD, quantise the largest singular value
//! around the payload bit, rebuild. Decode runs the identical transform and
//! accumulates per-bit-position scores across all blocks.
//!
//! The plane-level entry points operate on the floating-point U plane and
//! round-trip bit-exactly; the frame-level entry points add the u8 colour
//! conversion, whose rounding stays well inside the quantisation margin.

use std::fs;
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, ImageReader, RgbaImage};

use crate::dsp::{dct2_forward, dct2_inverse, haar2_forward, haar2_inverse, Svd};
use crate::error::{Error, Result};
use crate::payload::{bits_to_bytes, bytes_to_bits, PAYLOAD_BITS, PAYLOAD_LEN};
use crate::watermark::yuv;
use crate::watermark::{ALPHA, BLOCK};

/// Geometry of the embedding region for a given frame size.
struct Geometry {
    width: usize,
    height: usize,
    /// Blocks per LL row / column.
    blocks_x: usize,
    blocks_y: usize,
}

impl Geometry {
    fn for_frame(width: u32, height: u32) -> Result<Self> {
        let w = (width as usize / 4) * 4;
        let h = (height as usize / 4) * 4;
        if w < 8 || h < 8 {
            return Err(Error::ImageTooSmall(format!(
                "trimmed region {w}x{h} is below the 8x8 minimum"
            )));
        }
        let blocks_x = (w / 2) / BLOCK;
        let blocks_y = (h / 2) / BLOCK;
        let total = blocks_x * blocks_y;
        if total < PAYLOAD_BITS {
            return Err(Error::ImageTooSmall(format!(
                "{total} blocks available, {PAYLOAD_BITS} needed"
            )));
        }
        Ok(Self {
            width: w,
            height: h,
            blocks_x,
            blocks_y,
        })
    }
}

/// Embed `bits` (length 128, values 0/1) into a floating-point U plane of
/// `height x width`, in place. Both dimensions must be multiples of 4.
pub fn embed_plane(u_plane: &mut Vec<f64>, width: usize, height: usize, bits: &[u8]) {
    debug_assert_eq!(bits.len(), PAYLOAD_BITS);
    debug_assert!(width % 4 == 0 && height % 4 == 0);

    let mut bands = haar2_forward(u_plane, height, width);
    let (ll_rows, ll_cols) = (bands.rows, bands.cols);
    let (blocks_y, blocks_x) = (ll_rows / BLOCK, ll_cols / BLOCK);

    let mut block = [0.0f64; BLOCK * BLOCK];
    for by in 0..blocks_y {
        for bx in 0..blocks_x {
            let n = by * blocks_x + bx;
            copy_block(&bands.ll, ll_cols, by, bx, &mut block);
            dct2_forward(&mut block, BLOCK, BLOCK);

            let mut svd = Svd::decompose(&block, BLOCK);
            let bit = bits[n % PAYLOAD_BITS] as f64;
            svd.sigma[0] = ((svd.sigma[0] / ALPHA).floor() + 0.25 + 0.5 * bit) * ALPHA;

            let mut rebuilt = svd.recompose();
            dct2_inverse(&mut rebuilt, BLOCK, BLOCK);
            paste_block(&mut bands.ll, ll_cols, by, bx, &rebuilt);
        }
    }

    *u_plane = haar2_inverse(&bands);
}

/// Decode 128 bits from a floating-point U plane by per-position score
/// accumulation over every block.
pub fn decode_plane(u_plane: &[f64], width: usize, height: usize) -> Vec<u8> {
    debug_assert!(width % 4 == 0 && height % 4 == 0);

    let bands = haar2_forward(u_plane, height, width);
    let (ll_rows, ll_cols) = (bands.rows, bands.cols);
    let (blocks_y, blocks_x) = (ll_rows / BLOCK, ll_cols / BLOCK);

    let mut score_sum = [0u64; PAYLOAD_BITS];
    let mut score_count = [0u64; PAYLOAD_BITS];
    let mut block = [0.0f64; BLOCK * BLOCK];
    for by in 0..blocks_y {
        for bx in 0..blocks_x {
            let n = by * blocks_x + bx;
            copy_block(&bands.ll, ll_cols, by, bx, &mut block);
            dct2_forward(&mut block, BLOCK, BLOCK);

            let svd = Svd::decompose(&block, BLOCK);
            let m = svd.sigma[0].rem_euclid(ALPHA);
            let raw = u64::from(m > ALPHA / 2.0);
            score_sum[n % PAYLOAD_BITS] += raw;
            score_count[n % PAYLOAD_BITS] += 1;
        }
    }

    (0..PAYLOAD_BITS)
        .map(|i| {
            if score_count[i] == 0 {
                return 0;
            }
            let scaled = score_sum[i] as f64 / score_count[i] as f64 * 255.0;
            u8::from(scaled > 127.0)
        })
        .collect()
}

/// Embed the 16-byte payload into a frame. The output has identical
/// dimensions; rows and columns outside the 4-aligned region pass through.
pub fn embed_frame(frame: &RgbaImage, payload: &[u8; PAYLOAD_LEN]) -> Result<RgbaImage> {
    let geom = Geometry::for_frame(frame.width(), frame.height())?;
    let bits = bytes_to_bits(payload);

    let mut planes = yuv::split_region(frame, geom.width, geom.height);
    embed_plane(&mut planes.u, geom.width, geom.height, &bits);

    let mut out = frame.clone();
    yuv::merge_region(&mut out, &planes);
    Ok(out)
}

/// Decode the 16-byte payload from a frame.
pub fn decode_frame(frame: &RgbaImage) -> Result<[u8; PAYLOAD_LEN]> {
    let geom = Geometry::for_frame(frame.width(), frame.height())?;
    let planes = yuv::split_region(frame, geom.width, geom.height);
    let bits = decode_plane(&planes.u, geom.width, geom.height);
    let bytes = bits_to_bytes(&bits);
    let mut payload = [0u8; PAYLOAD_LEN];
    payload.copy_from_slice(&bytes);
    Ok(payload)
}

/// Report how many blocks a frame offers; used by callers to pre-validate.
pub fn block_capacity(width: u32, height: u32) -> Result<usize> {
    let geom = Geometry::for_frame(width, height)?;
    Ok(geom.blocks_x * geom.blocks_y)
}

/// Load a still from disk as RGBA, surfacing parser rejections as
/// `DecodeFailed`.
pub fn load_frame(path: &Path) -> Result<RgbaImage> {
    let reader = ImageReader::open(path)
        .map_err(|e| Error::DecodeFailed(format!("{}: {e}", path.display())))?;
    let img = reader
        .decode()
        .map_err(|e| Error::DecodeFailed(format!("{}: {e}", path.display())))?;
    Ok(img.to_rgba8())
}

/// Persist a marked frame. JPEG output honours `jpeg_quality`; PNG is
/// lossless. Any other extension is the caller's transcoding problem.
pub fn save_frame(frame: &RgbaImage, path: &Path, jpeg_quality: u8) -> Result<()> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => {
            let file = fs::File::create(path)?;
            let mut encoder = JpegEncoder::new_with_quality(file, jpeg_quality);
            // JPEG has no alpha; drop to RGB at the boundary.
            let rgb = image::DynamicImage::ImageRgba8(frame.clone()).to_rgb8();
            encoder
                .encode_image(&rgb)
                .map_err(|e| Error::Internal(format!("jpeg encode: {e}")))?;
            Ok(())
        }
        "png" => {
            frame
                .save_with_format(path, ImageFormat::Png)
                .map_err(|e| Error::Internal(format!("png encode: {e}")))?;
            Ok(())
        }
        other => Err(Error::UnsupportedMedia(format!(
            "invisible layer outputs jpg/png, got '{other}'"
        ))),
    }
}

/// File-to-file embed used by the workers.
pub fn embed_image_file(
    input: &Path,
    output: &Path,
    payload: &[u8; PAYLOAD_LEN],
    jpeg_quality: u8,
) -> Result<()> {
    let frame = load_frame(input)?;
    let marked = embed_frame(&frame, payload)?;
    save_frame(&marked, output, jpeg_quality)
}

/// File-level decode used by the detect path.
pub fn decode_image_file(path: &Path) -> Result<[u8; PAYLOAD_LEN]> {
    let frame = load_frame(path)?;
    decode_frame(&frame)
}

fn copy_block(ll: &[f64], ll_cols: usize, by: usize, bx: usize, block: &mut [f64]) {
    for r in 0..BLOCK {
        let src = (by * BLOCK + r) * ll_cols + bx * BLOCK;
        block[r * BLOCK..(r + 1) * BLOCK].copy_from_slice(&ll[src..src + BLOCK]);
    }
}

fn paste_block(ll: &mut [f64], ll_cols: usize, by: usize, bx: usize, block: &[f64]) {
    for r in 0..BLOCK {
        let dst = (by * BLOCK + r) * ll_cols + bx * BLOCK;
        ll[dst..dst + BLOCK].copy_from_slice(&block[r * BLOCK..(r + 1) * BLOCK]);
    }
}
