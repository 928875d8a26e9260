//! Rec.601 analogue YUV conversion for the embedding region.
//!
//! Only the U plane is modified by the engine; Y and V ride along unchanged
//! and the write-back recombines all three. Components clamp to [0, 255]
//! and round half to even, matching the decode side bit for bit.

use image::RgbaImage;

/// The three planes of the trimmed working region, row-major f64.
pub struct YuvPlanes {
    pub y: Vec<f64>,
    pub u: Vec<f64>,
    pub v: Vec<f64>,
    pub width: usize,
    pub height: usize,
}

/// Convert the top-left `width x height` region of `frame` to YUV planes.
pub fn split_region(frame: &RgbaImage, width: usize, height: usize) -> YuvPlanes {
    let mut y = vec![0.0; width * height];
    let mut u = vec![0.0; width * height];
    let mut v = vec![0.0; width * height];

    for row in 0..height {
        for col in 0..width {
            let px = frame.get_pixel(col as u32, row as u32);
            let (r, g, b) = (px[0] as f64, px[1] as f64, px[2] as f64);
            let idx = row * width + col;
            y[idx] = 0.299 * r + 0.587 * g + 0.114 * b;
            u[idx] = -0.14713 * r - 0.28886 * g + 0.436 * b + 128.0;
            v[idx] = 0.615 * r - 0.51499 * g - 0.10001 * b + 128.0;
        }
    }

    YuvPlanes {
        y,
        u,
        v,
        width,
        height,
    }
}

/// Write the planes back into the same region of `frame`, leaving pixels
/// outside the region (and the alpha channel) untouched.
pub fn merge_region(frame: &mut RgbaImage, planes: &YuvPlanes) {
    for row in 0..planes.height {
        for col in 0..planes.width {
            let idx = row * planes.width + col;
            let (y, u, v) = (planes.y[idx], planes.u[idx] - 128.0, planes.v[idx] - 128.0);
            let r = y + 1.13983 * v;
            let g = y - 0.39465 * u - 0.58060 * v;
            let b = y + 2.03211 * u;

            let px = frame.get_pixel_mut(col as u32, row as u32);
            px[0] = to_u8(r);
            px[1] = to_u8(g);
            px[2] = to_u8(b);
        }
    }
}

fn to_u8(value: f64) -> u8 {
    value.round_ties_even().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn grey_maps_to_neutral_chroma() {
        let mut frame = RgbaImage::from_pixel(4, 4, Rgba([128, 128, 128, 255]));
        let planes = split_region(&frame, 4, 4);
        assert!((planes.y[0] - 128.0).abs() < 1e-9);
        assert!((planes.u[0] - 128.0).abs() < 1e-6);
        assert!((planes.v[0] - 128.0).abs() < 1e-6);

        merge_region(&mut frame, &planes);
        assert_eq!(frame.get_pixel(0, 0), &Rgba([128, 128, 128, 255]));
    }

    #[test]
    fn round_trip_stays_within_rounding_error() {
        let mut frame = RgbaImage::new(8, 8);
        for (i, px) in frame.pixels_mut().enumerate() {
            *px = Rgba([(i * 13 % 256) as u8, (i * 29 % 256) as u8, (i * 7 % 256) as u8, 255]);
        }
        let original = frame.clone();
        let planes = split_region(&frame, 8, 8);
        merge_region(&mut frame, &planes);
        for (a, b) in original.pixels().zip(frame.pixels()) {
            for ch in 0..3 {
                assert!((a[ch] as i16 - b[ch] as i16).abs() <= 1);
            }
        }
    }

    #[test]
    fn rounding_is_half_to_even() {
        assert_eq!(to_u8(2.5), 2);
        assert_eq!(to_u8(3.5), 4);
        assert_eq!(to_u8(-4.0), 0);
        assert_eq!(to_u8(300.0), 255);
    }

    #[test]
    fn region_outside_is_untouched() {
        let mut frame = RgbaImage::from_pixel(6, 6, Rgba([10, 200, 30, 255]));
        let mut planes = split_region(&frame, 4, 4);
        for u in planes.u.iter_mut() {
            *u += 40.0;
        }
        merge_region(&mut frame, &planes);
        assert_eq!(frame.get_pixel(5, 5), &Rgba([10, 200, 30, 255]));
        assert_ne!(frame.get_pixel(0, 0), &Rgba([10, 200, 30, 255]));
    }
}
