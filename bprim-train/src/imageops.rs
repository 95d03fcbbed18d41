//! Image helpers: edge-alignment maps and 8-bit conversion.

use image::{Luma, Rgb, Rgb32FImage, RgbImage};

use crate::backend::ScalarMap;
use crate::viewpoint::Viewpoint;

/// Boundary overlay values above this count as drawn boundary.
const BOUNDARY_CUTOFF: f32 = 250.0 / 255.0;
/// Edge responses below this are treated as noise.
const EDGE_FLOOR: f32 = 0.2;

/// Rec. 601 luma.
pub fn luminance(image: &Rgb32FImage) -> ScalarMap {
    ScalarMap::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b] = image.get_pixel(x, y).0;
        Luma([0.299 * r + 0.587 * g + 0.114 * b])
    })
}

/// Sobel gradient magnitude with clamped borders.
pub fn sobel_magnitude(gray: &ScalarMap) -> ScalarMap {
    let (w, h) = gray.dimensions();
    let at = |x: i64, y: i64| -> f32 {
        let x = x.clamp(0, w as i64 - 1) as u32;
        let y = y.clamp(0, h as i64 - 1) as u32;
        gray.get_pixel(x, y).0[0]
    };
    ScalarMap::from_fn(w, h, |x, y| {
        let (x, y) = (x as i64, y as i64);
        let gx = (at(x + 1, y - 1) + 2.0 * at(x + 1, y) + at(x + 1, y + 1))
            - (at(x - 1, y - 1) + 2.0 * at(x - 1, y) + at(x - 1, y + 1));
        let gy = (at(x - 1, y + 1) + 2.0 * at(x, y + 1) + at(x + 1, y + 1))
            - (at(x - 1, y - 1) + 2.0 * at(x, y - 1) + at(x + 1, y - 1));
        Luma([(gx * gx + gy * gy).sqrt()])
    })
}

/// 3x3 maximum filter.
pub fn dilate(map: &ScalarMap) -> ScalarMap {
    let (w, h) = map.dimensions();
    ScalarMap::from_fn(w, h, |x, y| {
        let mut best = f32::NEG_INFINITY;
        for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
            for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                best = best.max(map.get_pixel(nx, ny).0[0]);
            }
        }
        Luma([best])
    })
}

/// Ground-truth edges that are not yet covered by a primitive boundary.
///
/// Sobel magnitude of the target, zeroed where the dilated boundary overlay
/// is drawn, below the noise floor, or outside the valid mask.
pub fn edge_alignment(view: &Viewpoint, boundary: Option<&ScalarMap>) -> ScalarMap {
    let mut edges = sobel_magnitude(&luminance(&view.target));
    let covered = boundary
        .filter(|b| b.dimensions() == edges.dimensions())
        .map(dilate);
    for (x, y, pixel) in edges.enumerate_pixels_mut() {
        let v = &mut pixel.0[0];
        if covered.as_ref().is_some_and(|c| c.get_pixel(x, y).0[0] > BOUNDARY_CUTOFF) {
            *v = 0.0;
        }
        if *v < EDGE_FLOOR || !view.is_valid(x, y) {
            *v = 0.0;
        }
        *v = v.max(0.0);
    }
    edges
}

pub fn to_rgb8(image: &Rgb32FImage) -> RgbImage {
    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let p = image.get_pixel(x, y).0;
        Rgb(p.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8))
    })
}

/// Grayscale image of a scalar map normalized to its own range.
pub fn normalized_gray(map: &ScalarMap) -> RgbImage {
    let (lo, hi) = map
        .pixels()
        .map(|p| p.0[0])
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    let span = if hi > lo { hi - lo } else { 1.0 };
    RgbImage::from_fn(map.width(), map.height(), |x, y| {
        let v = map.get_pixel(x, y).0[0];
        let t = if v.is_finite() { ((v - lo) / span).clamp(0.0, 1.0) } else { 0.0 };
        let c = (t * 255.0).round() as u8;
        Rgb([c, c, c])
    })
}
