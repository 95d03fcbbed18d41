//! Debug views published to the interactive client.

use image::{Rgb, Rgb32FImage, RgbImage};
use tracing::warn;

use crate::backend::{IndexMap, RenderOutput, ScalarMap};
use crate::control::RenderView;
use crate::imageops;
use crate::population::EditThresholds;
use crate::stats::{Channel, StatAccumulator};
use crate::viewpoint::Viewpoint;

/// Everything a view may be built from.
pub struct ViewSources<'a> {
    pub output: &'a RenderOutput,
    pub viewpoint: &'a Viewpoint,
    /// Patch statistics; absent on the point-splat path.
    pub stats: Option<&'a StatAccumulator>,
    /// Heatmaps saturate at the edit thresholds.
    pub thresholds: &'a EditThresholds,
}

/// Build the selected view. Returns `None` (after logging) when the sources
/// cannot provide it; the caller skips publishing for that frame.
pub fn render_view(view: RenderView, sources: &ViewSources<'_>) -> Option<RgbImage> {
    let output = sources.output;
    let debug = &output.debug;
    let frame = match view {
        RenderView::RawImage => Some(imageops::to_rgb8(&output.image)),
        RenderView::GroundTruth => Some(imageops::to_rgb8(&sources.viewpoint.target)),
        RenderView::DepthMap => debug.depth.as_ref().map(imageops::normalized_gray),
        RenderView::Segmentation => Some(segmentation(&output.visibility)),
        RenderView::BoundaryOverlay => debug
            .boundary
            .as_ref()
            .map(|b| boundary_overlay(&output.image, b)),
        RenderView::UvwMap => debug.uvw.as_ref().map(imageops::to_rgb8),
        RenderView::SurfaceNormal => debug.surface_normal.as_ref().map(normal_rgb),
        RenderView::DepthNormal => debug.depth_normal.as_ref().map(normal_rgb),
        RenderView::GradientHeatmap => heatmap(sources, Channel::Gradient),
        RenderView::EdgeHeatmap => heatmap(sources, Channel::Edge),
        RenderView::VisibilityHeatmap => heatmap(sources, Channel::Visibility),
        RenderView::EdgeMask => Some(imageops::normalized_gray(&imageops::edge_alignment(
            sources.viewpoint,
            debug.boundary.as_ref(),
        ))),
    };
    if frame.is_none() {
        warn!("Render view {} is not supported by this backend", view);
    }
    frame
}

/// Stable pseudo-random color per primitive index.
fn index_color(index: u32) -> Rgb<u8> {
    let mut h = index.wrapping_mul(0x9E37_79B1) ^ 0x5bd1_e995;
    h ^= h >> 15;
    h = h.wrapping_mul(0x2c1b_3c6d);
    let [a, b, c, _] = h.to_le_bytes();
    Rgb([a | 0x40, b | 0x40, c | 0x40])
}

fn segmentation(map: &IndexMap) -> RgbImage {
    let (w, h) = map.dimensions();
    RgbImage::from_fn(w, h, |x, y| match map.get(x, y) {
        Some(index) => index_color(index),
        None => Rgb([0, 0, 0]),
    })
}

fn boundary_overlay(image: &Rgb32FImage, boundary: &ScalarMap) -> RgbImage {
    let mut out = imageops::to_rgb8(image);
    if boundary.dimensions() != out.dimensions() {
        return out;
    }
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let t = boundary.get_pixel(x, y).0[0].clamp(0.0, 1.0);
        let [r, g, b] = pixel.0;
        *pixel = Rgb([
            (r as f32 * (1.0 - t) + 255.0 * t) as u8,
            (g as f32 * (1.0 - t)) as u8,
            (b as f32 * (1.0 - t)) as u8,
        ]);
    }
    out
}

fn normal_rgb(normals: &Rgb32FImage) -> RgbImage {
    RgbImage::from_fn(normals.width(), normals.height(), |x, y| {
        let n = normals.get_pixel(x, y).0;
        Rgb(n.map(|c| ((c * 0.5 + 0.5).clamp(0.0, 1.0) * 255.0).round() as u8))
    })
}

/// Per-pixel channel average of the visible primitive over its edit
/// threshold. White marks a primitive the next edit would act on.
fn heatmap(sources: &ViewSources<'_>, channel: Channel) -> Option<RgbImage> {
    let stats = sources.stats?;
    let values = stats.average(channel);
    let threshold = match channel {
        Channel::Gradient => sources.thresholds.grad,
        Channel::Edge => sources.thresholds.edge,
        Channel::Visibility => sources.thresholds.vis,
    };
    let scale = if threshold > 0.0 { 1.0 / threshold } else { 0.0 };
    let map = &sources.output.visibility;
    let (w, h) = map.dimensions();
    Some(RgbImage::from_fn(w, h, |x, y| {
        let v = map
            .get(x, y)
            .and_then(|i| values.get(i as usize))
            .map_or(0.0, |v| v * scale);
        let c = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        Rgb([c, c, c])
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DebugBuffers;
    use crate::stats::FrameStats;
    use glam::{Quat, Vec3};
    use image::Luma;

    fn thresholds() -> EditThresholds {
        EditThresholds {
            grad: 2.0,
            edge: 0.5,
            vis: 1.0,
            area: 0.0,
            min_child_area: 0.0,
            max_primitives: None,
        }
    }

    fn sources_parts() -> (RenderOutput, Viewpoint) {
        let mut visibility = IndexMap::new(2, 1);
        visibility.set(0, 0, Some(0));
        visibility.set(1, 0, Some(1));
        let output = RenderOutput {
            image: Rgb32FImage::from_pixel(2, 1, Rgb([0.5; 3])),
            visibility,
            debug: DebugBuffers::default(),
        };
        let view = Viewpoint::new(0, "v", Quat::IDENTITY, Vec3::ZERO, 1.0, 1.0, Rgb32FImage::new(2, 1));
        (output, view)
    }

    #[test]
    fn test_unsupported_view_is_none() {
        let (output, viewpoint) = sources_parts();
        let thresholds = thresholds();
        let sources = ViewSources {
            output: &output,
            viewpoint: &viewpoint,
            stats: None,
            thresholds: &thresholds,
        };
        assert!(render_view(RenderView::DepthNormal, &sources).is_none());
        assert!(render_view(RenderView::GradientHeatmap, &sources).is_none());
        assert!(render_view(RenderView::RawImage, &sources).is_some());
        assert!(render_view(RenderView::Segmentation, &sources).is_some());
    }

    #[test]
    fn test_heatmap_saturates_at_threshold() {
        let (output, viewpoint) = sources_parts();
        let mut stats = StatAccumulator::new(2);
        // Averages 0.5 and 3.0 against a gradient threshold of 2.0.
        let gradient = ScalarMap::from_fn(2, 1, |x, _| Luma([if x == 0 { 0.5 } else { 3.0 }]));
        stats
            .accumulate(&FrameStats {
                visibility: &output.visibility,
                gradient: Some(&gradient),
                edge: None,
            })
            .unwrap();
        let thresholds = thresholds();
        let sources = ViewSources {
            output: &output,
            viewpoint: &viewpoint,
            stats: Some(&stats),
            thresholds: &thresholds,
        };
        let frame = render_view(RenderView::GradientHeatmap, &sources).unwrap();
        assert_eq!(frame.get_pixel(1, 0).0, [255, 255, 255]);
        assert_eq!(frame.get_pixel(0, 0).0, [64, 64, 64]);
    }
}
