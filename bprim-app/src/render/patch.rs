//! CPU rasterizer for boundary patches.
//!
//! Each patch is tessellated into `segments_per_edge²` flat triangles and
//! drawn with a depth buffer, so visibility is hard: one primitive per pixel.

use bprim_data::BPrimitive;
use bprim_train::backend::{DebugBuffers, IndexMap, PrimitiveBackend, RenderControls, RenderOutput, ScalarMap};
use bprim_train::loss::{self, LossSpec};
use bprim_train::population::PrimitiveSet;
use bprim_train::{TrainError, Viewpoint};
use glam::{Vec2, Vec3};
use image::{Luma, Rgb, Rgb32FImage};

/// Boundary band width in barycentric units is `exp(boundary_scale) * BOUNDARY_WIDTH`.
const BOUNDARY_WIDTH: f32 = 1000.0;

/// One tessellated triangle ready for rasterization.
struct Facet {
    screen: [Vec2; 3],
    depth: [f32; 3],
    /// Patch-level barycentrics of the facet corners.
    uvw: [Vec3; 3],
    normal: Vec3,
}

#[derive(Debug, Default)]
pub struct SoftwarePatchBackend {
    /// Background of the last render, needed by the opacity gradient.
    background: Option<Vec3>,
}

impl SoftwarePatchBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Barycentric grid of a patch, scaled about its centroid.
fn tessellate(prim: &BPrimitive, segments: u32, scale: f32, view: &Viewpoint) -> Vec<Facet> {
    let n = segments.max(1);
    let centroid = prim.centroid();
    let uvw_at = |a: u32, b: u32| {
        let (u, v) = (a as f32 / n as f32, b as f32 / n as f32);
        Vec3::new(u, v, (1.0 - u - v).max(0.0))
    };
    let world = |uvw: Vec3| centroid + (prim.evaluate(uvw) - centroid) * scale;

    let mut facets = Vec::with_capacity((n * n) as usize);
    let mut push = |corners: [(u32, u32); 3]| {
        let uvw = corners.map(|(a, b)| uvw_at(a, b));
        let points = uvw.map(world);
        let mut screen = [Vec2::ZERO; 3];
        let mut depth = [0.0; 3];
        for k in 0..3 {
            let Some((pixel, z)) = view.project(points[k]) else {
                return;
            };
            screen[k] = pixel;
            depth[k] = z;
        }
        let mut normal = (points[1] - points[0]).cross(points[2] - points[0]).normalize_or_zero();
        if normal.dot(view.position - points[0]) < 0.0 {
            normal = -normal;
        }
        facets.push(Facet {
            screen,
            depth,
            uvw,
            normal,
        });
    };
    for a in 0..n {
        for b in 0..(n - a) {
            push([(a, b), (a + 1, b), (a, b + 1)]);
            if a + b + 1 < n {
                push([(a + 1, b), (a + 1, b + 1), (a, b + 1)]);
            }
        }
    }
    facets
}

/// Screen-space barycentrics of `p`, or `None` outside the triangle.
fn barycentric(tri: &[Vec2; 3], p: Vec2) -> Option<Vec3> {
    let [a, b, c] = *tri;
    let area = (b - a).perp_dot(c - a);
    if area.abs() < 1e-12 {
        return None;
    }
    let w0 = (b - p).perp_dot(c - p) / area;
    let w1 = (c - p).perp_dot(a - p) / area;
    let w2 = 1.0 - w0 - w1;
    (w0 >= 0.0 && w1 >= 0.0 && w2 >= 0.0).then_some(Vec3::new(w0, w1, w2))
}

fn shade(prim: &BPrimitive, background: Vec3) -> Vec3 {
    let color = Vec3::from_array(prim.color).clamp(Vec3::ZERO, Vec3::ONE);
    let alpha = prim.opacity.clamp(0.0, 1.0);
    color * alpha + background * (1.0 - alpha)
}

impl PrimitiveBackend for SoftwarePatchBackend {
    fn render(
        &mut self,
        set: &PrimitiveSet,
        view: &Viewpoint,
        background: Vec3,
        controls: &RenderControls,
    ) -> Result<RenderOutput, TrainError> {
        let (w, h) = (view.width(), view.height());
        let mut image = Rgb32FImage::from_pixel(w, h, Rgb(background.to_array()));
        let mut visibility = IndexMap::new(w, h);
        let mut depth = ScalarMap::from_pixel(w, h, Luma([f32::INFINITY]));
        let mut boundary = ScalarMap::new(w, h);
        let mut uvw_map = Rgb32FImage::new(w, h);
        let mut normals = Rgb32FImage::new(w, h);
        let band = (controls.boundary_scale.exp() * BOUNDARY_WIDTH).min(0.5);

        for (index, prim) in set.params().iter().enumerate() {
            let color = shade(prim, background);
            for facet in tessellate(prim, controls.segments_per_edge, controls.primitive_scale, view) {
                let min = facet.screen.iter().fold(Vec2::splat(f32::INFINITY), |m, p| m.min(*p));
                let max = facet.screen.iter().fold(Vec2::splat(f32::NEG_INFINITY), |m, p| m.max(*p));
                if max.x < 0.0 || max.y < 0.0 || min.x >= w as f32 || min.y >= h as f32 {
                    continue;
                }
                let x0 = min.x.floor().max(0.0) as u32;
                let y0 = min.y.floor().max(0.0) as u32;
                let x1 = (max.x.ceil() as u32).min(w - 1);
                let y1 = (max.y.ceil() as u32).min(h - 1);
                for y in y0..=y1 {
                    for x in x0..=x1 {
                        let center = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
                        let Some(bary) = barycentric(&facet.screen, center) else {
                            continue;
                        };
                        let z = bary.dot(Vec3::from_array(facet.depth));
                        if z >= depth.get_pixel(x, y).0[0] {
                            continue;
                        }
                        let uvw = facet.uvw[0] * bary.x + facet.uvw[1] * bary.y + facet.uvw[2] * bary.z;
                        let edge = uvw.min_element();
                        let b = if band > 0.0 { (1.0 - edge / band).clamp(0.0, 1.0) } else { 0.0 };

                        depth.put_pixel(x, y, Luma([z]));
                        visibility.set(x, y, Some(index as u32));
                        image.put_pixel(x, y, Rgb(color.to_array()));
                        boundary.put_pixel(x, y, Luma([b]));
                        uvw_map.put_pixel(x, y, Rgb(uvw.to_array()));
                        normals.put_pixel(x, y, Rgb(facet.normal.to_array()));
                    }
                }
            }
        }

        for pixel in depth.pixels_mut() {
            if !pixel.0[0].is_finite() {
                pixel.0[0] = 0.0;
            }
        }
        self.background = Some(background);
        Ok(RenderOutput {
            image,
            visibility,
            debug: DebugBuffers {
                depth: Some(depth),
                boundary: Some(boundary),
                uvw: Some(uvw_map),
                surface_normal: Some(normals),
                depth_normal: None,
            },
        })
    }

    /// Color and opacity gradients only; positions are not differentiated.
    fn backward(
        &mut self,
        set: &mut PrimitiveSet,
        output: &RenderOutput,
        view: &Viewpoint,
        loss: &LossSpec,
    ) -> Result<ScalarMap, TrainError> {
        let background = self
            .background
            .ok_or_else(|| TrainError::Render("backward called before render".into()))?;
        let pixel_grad = loss::photometric_gradient(loss, &output.image, &view.target)?;
        let (w, h) = output.image.dimensions();
        let pixels = (w * h) as f32;
        let mut magnitude = ScalarMap::new(w, h);

        let params = set.params().to_vec();
        let grads = set.grads_mut();
        for y in 0..h {
            for x in 0..w {
                let Some(index) = output.visibility.get(x, y) else {
                    continue;
                };
                let (Some(prim), Some(grad)) = (params.get(index as usize), grads.get_mut(index as usize)) else {
                    return Err(TrainError::Render(format!(
                        "pixel owner {index} out of {} primitives",
                        params.len()
                    )));
                };
                let g = Vec3::from_array(pixel_grad.get_pixel(x, y).0);
                let alpha = prim.opacity.clamp(0.0, 1.0);
                let color = Vec3::from_array(prim.color).clamp(Vec3::ZERO, Vec3::ONE);
                for (slot, gc) in grad.color.iter_mut().zip((g * alpha).to_array()) {
                    *slot += gc;
                }
                grad.opacity += g.dot(color - background);
                magnitude.put_pixel(x, y, Luma([g.length() * pixels]));
            }
        }
        Ok(magnitude)
    }

    fn release_cache(&mut self) {
        self.background = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Quat;

    fn view(target: f32) -> Viewpoint {
        Viewpoint::new(
            0,
            "front",
            Quat::IDENTITY,
            Vec3::new(0.0, 0.0, -2.0),
            1.0,
            1.0,
            Rgb32FImage::from_pixel(16, 16, Rgb([target; 3])),
        )
    }

    fn controls() -> RenderControls {
        RenderControls {
            boundary_scale: -9.0,
            primitive_scale: 1.0,
            segments_per_edge: 4,
            active_sh_degree: 0,
            debug: false,
        }
    }

    fn patch() -> PrimitiveSet {
        let prim = BPrimitive::flat(
            [Vec3::new(-0.5, -0.5, 0.0), Vec3::new(0.5, -0.5, 0.0), Vec3::new(0.0, 0.5, 0.0)],
            Vec3::splat(0.5),
            1.0,
        );
        PrimitiveSet::new(vec![prim], 0)
    }

    #[test]
    fn test_render_covers_center_only() {
        let set = patch();
        let mut backend = SoftwarePatchBackend::new();
        let out = backend.render(&set, &view(0.0), Vec3::ZERO, &controls()).unwrap();
        assert_eq!(out.visibility.get(8, 8), Some(0));
        assert_eq!(out.visibility.get(0, 0), None);
        assert_eq!(out.image.get_pixel(8, 8).0, [0.5; 3]);
        assert_eq!(out.image.get_pixel(0, 0).0, [0.0; 3]);
        let normal = out.debug.surface_normal.as_ref().unwrap().get_pixel(8, 8).0;
        assert_eq!(normal[2], -1.0);
        assert!(out.debug.depth_normal.is_none());
    }

    #[test]
    fn test_backward_pushes_color_towards_target() {
        let mut set = patch();
        let mut backend = SoftwarePatchBackend::new();
        let v = view(1.0);
        let out = backend.render(&set, &v, Vec3::ZERO, &controls()).unwrap();
        let map = backend.backward(&mut set, &out, &v, &LossSpec::baseline(0.2)).unwrap();
        let grad = set.grads()[0];
        assert!(grad.color.iter().all(|g| *g < 0.0));
        assert!(grad.opacity < 0.0);
        assert!(map.get_pixel(8, 8).0[0] > 0.0);
        assert_eq!(map.get_pixel(0, 0).0[0], 0.0);
    }

    #[test]
    fn test_backward_requires_render() {
        let mut set = patch();
        let mut backend = SoftwarePatchBackend::new();
        let v = view(1.0);
        let out = backend.render(&set, &v, Vec3::ZERO, &controls()).unwrap();
        backend.release_cache();
        assert!(backend.backward(&mut set, &out, &v, &LossSpec::baseline(0.2)).is_err());
    }
}
