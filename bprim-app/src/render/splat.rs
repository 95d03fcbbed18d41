//! CPU splat renderer: isotropic screen-space disks composited front to back.

use bprim_data::Splat;
use bprim_train::baseline::{SplatBackend, SplatRenderOutput, SplatSet};
use bprim_train::loss::{self, LossSpec};
use bprim_train::{TrainError, Viewpoint};
use glam::{Vec2, Vec3};
use image::{Rgb, Rgb32FImage};

const MAX_ALPHA: f32 = 0.99;
const MIN_ALPHA: f32 = 1.0 / 255.0;
/// Screen radius in standard deviations.
const RADIUS_SIGMAS: f32 = 3.0;

/// One splat's share of a pixel.
#[derive(Debug, Clone, Copy)]
struct Contribution {
    splat: u32,
    alpha: f32,
    /// Transmittance in front of the splat.
    transmittance: f32,
    falloff: f32,
}

#[derive(Debug, Default)]
struct FrameCache {
    width: u32,
    background: Vec3,
    pixels: Vec<Vec<Contribution>>,
    final_transmittance: Vec<f32>,
}

#[derive(Debug, Default)]
pub struct SoftwareSplatBackend {
    cache: Option<FrameCache>,
}

impl SoftwareSplatBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn splat_color(splat: &Splat) -> Vec3 {
    Vec3::from_array(splat.color).clamp(Vec3::ZERO, Vec3::ONE)
}

impl SplatBackend for SoftwareSplatBackend {
    fn render(&mut self, set: &SplatSet, view: &Viewpoint, background: Vec3) -> Result<SplatRenderOutput, TrainError> {
        let (w, h) = (view.width(), view.height());
        let focal = view.focal().x;
        let mut radii = vec![0.0f32; set.len()];
        let mut visible: Vec<(u32, Vec2, f32, f32)> = Vec::new();
        for (i, splat) in set.params().iter().enumerate() {
            let Some((center, depth)) = view.project(splat.position()) else {
                continue;
            };
            let sigma = (splat.world_scale().max_element() * focal / depth).max(0.3);
            let radius = sigma * RADIUS_SIGMAS;
            if center.x + radius < 0.0 || center.y + radius < 0.0 || center.x - radius >= w as f32 || center.y - radius >= h as f32 {
                continue;
            }
            radii[i] = radius;
            visible.push((i as u32, center, sigma, depth));
        }
        visible.sort_by(|a, b| a.3.total_cmp(&b.3));

        let count = (w * h) as usize;
        let mut color = vec![Vec3::ZERO; count];
        let mut transmittance = vec![1.0f32; count];
        let mut pixels: Vec<Vec<Contribution>> = vec![Vec::new(); count];
        for (index, center, sigma, _) in &visible {
            let splat = &set.params()[*index as usize];
            let opacity = splat.alpha();
            let c = splat_color(splat);
            let radius = sigma * RADIUS_SIGMAS;
            let x0 = (center.x - radius).floor().max(0.0) as u32;
            let y0 = (center.y - radius).floor().max(0.0) as u32;
            let x1 = ((center.x + radius).ceil().max(0.0) as u32).min(w - 1);
            let y1 = ((center.y + radius).ceil().max(0.0) as u32).min(h - 1);
            for y in y0..=y1 {
                for x in x0..=x1 {
                    let p = (y * w + x) as usize;
                    let d = Vec2::new(x as f32 + 0.5, y as f32 + 0.5) - *center;
                    let falloff = (-0.5 * d.length_squared() / (sigma * sigma)).exp();
                    let alpha = (opacity * falloff).min(MAX_ALPHA);
                    if alpha < MIN_ALPHA {
                        continue;
                    }
                    let t = transmittance[p];
                    color[p] += c * (alpha * t);
                    transmittance[p] = t * (1.0 - alpha);
                    pixels[p].push(Contribution {
                        splat: *index,
                        alpha,
                        transmittance: t,
                        falloff,
                    });
                }
            }
        }

        let image = Rgb32FImage::from_fn(w, h, |x, y| {
            let p = (y * w + x) as usize;
            Rgb((color[p] + background * transmittance[p]).to_array())
        });
        self.cache = Some(FrameCache {
            width: w,
            background,
            pixels,
            final_transmittance: transmittance,
        });
        Ok(SplatRenderOutput { image, radii })
    }

    fn backward(
        &mut self,
        set: &mut SplatSet,
        output: &SplatRenderOutput,
        view: &Viewpoint,
        loss: &LossSpec,
    ) -> Result<Vec<f32>, TrainError> {
        let cache = self
            .cache
            .as_ref()
            .ok_or_else(|| TrainError::Render("backward called before render".into()))?;
        let pixel_grad = loss::photometric_gradient(loss, &output.image, &view.target)?;
        let pixel_count = pixel_grad.as_raw().len() as f32 / 3.0;
        let params = set.params().to_vec();
        let grads = set.grads_mut();
        let mut norms = vec![0.0f32; params.len()];

        for (p, contributions) in cache.pixels.iter().enumerate() {
            let (x, y) = (p as u32 % cache.width, p as u32 / cache.width);
            let g = Vec3::from_array(pixel_grad.get_pixel(x, y).0);
            // Color composited behind the current splat, walked back to front.
            let mut behind = cache.background * cache.final_transmittance[p];
            for c in contributions.iter().rev() {
                let i = c.splat as usize;
                let (Some(splat), Some(grad)) = (params.get(i), grads.get_mut(i)) else {
                    return Err(TrainError::Render(format!("splat {i} out of {}", params.len())));
                };
                let color = splat_color(splat);
                let weight = c.alpha * c.transmittance;
                for (slot, gc) in grad.color.iter_mut().zip((g * weight).to_array()) {
                    *slot += gc;
                }
                let d_alpha = g.dot(color * c.transmittance - behind / (1.0 - c.alpha));
                let a = splat.alpha();
                grad.opacity += d_alpha * c.falloff * a * (1.0 - a);
                norms[i] += g.length() * weight * pixel_count;
                behind += color * weight;
            }
        }
        Ok(norms)
    }

    fn release_cache(&mut self) {
        self.cache = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bprim_data::Point;
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

    fn one_splat() -> SplatSet {
        let point = Point::new(Vec3::ZERO, Vec3::splat(0.5));
        SplatSet::new(vec![Splat::from_point(&point, 0.2, 0.9)], 0)
    }

    #[test]
    fn test_render_composites_over_background() {
        let set = one_splat();
        let mut backend = SoftwareSplatBackend::new();
        let out = backend.render(&set, &view(0.0), Vec3::ONE).unwrap();
        assert!(out.radii[0] > 1.0);
        let center = out.image.get_pixel(8, 8).0[0];
        assert!(center < 1.0 && center > 0.5);
        assert_eq!(out.image.get_pixel(0, 0).0, [1.0; 3]);
    }

    #[test]
    fn test_offscreen_splat_has_zero_radius() {
        let point = Point::new(Vec3::new(0.0, 0.0, -5.0), Vec3::ONE);
        let set = SplatSet::new(vec![Splat::from_point(&point, 0.2, 0.9)], 0);
        let mut backend = SoftwareSplatBackend::new();
        let out = backend.render(&set, &view(0.0), Vec3::ZERO).unwrap();
        assert_eq!(out.radii, vec![0.0]);
    }

    #[test]
    fn test_backward_gradients() {
        let mut set = one_splat();
        let mut backend = SoftwareSplatBackend::new();
        let v = view(1.0);
        let out = backend.render(&set, &v, Vec3::ZERO).unwrap();
        let norms = backend.backward(&mut set, &out, &v, &LossSpec::baseline(0.0)).unwrap();
        assert!(norms[0] > 0.0);
        let grad = set.grads_mut()[0];
        assert!(grad.color.iter().all(|g| *g < 0.0));
        // Brighter target over a black background wants more opacity.
        assert!(grad.opacity < 0.0);
    }
}
