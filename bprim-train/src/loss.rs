//! Photometric and structural loss terms.

use image::Rgb32FImage;

use crate::error::TrainError;
use crate::mode::Mode;

const SSIM_WINDOW: usize = 11;
const SSIM_SIGMA: f32 = 1.5;
const SSIM_C1: f64 = 0.01 * 0.01;
const SSIM_C2: f64 = 0.03 * 0.03;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Photometric {
    L1,
    L2,
}

/// Composite loss `lerp(photometric, 1 - ssim, lambda_dssim)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossSpec {
    pub photometric: Photometric,
    pub lambda_dssim: f32,
}

impl LossSpec {
    /// Patch path: L2 while shapes are still moving, L1 in `Finalize`.
    pub fn for_mode(mode: Mode, lambda_dssim: f32) -> Self {
        let photometric = match mode {
            Mode::Init | Mode::Refine => Photometric::L2,
            Mode::Finalize => Photometric::L1,
        };
        Self {
            photometric,
            lambda_dssim,
        }
    }

    /// Point-splat baseline: always L1.
    pub fn baseline(lambda_dssim: f32) -> Self {
        Self {
            photometric: Photometric::L1,
            lambda_dssim,
        }
    }
}

/// Loss terms for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossValue {
    pub photometric: f32,
    pub ssim: f32,
    pub total: f32,
}

impl LossValue {
    pub fn is_finite(&self) -> bool {
        self.photometric.is_finite() && self.ssim.is_finite() && self.total.is_finite()
    }
}

fn check_sizes(a: &Rgb32FImage, b: &Rgb32FImage) -> Result<(), TrainError> {
    if a.dimensions() != b.dimensions() {
        return Err(TrainError::ImageSize {
            expected: b.dimensions(),
            found: a.dimensions(),
        });
    }
    Ok(())
}

pub fn evaluate(spec: &LossSpec, rendered: &Rgb32FImage, target: &Rgb32FImage) -> Result<LossValue, TrainError> {
    check_sizes(rendered, target)?;
    let photometric = match spec.photometric {
        Photometric::L1 => l1(rendered, target)?,
        Photometric::L2 => mse(rendered, target)?,
    };
    let ssim = ssim(rendered, target)?;
    let lambda = spec.lambda_dssim;
    let total = photometric * (1.0 - lambda) + (1.0 - ssim) * lambda;
    Ok(LossValue {
        photometric,
        ssim,
        total,
    })
}

pub fn l1(a: &Rgb32FImage, b: &Rgb32FImage) -> Result<f32, TrainError> {
    check_sizes(a, b)?;
    let n = a.as_raw().len().max(1) as f64;
    let sum: f64 = a
        .as_raw()
        .iter()
        .zip(b.as_raw())
        .map(|(x, y)| (x - y).abs() as f64)
        .sum();
    Ok((sum / n) as f32)
}

pub fn mse(a: &Rgb32FImage, b: &Rgb32FImage) -> Result<f32, TrainError> {
    check_sizes(a, b)?;
    let n = a.as_raw().len().max(1) as f64;
    let sum: f64 = a
        .as_raw()
        .iter()
        .zip(b.as_raw())
        .map(|(x, y)| ((x - y) as f64).powi(2))
        .sum();
    Ok((sum / n) as f32)
}

/// Peak signal-to-noise ratio for images in 0..1.
pub fn psnr(mse: f32) -> f32 {
    -10.0 * mse.max(1e-12).log10()
}

fn gaussian_window() -> Vec<f64> {
    let center = (SSIM_WINDOW / 2) as f64;
    let sigma = SSIM_SIGMA as f64;
    let weights: Vec<f64> = (0..SSIM_WINDOW)
        .map(|i| (-((i as f64 - center).powi(2)) / (2.0 * sigma * sigma)).exp())
        .collect();
    let total: f64 = weights.iter().sum();
    weights.into_iter().map(|w| w / total).collect()
}

/// Separable blur with zero padding, output the same size as the input.
fn blur(plane: &[f64], width: usize, height: usize, kernel: &[f64]) -> Vec<f64> {
    let radius = kernel.len() / 2;
    let mut rows = vec![0.0; plane.len()];
    for y in 0..height {
        for x in 0..width {
            let mut acc = 0.0;
            for (k, w) in kernel.iter().enumerate() {
                let sx = x + k;
                if sx >= radius && sx - radius < width {
                    acc += w * plane[y * width + sx - radius];
                }
            }
            rows[y * width + x] = acc;
        }
    }
    let mut out = vec![0.0; plane.len()];
    for y in 0..height {
        for x in 0..width {
            let mut acc = 0.0;
            for (k, w) in kernel.iter().enumerate() {
                let sy = y + k;
                if sy >= radius && sy - radius < height {
                    acc += w * rows[(sy - radius) * width + x];
                }
            }
            out[y * width + x] = acc;
        }
    }
    out
}

/// Mean structural similarity over all pixels and channels (11x11 Gaussian window).
pub fn ssim(a: &Rgb32FImage, b: &Rgb32FImage) -> Result<f32, TrainError> {
    check_sizes(a, b)?;
    let (width, height) = a.dimensions();
    let (width, height) = (width as usize, height as usize);
    if width == 0 || height == 0 {
        return Ok(1.0);
    }
    let kernel = gaussian_window();
    let mut total = 0.0;
    for channel in 0..3 {
        let x: Vec<f64> = a.as_raw().iter().skip(channel).step_by(3).map(|v| *v as f64).collect();
        let y: Vec<f64> = b.as_raw().iter().skip(channel).step_by(3).map(|v| *v as f64).collect();
        let product = |p: &[f64], q: &[f64]| -> Vec<f64> { p.iter().zip(q).map(|(u, v)| u * v).collect() };

        let mu_x = blur(&x, width, height, &kernel);
        let mu_y = blur(&y, width, height, &kernel);
        let xx = blur(&product(&x, &x), width, height, &kernel);
        let yy = blur(&product(&y, &y), width, height, &kernel);
        let xy = blur(&product(&x, &y), width, height, &kernel);

        for i in 0..x.len() {
            let (mx, my) = (mu_x[i], mu_y[i]);
            let sigma_x = xx[i] - mx * mx;
            let sigma_y = yy[i] - my * my;
            let sigma_xy = xy[i] - mx * my;
            total += ((2.0 * mx * my + SSIM_C1) * (2.0 * sigma_xy + SSIM_C2))
                / ((mx * mx + my * my + SSIM_C1) * (sigma_x + sigma_y + SSIM_C2));
        }
    }
    Ok((total / (3 * width * height) as f64) as f32)
}

fn sign(d: f32) -> f32 {
    if d > 0.0 {
        1.0
    } else if d < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Gradient of the weighted photometric term with respect to every rendered
/// component. The structural term is not differentiated here.
pub fn photometric_gradient(
    spec: &LossSpec,
    rendered: &Rgb32FImage,
    target: &Rgb32FImage,
) -> Result<Rgb32FImage, TrainError> {
    check_sizes(rendered, target)?;
    let n = rendered.as_raw().len().max(1) as f32;
    let weight = (1.0 - spec.lambda_dssim) / n;
    let data: Vec<f32> = rendered
        .as_raw()
        .iter()
        .zip(target.as_raw())
        .map(|(r, t)| {
            let d = r - t;
            weight
                * match spec.photometric {
                    Photometric::L1 => sign(d),
                    Photometric::L2 => 2.0 * d,
                }
        })
        .collect();
    let (w, h) = rendered.dimensions();
    Rgb32FImage::from_raw(w, h, data).ok_or(TrainError::ImageSize {
        expected: (w, h),
        found: (w, h),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn flat(value: f32) -> Rgb32FImage {
        Rgb32FImage::from_pixel(16, 16, Rgb([value; 3]))
    }

    fn checker() -> Rgb32FImage {
        Rgb32FImage::from_fn(16, 16, |x, y| Rgb([((x + y) % 2) as f32; 3]))
    }

    #[test]
    fn test_l1_and_mse() {
        let a = flat(0.2);
        let b = flat(0.7);
        assert!((l1(&a, &b).unwrap() - 0.5).abs() < 1e-6);
        assert!((mse(&a, &b).unwrap() - 0.25).abs() < 1e-6);
        assert!((psnr(0.01) - 20.0).abs() < 1e-4);
    }

    #[test]
    fn test_ssim_identity_and_difference() {
        let img = checker();
        assert!((ssim(&img, &img).unwrap() - 1.0).abs() < 1e-5);
        assert!(ssim(&img, &flat(0.5)).unwrap() < 0.5);
    }

    #[test]
    fn test_mode_selects_photometric_term() {
        assert_eq!(LossSpec::for_mode(Mode::Init, 0.2).photometric, Photometric::L2);
        assert_eq!(LossSpec::for_mode(Mode::Refine, 0.2).photometric, Photometric::L2);
        assert_eq!(LossSpec::for_mode(Mode::Finalize, 0.2).photometric, Photometric::L1);

        let a = flat(0.2);
        let b = flat(0.7);
        let l2 = evaluate(&LossSpec::for_mode(Mode::Init, 0.0), &a, &b).unwrap();
        let l1 = evaluate(&LossSpec::for_mode(Mode::Finalize, 0.0), &a, &b).unwrap();
        assert!((l2.total - 0.25).abs() < 1e-6);
        assert!((l1.total - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_lerp_weighting() {
        let img = checker();
        let spec = LossSpec::baseline(1.0);
        let value = evaluate(&spec, &img, &img).unwrap();
        assert!(value.total.abs() < 1e-5);
    }

    #[test]
    fn test_size_mismatch() {
        let small = Rgb32FImage::new(4, 4);
        let err = l1(&small, &flat(0.0)).unwrap_err();
        assert!(matches!(err, TrainError::ImageSize { .. }));
    }

    #[test]
    fn test_photometric_gradient_sign() {
        let spec = LossSpec::baseline(0.0);
        let grad = photometric_gradient(&spec, &flat(0.8), &flat(0.2)).unwrap();
        assert!(grad.as_raw().iter().all(|g| *g > 0.0));
        let grad = photometric_gradient(&spec, &flat(0.2), &flat(0.2)).unwrap();
        assert!(grad.as_raw().iter().all(|g| *g == 0.0));
    }
}
