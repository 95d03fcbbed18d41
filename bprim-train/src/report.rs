//! Scalar reporting and held-out evaluation.

use glam::Vec3;
use image::Rgb32FImage;
use tracing::info;

use crate::backend::{PrimitiveBackend, RenderControls};
use crate::error::TrainError;
use crate::loss;
use crate::population::PrimitiveSet;
use crate::viewpoint::Viewpoint;

/// Training-set indices evaluated alongside the test set.
const TRAIN_EVAL_INDICES: [usize; 5] = [5, 10, 15, 20, 25];

/// Receives tagged scalars. Must not influence training.
pub trait ReportSink {
    fn scalar(&mut self, tag: &str, value: f32, iteration: u32);
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullReport;

impl ReportSink for NullReport {
    fn scalar(&mut self, _tag: &str, _value: f32, _iteration: u32) {}
}

/// Sink that keeps every scalar, for inspection.
#[derive(Debug, Clone, Default)]
pub struct MemoryReport {
    pub scalars: Vec<(String, f32, u32)>,
}

impl ReportSink for MemoryReport {
    fn scalar(&mut self, tag: &str, value: f32, iteration: u32) {
        self.scalars.push((tag.to_string(), value, iteration));
    }
}

/// Averaged metrics over one evaluation set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalMetrics {
    pub l2: f32,
    pub psnr: f32,
}

fn clamped(image: &Rgb32FImage) -> Rgb32FImage {
    let mut out = image.clone();
    out.pixels_mut()
        .for_each(|p| p.0.iter_mut().for_each(|c| *c = c.clamp(0.0, 1.0)));
    out
}

/// Mean MSE and PSNR of `backend` renders against ground truth.
pub fn evaluate_views(
    backend: &mut dyn PrimitiveBackend,
    set: &PrimitiveSet,
    views: &[&Viewpoint],
    background: Vec3,
    controls: &RenderControls,
) -> Result<Option<EvalMetrics>, TrainError> {
    if views.is_empty() {
        return Ok(None);
    }
    let mut l2 = 0.0;
    let mut psnr = 0.0;
    for view in views {
        let output = backend.render(set, view, background, controls)?;
        let mse = loss::mse(&clamped(&output.image), &clamped(&view.target))?;
        l2 += mse;
        psnr += loss::psnr(mse);
    }
    let n = views.len() as f32;
    Ok(Some(EvalMetrics {
        l2: l2 / n,
        psnr: psnr / n,
    }))
}

/// Training viewpoints sampled for evaluation.
pub fn train_eval_views(train: &[Viewpoint]) -> Vec<&Viewpoint> {
    if train.is_empty() {
        return Vec::new();
    }
    TRAIN_EVAL_INDICES
        .iter()
        .map(|i| &train[i % train.len()])
        .collect()
}

/// Log training scalars and, at test iterations, evaluate held-out views.
/// Cached device memory is released after an evaluation pass.
#[allow(clippy::too_many_arguments)]
pub fn training_report(
    sink: &mut dyn ReportSink,
    iteration: u32,
    photometric: f32,
    total: f32,
    evaluate: bool,
    backend: &mut dyn PrimitiveBackend,
    set: &PrimitiveSet,
    test: &[Viewpoint],
    train: &[Viewpoint],
    background: Vec3,
    controls: &RenderControls,
) -> Result<(), TrainError> {
    sink.scalar("train_loss_patches/l2_loss", photometric, iteration);
    sink.scalar("train_loss_patches/total_loss", total, iteration);
    if !evaluate {
        return Ok(());
    }

    let test_views: Vec<&Viewpoint> = test.iter().collect();
    for (name, views) in [("test", test_views), ("train", train_eval_views(train))] {
        if let Some(metrics) = evaluate_views(backend, set, &views, background, controls)? {
            info!(
                "[ITER {}] Evaluating {}: L2 {:.6} PSNR {:.3}",
                iteration, name, metrics.l2, metrics.psnr
            );
            sink.scalar(&format!("{name}/loss_viewpoint - l2_loss"), metrics.l2, iteration);
            sink.scalar(&format!("{name}/loss_viewpoint - psnr"), metrics.psnr, iteration);
        }
    }
    sink.scalar("total_points", set.len() as f32, iteration);
    backend.release_cache();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Quat;

    fn view(uid: usize) -> Viewpoint {
        Viewpoint::new(uid, format!("v{uid}"), Quat::IDENTITY, Vec3::ZERO, 1.0, 1.0, Rgb32FImage::new(2, 2))
    }

    #[test]
    fn test_train_eval_indices_wrap() {
        let train: Vec<Viewpoint> = (0..7).map(view).collect();
        let uids: Vec<usize> = train_eval_views(&train).iter().map(|v| v.uid).collect();
        assert_eq!(uids, vec![5, 3, 1, 6, 4]);
        assert!(train_eval_views(&[]).is_empty());
    }

    #[test]
    fn test_memory_report_keeps_order() {
        let mut sink = MemoryReport::default();
        sink.scalar("a", 1.0, 3);
        sink.scalar("b", 2.0, 4);
        assert_eq!(sink.scalars[1], ("b".to_string(), 2.0, 4));
    }
}
