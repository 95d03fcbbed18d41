//! Point-splat baseline path.
//!
//! An independent training variant over isotropic-initialized 3D Gaussian
//! splats with clone/split densification, pruning and periodic opacity
//! resets. It shares the loss, the optimizer and the edit plans with the
//! patch path but keeps its own population and statistics.

use bprim_data::{ParamGroup, Parameters, Point, Splat, inverse_sigmoid, sigmoid};
use bytemuck::Zeroable;
use glam::{Quat, Vec3};
use image::Rgb32FImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::config::{BaselineConfig, OptimizationConfig};
use crate::error::TrainError;
use crate::loss::{self, LossSpec, LossValue};
use crate::mode::Mode;
use crate::optim::{Adam, AdamConfig};
use crate::population::{EditPlan, SlotOrigin};
use crate::schedule::LearningRateScheduler;
use crate::viewpoint::Viewpoint;

/// Opacity after a reset.
const RESET_OPACITY: f32 = 0.01;
/// Children per split splat.
const SPLIT_CHILDREN: usize = 2;
/// Neighbours used for the initial scale.
const INIT_NEIGHBOURS: usize = 3;

/// Result of rendering splats for one viewpoint.
#[derive(Debug, Clone)]
pub struct SplatRenderOutput {
    pub image: Rgb32FImage,
    /// Screen-space radius per splat; 0 when not visible.
    pub radii: Vec<f32>,
}

/// Renderer plus gradient engine for splats.
pub trait SplatBackend {
    fn render(
        &mut self,
        set: &SplatSet,
        view: &Viewpoint,
        background: Vec3,
    ) -> Result<SplatRenderOutput, TrainError>;

    /// Add parameter gradients into `set`; returns the view-space positional
    /// gradient norm per splat.
    fn backward(
        &mut self,
        set: &mut SplatSet,
        output: &SplatRenderOutput,
        view: &Viewpoint,
        loss: &LossSpec,
    ) -> Result<Vec<f32>, TrainError>;

    fn release_cache(&mut self) {}
}

/// Splat parameters, gradients and densification statistics.
#[derive(Debug, Clone)]
pub struct SplatSet {
    params: Vec<Splat>,
    grads: Vec<Splat>,
    grad_accum: Vec<f32>,
    denom: Vec<f32>,
    max_radii2d: Vec<f32>,
    active_sh_degree: u32,
    max_sh_degree: u32,
}

impl SplatSet {
    pub fn new(params: Vec<Splat>, max_sh_degree: u32) -> Self {
        let len = params.len();
        Self {
            params,
            grads: vec![Splat::zeroed(); len],
            grad_accum: vec![0.0; len],
            denom: vec![0.0; len],
            max_radii2d: vec![0.0; len],
            active_sh_degree: 0,
            max_sh_degree: max_sh_degree.min(bprim_data::MAX_SH_DEGREE),
        }
    }

    /// One splat per point, scaled by the mean distance to its nearest neighbours.
    pub fn from_points(points: &[Point], opacity: f32, max_sh_degree: u32) -> Self {
        let positions: Vec<Vec3> = points.iter().map(|p| p.position).collect();
        let distances = mean_neighbour_distance(&positions, INIT_NEIGHBOURS);
        let params = points
            .iter()
            .zip(distances)
            .map(|(p, d)| Splat::from_point(p, d, opacity))
            .collect();
        Self::new(params, max_sh_degree)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn params(&self) -> &[Splat] {
        &self.params
    }

    pub fn grads_mut(&mut self) -> &mut [Splat] {
        &mut self.grads
    }

    pub fn grads_finite(&self) -> bool {
        self.grads.iter().all(|g| g.is_finite())
    }

    pub fn active_sh_degree(&self) -> u32 {
        self.active_sh_degree
    }

    pub fn one_up_sh_degree(&mut self) {
        if self.active_sh_degree < self.max_sh_degree {
            self.active_sh_degree += 1;
        }
    }

    pub fn max_radii2d(&self) -> &[f32] {
        &self.max_radii2d
    }

    fn zero_grad(&mut self) {
        self.grads.fill(Splat::zeroed());
    }

    /// Track screen radii and view-space gradient norms of visible splats.
    pub fn add_densification_stats(&mut self, radii: &[f32], grad_norms: &[f32]) -> Result<(), TrainError> {
        if radii.len() != self.len() || grad_norms.len() != self.len() {
            return Err(TrainError::InvariantViolation(format!(
                "{} radii and {} gradient norms for {} splats",
                radii.len(),
                grad_norms.len(),
                self.len()
            )));
        }
        for i in 0..self.len() {
            if radii[i] > 0.0 {
                self.max_radii2d[i] = self.max_radii2d[i].max(radii[i]);
                self.grad_accum[i] += grad_norms[i];
                self.denom[i] += 1.0;
            }
        }
        Ok(())
    }

    fn averaged_grads(&self) -> Vec<f32> {
        self.grad_accum
            .iter()
            .zip(&self.denom)
            .map(|(g, d)| if *d > 0.0 { g / d } else { 0.0 })
            .collect()
    }

    fn apply_edit(&mut self, plan: &EditPlan, params: Vec<Splat>) {
        let len = params.len();
        debug_assert_eq!(plan.len(), len);
        self.params = params;
        self.grads = vec![Splat::zeroed(); len];
        self.grad_accum = vec![0.0; len];
        self.denom = vec![0.0; len];
        self.max_radii2d = vec![0.0; len];
    }
}

/// Mean distance to the `k` nearest neighbours of every point.
///
/// Points are bucketed on a uniform grid sized for about two points per cell
/// along the cloud's dominant dimensions; points without enough neighbours in
/// the surrounding cells fall back to a full scan.
fn mean_neighbour_distance(positions: &[Vec3], k: usize) -> Vec<f32> {
    const FALLBACK: f32 = 0.01;
    if positions.len() < 2 {
        return vec![FALLBACK; positions.len()];
    }
    let (min, max) = positions
        .iter()
        .fold((Vec3::splat(f32::MAX), Vec3::splat(f32::MIN)), |(lo, hi), p| (lo.min(*p), hi.max(*p)));
    let mut sides = (max - min).to_array();
    sides.sort_by(|a, b| b.total_cmp(a));
    let per_point = 2.0 / positions.len() as f32;
    let cell = [
        (sides[0] * sides[1] * sides[2] * per_point).cbrt(),
        (sides[0] * sides[1] * per_point).sqrt(),
        sides[0] * per_point,
    ]
    .into_iter()
    .fold(1e-6f32, f32::max);

    let key = |p: Vec3| {
        let c = ((p - min) / cell).floor();
        (c.x as i32, c.y as i32, c.z as i32)
    };
    let mut grid: HashMap<(i32, i32, i32), Vec<usize>> = HashMap::new();
    for (i, p) in positions.iter().enumerate() {
        grid.entry(key(*p)).or_default().push(i);
    }

    positions
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let (cx, cy, cz) = key(*p);
            let mut nearest: Vec<f32> = Vec::new();
            for dx in -1..=1 {
                for dy in -1..=1 {
                    for dz in -1..=1 {
                        if let Some(bucket) = grid.get(&(cx + dx, cy + dy, cz + dz)) {
                            nearest.extend(
                                bucket
                                    .iter()
                                    .filter(|j| **j != i)
                                    .map(|j| positions[*j].distance(*p)),
                            );
                        }
                    }
                }
            }
            if nearest.len() < k {
                nearest = positions
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, q)| q.distance(*p))
                    .collect();
            }
            nearest.sort_by(f32::total_cmp);
            let taken = &nearest[..nearest.len().min(k)];
            (taken.iter().sum::<f32>() / taken.len() as f32).max(1e-7)
        })
        .collect()
}

/// Counts of one baseline densification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DensifySummary {
    pub cloned: usize,
    pub split: usize,
    pub pruned: usize,
    pub before: usize,
    pub after: usize,
}

/// Outcome of one baseline iteration.
#[derive(Debug, Clone)]
pub struct BaselineStep {
    pub loss: LossValue,
    pub output: SplatRenderOutput,
    pub densified: Option<DensifySummary>,
    pub opacity_reset: bool,
}

/// Drives the point-splat path one iteration at a time.
pub struct BaselineTrainer {
    set: SplatSet,
    optimizer: Adam<Splat>,
    scheduler: LearningRateScheduler,
    config: BaselineConfig,
    lambda_dssim: f32,
    sh_increase_interval: u32,
    extent: f32,
    rng: StdRng,
}

impl BaselineTrainer {
    pub fn new(
        set: SplatSet,
        optimization: &OptimizationConfig,
        config: BaselineConfig,
        sh_increase_interval: u32,
        extent: f32,
        seed: Option<u64>,
    ) -> Self {
        let groups: Vec<ParamGroup> = Splat::GROUPS.iter().map(|(g, _)| *g).collect();
        let mut scheduler = LearningRateScheduler::from_config(optimization, &groups, 0);
        scheduler.set_schedule(ParamGroup::Position, optimization.position_lr.scaled(extent));
        let mut optimizer = Adam::new(AdamConfig::from(optimization), set.len());
        for (group, rate) in scheduler.rates(0) {
            optimizer.set_learning_rate(group, rate);
        }
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            set,
            optimizer,
            scheduler,
            config,
            lambda_dssim: optimization.lambda_dssim,
            sh_increase_interval: sh_increase_interval.max(1),
            extent,
            rng,
        }
    }

    pub fn set(&self) -> &SplatSet {
        &self.set
    }

    pub fn optimizer(&self) -> &Adam<Splat> {
        &self.optimizer
    }

    /// Render without touching gradients, for the interactive client.
    pub fn render(
        &self,
        backend: &mut dyn SplatBackend,
        view: &Viewpoint,
        background: Vec3,
    ) -> Result<SplatRenderOutput, TrainError> {
        backend.render(&self.set, view, background)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn step(
        &mut self,
        iteration: u32,
        max_iterations: u32,
        view: &Viewpoint,
        background: Vec3,
        backend: &mut dyn SplatBackend,
        detect_anomaly: bool,
    ) -> Result<BaselineStep, TrainError> {
        for (group, rate) in self.scheduler.rates(iteration) {
            self.optimizer.set_learning_rate(group, rate);
        }
        if iteration % self.sh_increase_interval == 0 {
            self.set.one_up_sh_degree();
        }

        let spec = LossSpec::baseline(self.lambda_dssim);
        let output = backend.render(&self.set, view, background)?;
        let loss = loss::evaluate(&spec, &output.image, &view.target)?;
        let grad_norms = backend.backward(&mut self.set, &output, view, &spec)?;
        if detect_anomaly && (!loss.is_finite() || !self.set.grads_finite()) {
            return Err(TrainError::NumericalDivergence {
                what: "baseline loss or gradient",
                iteration,
                mode: Mode::Init,
                primitives: self.set.len(),
            });
        }

        let c = self.config.clone();
        let densify_window = c.densify_until_iter.is_none_or(|until| iteration < until);
        let mut densified = None;
        let mut opacity_reset = false;
        if densify_window {
            self.set.add_densification_stats(&output.radii, &grad_norms)?;
            if iteration > c.densify_from_iter && iteration % c.densify_every.max(1) == 0 {
                let size_threshold =
                    (iteration > c.opacity_reset_interval).then_some(c.max_screen_size);
                densified = Some(self.densify_and_prune(iteration, size_threshold)?);
            }
            if c.opacity_reset_interval > 0 && iteration % c.opacity_reset_interval == 0 {
                self.reset_opacity();
                opacity_reset = true;
            }
        }

        if densified.is_none() && iteration < max_iterations {
            let (params, grads) = (&mut self.set.params, &self.set.grads);
            self.optimizer.step(params, grads)?;
        }
        self.set.zero_grad();

        Ok(BaselineStep {
            loss,
            output,
            densified,
            opacity_reset,
        })
    }

    /// Clone small high-gradient splats, split large ones, then prune.
    pub fn densify_and_prune(&mut self, iteration: u32, max_screen_size: Option<f32>) -> Result<DensifySummary, TrainError> {
        let grads = self.set.averaged_grads();
        let threshold = self.config.densify_grad_threshold;
        let dense_scale = self.config.percent_dense * self.extent;
        let before = self.set.len();
        let mut summary = DensifySummary {
            before,
            ..DensifySummary::default()
        };

        // Candidates in order: (origin, splat, screen radius).
        let mut candidates: Vec<(SlotOrigin, Splat, f32)> = Vec::with_capacity(before);
        for (i, splat) in self.set.params.iter().enumerate() {
            let radius = self.set.max_radii2d[i];
            let selected = grads[i] >= threshold;
            let large = splat.world_scale().max_element() > dense_scale;
            if selected && large {
                summary.split += 1;
                for _ in 0..SPLIT_CHILDREN {
                    let child = split_child(&mut self.rng, splat);
                    candidates.push((SlotOrigin::Inserted { parent: i }, child, 0.0));
                }
            } else {
                candidates.push((SlotOrigin::Retained(i), *splat, radius));
                if selected {
                    summary.cloned += 1;
                    candidates.push((SlotOrigin::Inserted { parent: i }, *splat, 0.0));
                }
            }
        }

        let world_limit = 0.1 * self.extent;
        let min_opacity = self.config.min_opacity;
        let (kept, pruned): (Vec<_>, Vec<_>) = candidates.into_iter().partition(|(_, splat, radius)| {
            let mut prune = splat.alpha() < min_opacity;
            if let Some(limit) = max_screen_size {
                prune |= *radius > limit || splat.world_scale().max_element() > world_limit;
            }
            !prune
        });
        summary.pruned = pruned.len();
        if kept.is_empty() {
            return Err(TrainError::EmptyPopulation { iteration });
        }

        let (slots, params): (Vec<SlotOrigin>, Vec<Splat>) = kept.into_iter().map(|(o, s, _)| (o, s)).unzip();
        let plan = EditPlan::new(before, slots);
        plan.validate()?;
        self.optimizer.remap(&plan)?;
        self.set.apply_edit(&plan, params);
        summary.after = self.set.len();
        info!(
            "Baseline densify at iteration {}: {} -> {} splats ({} cloned, {} split, {} pruned)",
            iteration, summary.before, summary.after, summary.cloned, summary.split, summary.pruned
        );
        Ok(summary)
    }

    /// Clamp every opacity to at most the reset value and clear its moments.
    pub fn reset_opacity(&mut self) {
        for splat in &mut self.set.params {
            splat.opacity = inverse_sigmoid(sigmoid(splat.opacity).min(RESET_OPACITY));
        }
        self.optimizer.reset_group(ParamGroup::Opacity);
        debug!("Reset opacity of {} splats", self.set.len());
    }
}

/// Child of a split: position sampled inside the parent, scale shrunk.
fn split_child(rng: &mut StdRng, parent: &Splat) -> Splat {
    let scale = parent.world_scale();
    let offset = Vec3::new(
        rng.gen_range(-1.0..=1.0),
        rng.gen_range(-1.0..=1.0),
        rng.gen_range(-1.0..=1.0),
    ) * scale;
    let rotation = Quat::from_array(parent.rotation).normalize();
    let mut child = *parent;
    child.position = (parent.position() + rotation * offset).to_array();
    let shrink = (0.8 * SPLIT_CHILDREN as f32).ln();
    child.scale = parent.scale.map(|s| s - shrink);
    child
}
