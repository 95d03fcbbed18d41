//! The per-iteration training driver.
//!
//! One iteration of the patch path, in order:
//!
//! 1. poll the interactive session
//! 2. past `fix_iters`, force structural edits off
//! 3. run the mode state machine and push learning rates
//! 4. raise the active SH degree on its interval
//! 5. if training is enabled: render, loss, backward, EMA, report, accumulate
//!    statistics, edit the population on schedule, otherwise step the optimizer
//! 6. checkpoint at configured iterations
//! 7. render and publish a frame for the interactive client

use bprim_data::{BPrimitive, Checkpoint, ParamGroup, Parameters};
use glam::Vec3;
use image::RgbImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info, warn};

use crate::backend::{PrimitiveBackend, RenderControls};
use crate::baseline::{BaselineTrainer, SplatBackend};
use crate::config::{GroupSchedule, RESTORE_FINALIZE_AFTER, TrainingConfig};
use crate::control::{ControlState, RenderView};
use crate::error::TrainError;
use crate::imageops;
use crate::loss::{self, LossSpec};
use crate::mode::{Mode, ModeStateMachine, Transition};
use crate::optim::{Adam, AdamConfig};
use crate::output::{CheckpointSink, MemorySink};
use crate::population::{EditThresholds, PopulationEditor, PrimitiveSet};
use crate::report::{self, NullReport, ReportSink};
use crate::schedule::{self, LearningRateScheduler};
use crate::session::{InteractiveSession, NoSession};
use crate::stats::FrameStats;
use crate::viewpoint::{Scene, Viewpoint, ViewpointSampler};
use crate::visualize::{self, ViewSources};

/// Weight of the newest loss in the moving average.
const EMA_WEIGHT: f64 = 0.4;
const PROGRESS_INTERVAL: u32 = 10;

/// Loop counters. Owned by the orchestrator, never shared.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrainingState {
    /// Last completed iteration; 0 before the first one.
    pub iteration: u32,
    /// Iteration the run resumed from.
    pub first_iter: u32,
    pub mode: Mode,
    pub ema_loss: f64,
}

impl TrainingState {
    /// `ema = 0.4 * loss + 0.6 * ema`.
    pub fn update_ema(&mut self, loss: f32) -> f64 {
        self.ema_loss = EMA_WEIGHT * loss as f64 + (1.0 - EMA_WEIGHT) * self.ema_loss;
        self.ema_loss
    }
}

/// Per-run switches that are not part of the saved configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOptions {
    pub test_iterations: Vec<u32>,
    pub checkpoint_iterations: Vec<u32>,
    /// Renderer debug output from the iteration after this one.
    pub debug_from: Option<u32>,
    pub detect_anomaly: bool,
    pub seed: Option<u64>,
}

/// What a finished run did.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunSummary {
    pub final_iteration: u32,
    pub ema_loss: f64,
    pub primitives: usize,
    pub transitions: Vec<Transition>,
    pub edits: usize,
    pub checkpoints: Vec<u32>,
}

pub struct TrainingOrchestrator {
    config: TrainingConfig,
    options: RunOptions,
    scene: Scene,
    set: PrimitiveSet,
    optimizer: Adam<BPrimitive>,
    scheduler: LearningRateScheduler,
    editor: PopulationEditor,
    machine: ModeStateMachine,
    control: ControlState,
    state: TrainingState,
    sampler: ViewpointSampler,
    rng: StdRng,
    /// Position learning-rate multiplier applied since entering `Refine`.
    position_boost: f32,
    backend: Box<dyn PrimitiveBackend>,
    baseline: Option<(BaselineTrainer, Box<dyn SplatBackend>)>,
    session: Box<dyn InteractiveSession>,
    reporter: Box<dyn ReportSink>,
    sink: Box<dyn CheckpointSink>,
    summary: RunSummary,
}

impl TrainingOrchestrator {
    pub fn new(
        config: TrainingConfig,
        mut options: RunOptions,
        scene: Scene,
        primitives: Vec<BPrimitive>,
        backend: Box<dyn PrimitiveBackend>,
    ) -> Result<Self, TrainError> {
        config.validate()?;
        if scene.train.is_empty() {
            return Err(TrainError::NoViewpoints);
        }
        if primitives.is_empty() {
            return Err(TrainError::EmptyPopulation { iteration: 0 });
        }
        let max = config.optimization.iterations;
        if !options.checkpoint_iterations.contains(&max) {
            options.checkpoint_iterations.push(max);
        }

        let set = PrimitiveSet::new(primitives, config.model.sh_degree);
        let optimizer = Adam::new(AdamConfig::from(&config.optimization), set.len());
        let scheduler = LearningRateScheduler::new(Vec::new(), 0);
        let editor = PopulationEditor::new(EditThresholds::from(&config.schedule));
        let sampler = ViewpointSampler::new(scene.train.len(), options.seed);
        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
            None => StdRng::from_entropy(),
        };

        let mut orchestrator = Self {
            config,
            options,
            scene,
            set,
            optimizer,
            scheduler,
            editor,
            machine: ModeStateMachine::new(),
            control: ControlState::default(),
            state: TrainingState::default(),
            sampler,
            rng,
            position_boost: 1.0,
            backend,
            baseline: None,
            session: Box::new(NoSession),
            reporter: Box::new(NullReport),
            sink: Box::new(MemorySink::default()),
            summary: RunSummary::default(),
        };
        orchestrator.rebuild_scheduler();
        info!(
            "Training {} primitives on {} viewpoints for {} iterations",
            orchestrator.set.len(),
            orchestrator.scene.train.len(),
            max
        );
        Ok(orchestrator)
    }

    pub fn with_session(mut self, session: Box<dyn InteractiveSession>) -> Self {
        self.session = session;
        self
    }

    pub fn with_reporter(mut self, reporter: Box<dyn ReportSink>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_checkpoint_sink(mut self, sink: Box<dyn CheckpointSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_baseline(mut self, trainer: BaselineTrainer, backend: Box<dyn SplatBackend>) -> Self {
        self.baseline = Some((trainer, backend));
        self
    }

    pub fn with_control(mut self, control: ControlState) -> Self {
        self.control = control;
        self
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn control(&self) -> &ControlState {
        &self.control
    }

    pub fn control_mut(&mut self) -> &mut ControlState {
        &mut self.control
    }

    pub fn mode(&self) -> Mode {
        self.machine.current()
    }

    pub fn population(&self) -> &PrimitiveSet {
        &self.set
    }

    pub fn optimizer(&self) -> &Adam<BPrimitive> {
        &self.optimizer
    }

    pub fn scheduler(&self) -> &LearningRateScheduler {
        &self.scheduler
    }

    pub fn checkpoint_iterations(&self) -> &[u32] {
        &self.options.checkpoint_iterations
    }

    /// Resume from `checkpoint` in the mode it was saved in. Late checkpoints
    /// go straight to `Finalize` without replaying the earlier transitions.
    /// Restored moments and SH degree are kept.
    pub fn restore(&mut self, checkpoint: Checkpoint) -> Result<(), TrainError> {
        checkpoint.validate()?;
        if checkpoint.primitives.is_empty() {
            return Err(TrainError::EmptyPopulation {
                iteration: checkpoint.iteration,
            });
        }
        let saved_mode = Mode::from_index(checkpoint.mode).ok_or_else(|| {
            TrainError::InvariantViolation(format!("checkpoint has unknown mode index {}", checkpoint.mode))
        })?;
        let len = checkpoint.primitives.len();
        let mut set = PrimitiveSet::new(checkpoint.primitives, self.config.model.sh_degree);
        set.set_active_sh_degree(checkpoint.active_sh_degree);
        self.optimizer = Adam::from_snapshot(AdamConfig::from(&self.config.optimization), checkpoint.optimizer, len)?;
        self.set = set;
        self.state.iteration = checkpoint.iteration;
        self.state.first_iter = checkpoint.iteration;

        let mut target = saved_mode;
        if checkpoint.iteration > RESTORE_FINALIZE_AFTER {
            target = target.max(Mode::Finalize);
        }
        let schedule = self.config.schedule.clone();
        if let Some(t) = self
            .machine
            .force(target, checkpoint.iteration, &schedule, &mut self.control)
        {
            self.summary.transitions.push(t);
        }
        self.state.mode = self.machine.current();
        if self.state.mode >= Mode::Refine {
            self.position_boost = schedule.refine_position_lr_multiplier;
        }
        self.rebuild_scheduler();
        info!(
            "Restored {} primitives at iteration {} in mode {}",
            len, checkpoint.iteration, self.state.mode
        );
        Ok(())
    }

    /// Run until the configured iteration budget is exhausted.
    pub fn run(&mut self) -> Result<RunSummary, TrainError> {
        let max = self.config.optimization.iterations;
        let first = self.state.iteration + 1;
        for iteration in first..=max {
            self.iterate(iteration)?;
        }
        self.summary.final_iteration = self.state.iteration;
        self.summary.ema_loss = self.state.ema_loss;
        self.summary.primitives = self.set.len();
        info!(
            "Training complete at iteration {} with {} primitives (ema loss {:.7})",
            self.summary.final_iteration, self.summary.primitives, self.summary.ema_loss
        );
        Ok(self.summary.clone())
    }

    /// Advance exactly one iteration.
    pub fn iterate(&mut self, iteration: u32) -> Result<(), TrainError> {
        if iteration != self.state.iteration + 1 {
            return Err(TrainError::InvariantViolation(format!(
                "iteration {} follows {}",
                iteration, self.state.iteration
            )));
        }
        self.state.iteration = iteration;
        self.session.poll(&mut self.control);

        if self.control.point_mode && self.baseline.is_some() {
            self.iterate_baseline(iteration)?;
        } else {
            self.iterate_patches(iteration)?;
        }

        if self.options.checkpoint_iterations.contains(&iteration) {
            self.save_checkpoint(iteration);
        }
        self.publish_interactive(iteration);
        Ok(())
    }

    fn iterate_patches(&mut self, iteration: u32) -> Result<(), TrainError> {
        let schedule = self.config.schedule.clone();
        let max = self.config.optimization.iterations;

        if iteration > schedule.fix_iters {
            self.control.structural_edit_enabled = false;
        }
        if let Some(transition) = self.machine.step(iteration, &schedule, &mut self.control) {
            self.on_transition(transition);
        }
        let mode = self.machine.current();
        self.state.mode = mode;
        if schedule::pushes_rates(mode, iteration, &schedule) {
            for (group, rate) in self.scheduler.rates(iteration) {
                self.optimizer.set_learning_rate(group, rate);
            }
        }
        if iteration % schedule.sh_increase_interval == 0 && self.set.one_up_sh_degree() {
            debug!("Active SH degree raised to {}", self.set.active_sh_degree());
        }

        if !self.control.training_enabled {
            return Ok(());
        }

        let index = self.sampler.next_index().ok_or(TrainError::NoViewpoints)?;
        let background = self.background();
        let controls = self.render_controls(iteration);
        let view = &self.scene.train[index];

        let output = self.backend.render(&self.set, view, background, &controls)?;
        let spec = LossSpec::for_mode(mode, self.config.optimization.lambda_dssim);
        let value = loss::evaluate(&spec, &output.image, &view.target)?;
        let grad_map = self.backend.backward(&mut self.set, &output, view, &spec)?;
        if self.options.detect_anomaly {
            let what = if !value.is_finite() {
                Some("loss")
            } else if !self.set.grads_finite() {
                Some("gradient")
            } else {
                None
            };
            if let Some(what) = what {
                return Err(TrainError::NumericalDivergence {
                    what,
                    iteration,
                    mode,
                    primitives: self.set.len(),
                });
            }
        }

        let ema = self.state.update_ema(value.total);
        if iteration % PROGRESS_INTERVAL == 0 {
            info!(
                "Iteration {}: loss {:.7} ({} primitives, mode {})",
                iteration,
                ema,
                self.set.len(),
                mode
            );
        }

        report::training_report(
            self.reporter.as_mut(),
            iteration,
            value.photometric,
            value.total,
            self.options.test_iterations.contains(&iteration),
            self.backend.as_mut(),
            &self.set,
            &self.scene.test,
            &self.scene.train,
            background,
            &controls,
        )?;

        let edge = mode
            .supports_boundaries()
            .then(|| imageops::edge_alignment(view, output.debug.boundary.as_ref()));
        self.set.check_consistency()?;
        self.set.stats_mut().accumulate(&FrameStats {
            visibility: &output.visibility,
            gradient: Some(&grad_map),
            edge: edge.as_ref(),
        })?;

        let mut edited = false;
        if PopulationEditor::is_due(iteration, &schedule, &self.control) {
            if let Some((plan, _)) = self.editor.densify_and_prune(&mut self.set, mode, iteration)? {
                self.optimizer.remap(&plan)?;
                self.rebuild_scheduler();
                self.summary.edits += 1;
                self.session.set_primitive_count(self.set.len());
                edited = true;
            }
        }

        if !edited && self.control.optimizer_step_enabled && iteration < max {
            let (params, grads) = self.set.params_and_grads();
            self.optimizer.step(params, grads)?;
        }
        self.set.zero_grad();
        Ok(())
    }

    fn iterate_baseline(&mut self, iteration: u32) -> Result<(), TrainError> {
        let max = self.config.optimization.iterations;
        let save_at = self.config.baseline.save_pointcloud_iter;
        if !self.control.training_enabled {
            return Ok(());
        }
        let index = self.sampler.next_index().ok_or(TrainError::NoViewpoints)?;
        let background = self.background();
        let Some((trainer, backend)) = self.baseline.as_mut() else {
            return Ok(());
        };
        let view = &self.scene.train[index];
        let step = trainer.step(
            iteration,
            max,
            view,
            background,
            backend.as_mut(),
            self.options.detect_anomaly,
        )?;

        let ema = self.state.update_ema(step.loss.total);
        if iteration % PROGRESS_INTERVAL == 0 {
            info!(
                "Iteration {}: loss {:.7} ({} splats)",
                iteration,
                ema,
                trainer.set().len()
            );
        }
        self.reporter
            .scalar("train_loss_patches/l1_loss", step.loss.photometric, iteration);
        self.reporter
            .scalar("train_loss_patches/total_loss", step.loss.total, iteration);
        if step.densified.is_some() {
            self.summary.edits += 1;
            self.session.set_primitive_count(trainer.set().len());
        }

        if save_at == Some(iteration) {
            if let Err(e) = self.sink.save_point_cloud(iteration, trainer.set().params()) {
                error!("Failed to export point cloud at iteration {}: {}", iteration, e);
            }
        }
        Ok(())
    }

    fn on_transition(&mut self, transition: Transition) {
        self.summary.transitions.push(transition);
        match transition.to {
            Mode::Init => {}
            Mode::Refine => {
                self.position_boost = self.config.schedule.refine_position_lr_multiplier;
            }
            Mode::Finalize => self.set.reset_sh_degree(),
        }
        self.training_setup();
    }

    /// Fresh optimizer state and schedules for the current mode.
    fn training_setup(&mut self) {
        self.optimizer = Adam::new(AdamConfig::from(&self.config.optimization), self.set.len());
        self.rebuild_scheduler();
    }

    /// Rebind the scheduler to the current mode and push the rates at its
    /// origin. Modes that update every iteration overwrite them on the next
    /// push; `Init` keeps them.
    fn rebuild_scheduler(&mut self) {
        let optimization = &self.config.optimization;
        let groups: Vec<ParamGroup> = BPrimitive::GROUPS.iter().map(|(g, _)| *g).collect();
        let origin = schedule::origin_for(self.machine.current(), &self.config.schedule);
        let mut scheduler = LearningRateScheduler::from_config(optimization, &groups, origin);
        let position = match self.control.learning_rate_override {
            Some(rate) => GroupSchedule::constant(rate),
            None => optimization
                .position_lr
                .scaled(self.scene.extent * self.position_boost),
        };
        scheduler.set_schedule(ParamGroup::Position, position);
        for (group, rate) in scheduler.rates(origin) {
            self.optimizer.set_learning_rate(group, rate);
        }
        debug!(
            "Scheduler rebuilt (origin {}, position rate {:?})",
            origin,
            self.optimizer.learning_rate(ParamGroup::Position)
        );
        self.scheduler = scheduler;
    }

    fn background(&mut self) -> Vec3 {
        if self.config.optimization.random_background {
            Vec3::new(self.rng.r#gen(), self.rng.r#gen(), self.rng.r#gen())
        } else if self.config.model.white_background {
            Vec3::ONE
        } else {
            Vec3::ZERO
        }
    }

    fn render_controls(&self, iteration: u32) -> RenderControls {
        RenderControls {
            boundary_scale: self.control.boundary_scale,
            primitive_scale: self.control.primitive_scale,
            segments_per_edge: self.control.segments_per_edge,
            active_sh_degree: self.set.active_sh_degree(),
            debug: self.options.debug_from.is_some_and(|from| iteration > from),
        }
    }

    /// Checkpoint failures are logged; they never stop training.
    fn save_checkpoint(&mut self, iteration: u32) {
        let checkpoint = Checkpoint {
            iteration,
            active_sh_degree: self.set.active_sh_degree(),
            mode: self.machine.current().index(),
            primitives: self.set.params().to_vec(),
            optimizer: self.optimizer.snapshot(),
        };
        match self.sink.save_checkpoint(&checkpoint) {
            Ok(()) => {
                info!("[ITER {}] Saved checkpoint", iteration);
                self.summary.checkpoints.push(iteration);
            }
            Err(e) => error!("Failed to save checkpoint at iteration {}: {}", iteration, e),
        }
    }

    /// Render one frame from the client's camera, outside the gradient path.
    fn publish_interactive(&mut self, iteration: u32) {
        if !self.session.is_connected() {
            return;
        }
        self.session.publish_controls(&self.control);
        let Some(pose) = self.session.client_pose() else {
            return;
        };
        let Some(template) = self.scene.train.first() else {
            return;
        };
        let view = Viewpoint::from_client(&pose, template);
        let background = if self.config.model.white_background {
            Vec3::ONE
        } else {
            Vec3::ZERO
        };

        let frame = if self.control.point_mode && self.baseline.is_some() {
            self.baseline_frame(&view, background)
        } else {
            self.patch_frame(&view, background, iteration)
        };
        match frame {
            Ok(Some(frame)) => self.session.publish_frame(&frame),
            Ok(None) => {}
            Err(e) => warn!("Interactive render failed at iteration {}: {}", iteration, e),
        }
    }

    fn patch_frame(&mut self, view: &Viewpoint, background: Vec3, iteration: u32) -> Result<Option<RgbImage>, TrainError> {
        let controls = self.render_controls(iteration);
        let output = self.backend.render(&self.set, view, background, &controls)?;
        let frame = visualize::render_view(
            self.control.render_view,
            &ViewSources {
                output: &output,
                viewpoint: view,
                stats: Some(self.set.stats()),
                thresholds: self.editor.thresholds(),
            },
        );
        self.session.set_primitive_count(self.set.len());
        self.backend.release_cache();
        Ok(frame)
    }

    fn baseline_frame(&mut self, view: &Viewpoint, background: Vec3) -> Result<Option<RgbImage>, TrainError> {
        let Some((trainer, backend)) = self.baseline.as_mut() else {
            return Ok(None);
        };
        let frame = match self.control.render_view {
            RenderView::RawImage => {
                let output = trainer.render(backend.as_mut(), view, background)?;
                Some(imageops::to_rgb8(&output.image))
            }
            RenderView::GroundTruth => Some(imageops::to_rgb8(&view.target)),
            other => {
                warn!("Render view {} is not supported on the point path", other);
                None
            }
        };
        self.session.set_primitive_count(trainer.set().len());
        backend.release_cache();
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ema_recurrence() {
        let mut state = TrainingState::default();
        let emas: Vec<f64> = [1.0, 0.5, 0.25].iter().map(|l| state.update_ema(*l)).collect();
        let expected = [0.4, 0.44, 0.364];
        for (got, want) in emas.iter().zip(expected) {
            assert!((got - want).abs() < 1e-12, "{got} != {want}");
        }
    }
}
