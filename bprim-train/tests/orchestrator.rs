use std::cell::RefCell;
use std::rc::Rc;

use bprim_data::{BPrimitive, Checkpoint, ParamGroup, Point, Splat};
use bprim_train::backend::{DebugBuffers, IndexMap, PrimitiveBackend, RenderControls, RenderOutput, ScalarMap};
use bprim_train::config::GroupSchedule;
use bprim_train::baseline::{BaselineTrainer, SplatBackend, SplatRenderOutput, SplatSet};
use bprim_train::loss::LossSpec;
use bprim_train::output::{CheckpointSink, MemorySink};
use bprim_train::population::PrimitiveSet;
use bprim_train::report::{MemoryReport, ReportSink};
use bprim_train::session::{ClientPose, InteractiveSession};
use bprim_train::{
    ControlState, Mode, RunOptions, Scene, TrainError, TrainingConfig, TrainingOrchestrator, Transition, Viewpoint,
};
use glam::{Quat, Vec3};
use image::{Luma, Rgb, Rgb32FImage, RgbImage};

const SIZE: u32 = 4;

/// Flat-color renderer that spreads pixels across primitives round robin.
struct MockBackend {
    gradient: f32,
    poison: bool,
}

impl MockBackend {
    fn new(gradient: f32) -> Self {
        Self {
            gradient,
            poison: false,
        }
    }
}

impl PrimitiveBackend for MockBackend {
    fn render(
        &mut self,
        set: &PrimitiveSet,
        _view: &Viewpoint,
        _background: Vec3,
        _controls: &RenderControls,
    ) -> Result<RenderOutput, TrainError> {
        let mut visibility = IndexMap::new(SIZE, SIZE);
        for y in 0..SIZE {
            for x in 0..SIZE {
                visibility.set(x, y, Some((y * SIZE + x) % set.len() as u32));
            }
        }
        Ok(RenderOutput {
            image: Rgb32FImage::from_pixel(SIZE, SIZE, Rgb([0.5; 3])),
            visibility,
            debug: DebugBuffers {
                boundary: Some(ScalarMap::new(SIZE, SIZE)),
                ..DebugBuffers::default()
            },
        })
    }

    fn backward(
        &mut self,
        set: &mut PrimitiveSet,
        _output: &RenderOutput,
        _view: &Viewpoint,
        _loss: &LossSpec,
    ) -> Result<ScalarMap, TrainError> {
        let value = if self.poison { f32::NAN } else { 1e-4 };
        for g in bytemuck::cast_slice_mut::<BPrimitive, f32>(set.grads_mut()) {
            *g += value;
        }
        Ok(ScalarMap::from_pixel(SIZE, SIZE, Luma([self.gradient])))
    }
}

struct MockSplatBackend;

impl SplatBackend for MockSplatBackend {
    fn render(&mut self, set: &SplatSet, _view: &Viewpoint, _background: Vec3) -> Result<SplatRenderOutput, TrainError> {
        Ok(SplatRenderOutput {
            image: Rgb32FImage::from_pixel(SIZE, SIZE, Rgb([0.25; 3])),
            radii: vec![1.0; set.len()],
        })
    }

    fn backward(
        &mut self,
        set: &mut SplatSet,
        _output: &SplatRenderOutput,
        _view: &Viewpoint,
        _loss: &LossSpec,
    ) -> Result<Vec<f32>, TrainError> {
        for g in bytemuck::cast_slice_mut::<Splat, f32>(set.grads_mut()) {
            *g += 1e-4;
        }
        Ok(vec![0.0; set.len()])
    }
}

#[derive(Clone, Default)]
struct SharedSink(Rc<RefCell<MemorySink>>);

impl CheckpointSink for SharedSink {
    fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), TrainError> {
        self.0.borrow_mut().save_checkpoint(checkpoint)
    }

    fn save_point_cloud(&mut self, iteration: u32, splats: &[Splat]) -> Result<(), TrainError> {
        self.0.borrow_mut().save_point_cloud(iteration, splats)
    }
}

struct FailingSink;

impl CheckpointSink for FailingSink {
    fn save_checkpoint(&mut self, _checkpoint: &Checkpoint) -> Result<(), TrainError> {
        Err(TrainError::Config("disk full".into()))
    }

    fn save_point_cloud(&mut self, _iteration: u32, _splats: &[Splat]) -> Result<(), TrainError> {
        Err(TrainError::Config("disk full".into()))
    }
}

/// Connected client that asks for `Refine` on its first poll.
#[derive(Default)]
struct RecordingSession {
    polls: u32,
    frames: Rc<RefCell<Vec<(u32, u32)>>>,
    counts: Rc<RefCell<Vec<usize>>>,
}

impl InteractiveSession for RecordingSession {
    fn is_connected(&self) -> bool {
        true
    }

    fn poll(&mut self, control: &mut ControlState) {
        if self.polls == 0 {
            control.mode = Mode::Refine;
        }
        self.polls += 1;
    }

    fn client_pose(&self) -> Option<ClientPose> {
        Some(ClientPose::from_wxyz([1.0, 0.0, 0.0, 0.0], [0.0, 0.0, -2.0]))
    }

    fn publish_frame(&mut self, frame: &RgbImage) {
        self.frames.borrow_mut().push(frame.dimensions());
    }

    fn publish_controls(&mut self, _control: &ControlState) {}

    fn set_primitive_count(&mut self, count: usize) {
        self.counts.borrow_mut().push(count);
    }
}

fn scene() -> Scene {
    let views = (0..4)
        .map(|i| {
            let target = Rgb32FImage::from_fn(SIZE, SIZE, |x, y| Rgb([(x + y) as f32 / 8.0; 3]));
            Viewpoint::new(i, format!("view{i}"), Quat::IDENTITY, Vec3::new(i as f32, 0.0, -3.0), 1.0, 1.0, target)
        })
        .collect();
    let points = (0..8)
        .map(|i| Point::new(Vec3::new(i as f32 * 0.1, (i % 3) as f32 * 0.1, 0.0), Vec3::splat(0.5)))
        .collect();
    Scene::new(views, Vec::new(), points).unwrap()
}

fn primitives() -> Vec<BPrimitive> {
    (0..4)
        .map(|i| {
            let o = Vec3::new(i as f32, 0.0, 0.0);
            BPrimitive::flat([o, o + Vec3::X, o + Vec3::Y], Vec3::splat(0.5), 0.1)
        })
        .collect()
}

fn short_config(iterations: u32) -> TrainingConfig {
    let mut config = TrainingConfig::default();
    config.optimization.iterations = iterations;
    config.schedule.refine_from_iter = Some(10);
    config.schedule.mode2_iters = 50;
    config.schedule.fix_iters = 50;
    config.schedule.densify_until_iter = 50;
    config.schedule.densification_interval = 20;
    config.schedule.max_primitives = Some(32);
    config
}

fn options() -> RunOptions {
    RunOptions {
        seed: Some(7),
        ..RunOptions::default()
    }
}

#[test]
fn test_modes_advance_once_in_order() {
    let sink = SharedSink::default();
    let mut orchestrator =
        TrainingOrchestrator::new(short_config(60), options(), scene(), primitives(), Box::new(MockBackend::new(1.0)))
            .unwrap()
            .with_checkpoint_sink(Box::new(sink.clone()));
    let summary = orchestrator.run().unwrap();

    assert_eq!(
        summary.transitions,
        vec![
            Transition {
                from: Mode::Init,
                to: Mode::Refine,
                iteration: 10
            },
            Transition {
                from: Mode::Refine,
                to: Mode::Finalize,
                iteration: 50
            },
        ]
    );
    assert_eq!(summary.final_iteration, 60);
    assert_eq!(orchestrator.mode(), Mode::Finalize);
    assert_eq!(orchestrator.control().boundary_scale, -8.5);
    assert!(!orchestrator.control().structural_edit_enabled);
    assert!(summary.ema_loss.is_finite());
    assert_eq!(summary.checkpoints, vec![60]);
    assert_eq!(sink.0.borrow().checkpoints[0].iteration, 60);
    assert_eq!(sink.0.borrow().checkpoints[0].mode, Mode::Finalize.index());
}

#[test]
fn test_edits_keep_statistics_aligned() {
    let mut orchestrator =
        TrainingOrchestrator::new(short_config(45), options(), scene(), primitives(), Box::new(MockBackend::new(1.0)))
            .unwrap();
    let summary = orchestrator.run().unwrap();

    assert_eq!(summary.edits, 2);
    let set = orchestrator.population();
    assert!(set.len() > 4);
    assert!(set.len() <= 32);
    assert_eq!(set.stats().len(), set.len());
    assert_eq!(orchestrator.optimizer().len(), set.len());
}

#[test]
fn test_low_gradient_leaves_population() {
    // Edge statistics only accumulate once boundaries are active.
    let mut config = short_config(30);
    config.schedule.refine_from_iter = None;
    let mut orchestrator =
        TrainingOrchestrator::new(config, options(), scene(), primitives(), Box::new(MockBackend::new(0.0)))
            .unwrap();
    let summary = orchestrator.run().unwrap();
    assert_eq!(summary.edits, 1);
    assert_eq!(orchestrator.population().len(), 4);
}

#[test]
fn test_iterations_are_sequential() {
    let mut orchestrator =
        TrainingOrchestrator::new(short_config(5), options(), scene(), primitives(), Box::new(MockBackend::new(0.0)))
            .unwrap();
    orchestrator.iterate(1).unwrap();
    assert!(matches!(orchestrator.iterate(3), Err(TrainError::InvariantViolation(_))));
    orchestrator.iterate(2).unwrap();
    assert_eq!(orchestrator.state().iteration, 2);
}

fn checkpoint_at(iteration: u32, step: u64, active_sh_degree: u32, mode: Mode) -> Checkpoint {
    let params = primitives();
    Checkpoint {
        iteration,
        active_sh_degree,
        mode: mode.index(),
        optimizer: bprim_data::OptimizerSnapshot {
            step,
            first_moment: params.clone(),
            second_moment: params.clone(),
        },
        primitives: params,
    }
}

#[test]
fn test_restore_late_checkpoint_enters_finalize() {
    let mut config = short_config(15_210);
    config.schedule = Default::default();
    let mut orchestrator =
        TrainingOrchestrator::new(config, options(), scene(), primitives(), Box::new(MockBackend::new(0.0))).unwrap();

    orchestrator.restore(checkpoint_at(15_205, 100, 2, Mode::Init)).unwrap();
    assert_eq!(orchestrator.mode(), Mode::Finalize);
    assert_eq!(orchestrator.control().boundary_scale, -8.5);
    assert_eq!(orchestrator.scheduler().origin(), 15_000);
    assert_eq!(orchestrator.population().active_sh_degree(), 2);

    let summary = orchestrator.run().unwrap();
    assert_eq!(summary.final_iteration, 15_210);
    assert_eq!(summary.transitions.len(), 1);
    assert_eq!(summary.transitions[0].to, Mode::Finalize);
    assert_eq!(summary.transitions[0].iteration, 15_205);
}

#[test]
fn test_restore_keeps_saved_finalize_state() {
    let mut config = short_config(15_003);
    config.schedule = Default::default();
    let mut orchestrator =
        TrainingOrchestrator::new(config, options(), scene(), primitives(), Box::new(MockBackend::new(0.0))).unwrap();

    orchestrator.restore(checkpoint_at(15_000, 15_000, 3, Mode::Finalize)).unwrap();
    assert_eq!(orchestrator.mode(), Mode::Finalize);
    assert_eq!(orchestrator.optimizer().step_count(), 15_000);

    let summary = orchestrator.run().unwrap();
    assert_eq!(summary.transitions.len(), 1);
    assert_eq!(summary.transitions[0].iteration, 15_000);
    assert_eq!(orchestrator.mode(), Mode::Finalize);
    assert_eq!(orchestrator.population().active_sh_degree(), 3);
    // Moments carried on from the checkpoint: steps at 15001 and 15002.
    assert_eq!(orchestrator.optimizer().step_count(), 15_002);
}

#[test]
fn test_restore_refine_checkpoint_keeps_mode() {
    let mut orchestrator =
        TrainingOrchestrator::new(short_config(30), options(), scene(), primitives(), Box::new(MockBackend::new(0.0)))
            .unwrap();
    orchestrator.restore(checkpoint_at(12, 12, 0, Mode::Refine)).unwrap();
    assert_eq!(orchestrator.mode(), Mode::Refine);
    assert_eq!(orchestrator.optimizer().step_count(), 12);

    orchestrator.iterate(13).unwrap();
    assert_eq!(orchestrator.mode(), Mode::Refine);
    assert_eq!(orchestrator.optimizer().step_count(), 13);
}

#[test]
fn test_restore_early_checkpoint_stays_in_init() {
    let mut orchestrator =
        TrainingOrchestrator::new(short_config(30), options(), scene(), primitives(), Box::new(MockBackend::new(0.0)))
            .unwrap();
    orchestrator.restore(checkpoint_at(5, 5, 0, Mode::Init)).unwrap();
    assert_eq!(orchestrator.mode(), Mode::Init);
    assert_eq!(orchestrator.state().first_iter, 5);
}

#[test]
fn test_restore_rejects_unknown_mode() {
    let mut orchestrator =
        TrainingOrchestrator::new(short_config(30), options(), scene(), primitives(), Box::new(MockBackend::new(0.0)))
            .unwrap();
    let mut checkpoint = checkpoint_at(5, 5, 0, Mode::Init);
    checkpoint.mode = 7;
    assert!(matches!(
        orchestrator.restore(checkpoint),
        Err(TrainError::InvariantViolation(_))
    ));
}

#[test]
fn test_init_edit_keeps_setup_learning_rates() {
    let mut config = short_config(30);
    config.schedule.refine_from_iter = None;
    config.optimization.position_lr = GroupSchedule::decay(1.0, 0.01, 100);
    let mut orchestrator =
        TrainingOrchestrator::new(config, options(), scene(), primitives(), Box::new(MockBackend::new(1.0))).unwrap();
    let setup_rate = orchestrator.optimizer().learning_rate(ParamGroup::Position).unwrap();

    for iteration in 1..20 {
        orchestrator.iterate(iteration).unwrap();
    }
    assert_eq!(orchestrator.population().len(), 4);
    assert_eq!(orchestrator.optimizer().learning_rate(ParamGroup::Position), Some(setup_rate));

    orchestrator.iterate(20).unwrap();
    assert!(orchestrator.population().len() > 4);
    assert_eq!(orchestrator.mode(), Mode::Init);
    assert_eq!(orchestrator.optimizer().learning_rate(ParamGroup::Position), Some(setup_rate));
}

#[test]
fn test_disabled_training_still_checkpoints() {
    let sink = SharedSink::default();
    let control = ControlState {
        training_enabled: false,
        ..ControlState::default()
    };
    let mut orchestrator =
        TrainingOrchestrator::new(short_config(20), options(), scene(), primitives(), Box::new(MockBackend::new(1.0)))
            .unwrap()
            .with_control(control)
            .with_checkpoint_sink(Box::new(sink.clone()));
    let summary = orchestrator.run().unwrap();

    assert_eq!(orchestrator.optimizer().step_count(), 0);
    assert_eq!(summary.ema_loss, 0.0);
    assert_eq!(sink.0.borrow().checkpoints.len(), 1);
}

#[test]
fn test_checkpoint_failure_does_not_stop_training() {
    let mut orchestrator =
        TrainingOrchestrator::new(short_config(15), options(), scene(), primitives(), Box::new(MockBackend::new(0.0)))
            .unwrap()
            .with_checkpoint_sink(Box::new(FailingSink));
    let summary = orchestrator.run().unwrap();
    assert_eq!(summary.final_iteration, 15);
    assert!(summary.checkpoints.is_empty());
}

#[test]
fn test_anomaly_detection_reports_divergence() {
    let backend = MockBackend {
        gradient: 0.0,
        poison: true,
    };
    let options = RunOptions {
        detect_anomaly: true,
        ..options()
    };
    let mut orchestrator =
        TrainingOrchestrator::new(short_config(10), options, scene(), primitives(), Box::new(backend)).unwrap();
    match orchestrator.run() {
        Err(TrainError::NumericalDivergence { iteration, mode, .. }) => {
            assert_eq!(iteration, 1);
            assert_eq!(mode, Mode::Init);
        }
        other => panic!("expected divergence, got {other:?}"),
    }
}

#[test]
fn test_client_mode_request_and_frames() {
    let session = RecordingSession::default();
    let frames = session.frames.clone();
    let counts = session.counts.clone();
    let mut orchestrator =
        TrainingOrchestrator::new(short_config(12), options(), scene(), primitives(), Box::new(MockBackend::new(0.0)))
            .unwrap()
            .with_session(Box::new(session));
    let summary = orchestrator.run().unwrap();

    assert_eq!(summary.transitions[0].to, Mode::Refine);
    assert_eq!(summary.transitions[0].iteration, 1);
    assert_eq!(frames.borrow().len(), 12);
    assert!(frames.borrow().iter().all(|d| *d == (SIZE, SIZE)));
    assert!(counts.borrow().iter().all(|c| *c == 4));
}

#[test]
fn test_point_mode_trains_baseline_and_exports() {
    let sink = SharedSink::default();
    let mut config = short_config(25);
    config.baseline.save_pointcloud_iter = Some(20);
    let scene = scene();
    let splats = SplatSet::from_points(&scene.points, config.model.init_opacity, config.model.sh_degree);
    let trainer = BaselineTrainer::new(
        splats,
        &config.optimization,
        config.baseline.clone(),
        config.schedule.sh_increase_interval,
        scene.extent,
        Some(3),
    );
    let control = ControlState {
        point_mode: true,
        ..ControlState::default()
    };
    let mut orchestrator =
        TrainingOrchestrator::new(config, options(), scene, primitives(), Box::new(MockBackend::new(1.0)))
            .unwrap()
            .with_baseline(trainer, Box::new(MockSplatBackend))
            .with_control(control)
            .with_checkpoint_sink(Box::new(sink.clone()));
    let summary = orchestrator.run().unwrap();

    assert!(summary.ema_loss > 0.0);
    assert!(summary.transitions.is_empty());
    assert_eq!(orchestrator.population().len(), 4);
    let sink = sink.0.borrow();
    assert_eq!(sink.point_clouds, vec![(20, 8)]);
    assert_eq!(sink.checkpoints.len(), 1);
    assert_eq!(sink.checkpoints[0].primitives.len(), 4);
}

#[derive(Clone, Default)]
struct SharedReport(Rc<RefCell<MemoryReport>>);

impl ReportSink for SharedReport {
    fn scalar(&mut self, tag: &str, value: f32, iteration: u32) {
        self.0.borrow_mut().scalar(tag, value, iteration);
    }
}

#[test]
fn test_report_tags_at_test_iterations() {
    let report = SharedReport::default();
    let options = RunOptions {
        test_iterations: vec![3],
        ..options()
    };
    let mut orchestrator =
        TrainingOrchestrator::new(short_config(4), options, scene(), primitives(), Box::new(MockBackend::new(0.0)))
            .unwrap()
            .with_reporter(Box::new(report.clone()));
    orchestrator.run().unwrap();

    let report = report.0.borrow();
    let at = |iteration: u32| -> Vec<&str> {
        report
            .scalars
            .iter()
            .filter(|(_, _, i)| *i == iteration)
            .map(|(tag, _, _)| tag.as_str())
            .collect()
    };
    assert_eq!(at(1), vec!["train_loss_patches/l2_loss", "train_loss_patches/total_loss"]);
    // No held-out views, so only the training sample is evaluated.
    assert_eq!(
        at(3),
        vec![
            "train_loss_patches/l2_loss",
            "train_loss_patches/total_loss",
            "train/loss_viewpoint - l2_loss",
            "train/loss_viewpoint - psnr",
            "total_points",
        ]
    );
}

#[test]
fn test_empty_population_is_rejected() {
    let result =
        TrainingOrchestrator::new(short_config(10), options(), scene(), Vec::new(), Box::new(MockBackend::new(0.0)));
    assert!(matches!(result, Err(TrainError::EmptyPopulation { iteration: 0 })));
}
