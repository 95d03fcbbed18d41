//! bprim Training Crate
//!
//! The adaptive training controller: it decides per iteration which
//! optimization regime is active, accumulates per-primitive statistics from
//! every rendered frame, and periodically restructures the primitive
//! population. Rendering, gradient computation, the interactive client and
//! reporting sinks are collaborators behind the traits in [`backend`],
//! [`session`] and [`report`].
//!
//! ## Modules
//!
//! - [`config`]: run configuration (serde, JSON)
//! - [`control`]: the interactive control state and render-view selector
//! - [`stats`]: per-primitive accumulator channels
//! - [`schedule`]: learning-rate decay and time-shifted origins
//! - [`mode`]: the `Init -> Refine -> Finalize` state machine
//! - [`population`]: the primitive set and its structural editor
//! - [`optim`]: Adam over POD parameter records
//! - [`orchestrator`]: the per-iteration driver
//! - [`output`]: checkpoint and point-cloud destinations
//! - [`baseline`]: the point-splat baseline path

pub mod backend;
pub mod baseline;
pub mod config;
pub mod control;
pub mod error;
pub mod imageops;
pub mod loss;
pub mod mode;
pub mod optim;
pub mod orchestrator;
pub mod output;
pub mod population;
pub mod report;
pub mod schedule;
pub mod session;
pub mod stats;
pub mod viewpoint;
pub mod visualize;

pub use backend::{DebugBuffers, IndexMap, PrimitiveBackend, RenderControls, RenderOutput, ScalarMap};
pub use config::TrainingConfig;
pub use control::{ControlState, ControlUpdate, RenderView};
pub use error::TrainError;
pub use mode::{Mode, ModeStateMachine, Transition};
pub use orchestrator::{RunOptions, RunSummary, TrainingOrchestrator, TrainingState};
pub use output::{CheckpointSink, DirectorySink, MemorySink};
pub use population::{PopulationEditor, PrimitiveSet};
pub use schedule::LearningRateScheduler;
pub use stats::{Channel, FrameStats, StatAccumulator};
pub use viewpoint::{Scene, Viewpoint, ViewpointSampler};
