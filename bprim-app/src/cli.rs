//! Command-line surface.

use bprim_train::{RunOptions, TrainingConfig};
use clap::Parser;
use std::path::PathBuf;

/// bprim - fit boundary primitives to a set of calibrated images
#[derive(Parser, Debug, Clone)]
#[command(name = "bprim")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// JSON config file; flags below override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Scene directory with transforms_train.json (or transforms.json)
    #[arg(short, long)]
    pub source: Option<PathBuf>,

    /// Output directory; defaults to ./outputs/<timestamp>
    #[arg(short, long)]
    pub model_path: Option<PathBuf>,

    #[arg(long)]
    pub iterations: Option<u32>,

    #[arg(long, num_args = 1.., default_values_t = [3_000, 10_000, 15_000, 20_000, 25_000, 30_000])]
    pub test_iterations: Vec<u32>,

    #[arg(long, num_args = 1.., default_values_t = [3_000, 7_000, 15_000, 20_000, 30_000])]
    pub checkpoint_iterations: Vec<u32>,

    #[arg(long)]
    pub grad_threshold: Option<f32>,

    #[arg(long)]
    pub edge_threshold: Option<f32>,

    #[arg(long)]
    pub vis_threshold: Option<f32>,

    #[arg(long)]
    pub area_threshold: Option<f32>,

    /// Iteration at which the finalize mode starts
    #[arg(long)]
    pub mode2_iters: Option<u32>,

    /// Structural edits are disabled after this iteration
    #[arg(long)]
    pub fix_iters: Option<u32>,

    #[arg(long, default_value = "0.0.0.0")]
    pub ip: String,

    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    #[arg(long)]
    pub disable_viewer: bool,

    /// Enable renderer debug output after this iteration
    #[arg(long)]
    pub debug_from: Option<u32>,

    /// Fail on non-finite losses or gradients
    #[arg(long)]
    pub detect_anomaly: bool,

    #[arg(short, long)]
    pub quiet: bool,

    /// Checkpoint to resume from
    #[arg(long)]
    pub start_checkpoint: Option<PathBuf>,

    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long)]
    pub white_background: bool,
}

impl Args {
    /// Layer the flags over `config`.
    pub fn apply_to(&self, config: &mut TrainingConfig) {
        if let Some(source) = &self.source {
            config.model.source_path = source.clone();
        }
        if let Some(path) = &self.model_path {
            config.model.model_path = Some(path.clone());
        }
        if self.white_background {
            config.model.white_background = true;
        }
        if let Some(iterations) = self.iterations {
            config.optimization.iterations = iterations;
        }

        let schedule = &mut config.schedule;
        let overrides = [
            (self.grad_threshold, &mut schedule.grad_threshold),
            (self.edge_threshold, &mut schedule.edge_threshold),
            (self.vis_threshold, &mut schedule.vis_threshold),
            (self.area_threshold, &mut schedule.area_threshold),
        ];
        for (value, slot) in overrides {
            if let Some(value) = value {
                *slot = value;
            }
        }
        if let Some(iters) = self.mode2_iters {
            schedule.mode2_iters = iters;
        }
        if let Some(iters) = self.fix_iters {
            schedule.fix_iters = iters;
        }
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            test_iterations: self.test_iterations.clone(),
            checkpoint_iterations: self.checkpoint_iterations.clone(),
            debug_from: self.debug_from,
            detect_anomaly: self.detect_anomaly,
            seed: self.seed,
        }
    }
}
