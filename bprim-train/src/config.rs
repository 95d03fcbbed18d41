//! Run configuration.
//!
//! Every section has defaults so a JSON config file only needs the fields it
//! changes. CLI flags are applied on top by the application.

use bprim_data::ParamGroup;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::TrainError;

/// Checkpoints restored past this iteration resume directly in `Finalize`.
pub const RESTORE_FINALIZE_AFTER: u32 = 15200;

/// Learning-rate law for one parameter group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupSchedule {
    pub init: f32,
    /// Final rate of the exponential decay; `None` keeps the rate constant.
    #[serde(rename = "final")]
    pub final_rate: Option<f32>,
    pub max_steps: u32,
    pub delay_steps: u32,
    pub delay_mult: f32,
}

impl GroupSchedule {
    pub fn constant(rate: f32) -> Self {
        Self {
            init: rate,
            final_rate: None,
            max_steps: 0,
            delay_steps: 0,
            delay_mult: 1.0,
        }
    }

    pub fn decay(init: f32, final_rate: f32, max_steps: u32) -> Self {
        Self {
            init,
            final_rate: Some(final_rate),
            max_steps,
            delay_steps: 0,
            delay_mult: 1.0,
        }
    }

    /// Same law with both the initial and final rates multiplied by `factor`.
    pub fn scaled(mut self, factor: f32) -> Self {
        self.init *= factor;
        if let Some(final_rate) = self.final_rate.as_mut() {
            *final_rate *= factor;
        }
        self
    }
}

impl Default for GroupSchedule {
    fn default() -> Self {
        Self::constant(0.0)
    }
}

/// Scene and output settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub source_path: PathBuf,
    /// Output directory; a timestamped directory is chosen when unset.
    pub model_path: Option<PathBuf>,
    pub sh_degree: u32,
    pub white_background: bool,
    /// Opacity given to seeded primitives.
    pub init_opacity: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            source_path: PathBuf::new(),
            model_path: None,
            sh_degree: 3,
            white_background: false,
            init_opacity: 0.1,
        }
    }
}

/// Optimizer, learning-rate and loss settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationConfig {
    pub iterations: u32,
    pub position_lr: GroupSchedule,
    pub color_lr: GroupSchedule,
    pub features_rest_lr: GroupSchedule,
    pub opacity_lr: GroupSchedule,
    pub scale_lr: GroupSchedule,
    pub rotation_lr: GroupSchedule,
    pub lambda_dssim: f32,
    pub random_background: bool,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
}

impl OptimizationConfig {
    pub fn schedule_for(&self, group: ParamGroup) -> GroupSchedule {
        match group {
            ParamGroup::Position => self.position_lr,
            ParamGroup::Color => self.color_lr,
            ParamGroup::FeaturesRest => self.features_rest_lr,
            ParamGroup::Opacity => self.opacity_lr,
            ParamGroup::Scale => self.scale_lr,
            ParamGroup::Rotation => self.rotation_lr,
        }
    }
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        let mut position_lr = GroupSchedule::decay(0.000_16, 0.000_001_6, 30_000);
        position_lr.delay_mult = 0.01;
        Self {
            iterations: 30_000,
            position_lr,
            color_lr: GroupSchedule::constant(0.0025),
            features_rest_lr: GroupSchedule::constant(0.0025 / 20.0),
            opacity_lr: GroupSchedule::constant(0.05),
            scale_lr: GroupSchedule::constant(0.005),
            rotation_lr: GroupSchedule::constant(0.001),
            lambda_dssim: 0.2,
            random_background: false,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-15,
        }
    }
}

/// Mode transitions, density-edit cadence and thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Iteration at which `Init` advances to `Refine`, if any.
    pub refine_from_iter: Option<u32>,
    /// Iteration at which training advances to `Finalize`.
    pub mode2_iters: u32,
    /// After this iteration structural edits are switched off.
    pub fix_iters: u32,
    pub densify_until_iter: u32,
    pub densification_interval: u32,
    pub grad_threshold: f32,
    pub edge_threshold: f32,
    pub vis_threshold: f32,
    pub area_threshold: f32,
    /// Children below this corner area make a split degenerate.
    pub min_child_area: f32,
    pub max_primitives: Option<usize>,
    /// Boundary scale pinned while in `Init`.
    pub init_boundary_scale: f32,
    /// Lower bound for the boundary scale on `Refine` entry.
    pub refine_min_boundary_scale: f32,
    /// Boundary scale frozen on `Finalize` entry.
    pub finalize_boundary_scale: f32,
    pub refine_position_lr_multiplier: f32,
    /// Learning-rate origin used inside `Finalize`.
    pub finalize_lr_origin: u32,
    /// Learning rates are only pushed in `Finalize` after this iteration.
    pub finalize_lr_start: u32,
    pub sh_increase_interval: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            refine_from_iter: None,
            mode2_iters: 15_000,
            fix_iters: 15_000,
            densify_until_iter: 15_000,
            densification_interval: 100,
            grad_threshold: 0.000_2,
            edge_threshold: 0.5,
            vis_threshold: 0.001,
            area_threshold: 1e-7,
            min_child_area: 1e-10,
            max_primitives: None,
            init_boundary_scale: -9.0,
            refine_min_boundary_scale: -7.0,
            finalize_boundary_scale: -8.5,
            refine_position_lr_multiplier: 5.0,
            finalize_lr_origin: 15_000,
            finalize_lr_start: RESTORE_FINALIZE_AFTER,
            sh_increase_interval: 1000,
        }
    }
}

/// Settings of the point-splat baseline path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    pub densify_from_iter: u32,
    pub densify_until_iter: Option<u32>,
    pub densify_every: u32,
    pub opacity_reset_interval: u32,
    pub densify_grad_threshold: f32,
    pub min_opacity: f32,
    pub percent_dense: f32,
    pub max_screen_size: f32,
    pub save_pointcloud_iter: Option<u32>,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            densify_from_iter: 500,
            densify_until_iter: None,
            densify_every: 100,
            opacity_reset_interval: 3000,
            densify_grad_threshold: 0.000_2,
            min_opacity: 0.005,
            percent_dense: 0.01,
            max_screen_size: 20.0,
            save_pointcloud_iter: Some(7000),
        }
    }
}

/// Complete configuration of one run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    pub optimization: OptimizationConfig,
    pub schedule: ScheduleConfig,
    pub baseline: BaselineConfig,
}

impl TrainingConfig {
    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, TrainError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self =
            serde_json::from_str(&text).map_err(|e| TrainError::Config(e.to_string()))?;
        config.validate()?;
        debug!("Loaded config: {:?}", config);
        Ok(config)
    }

    /// Write the effective configuration next to the run outputs.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), TrainError> {
        let text =
            serde_json::to_string_pretty(self).map_err(|e| TrainError::Config(e.to_string()))?;
        std::fs::write(path.as_ref(), text)?;
        info!("Wrote config to {}", path.as_ref().display());
        Ok(())
    }

    pub fn validate(&self) -> Result<(), TrainError> {
        if self.optimization.iterations == 0 {
            return Err(TrainError::Config("iterations must be positive".into()));
        }
        if self.schedule.densification_interval == 0 || self.baseline.densify_every == 0 {
            return Err(TrainError::Config("densification intervals must be positive".into()));
        }
        if self.schedule.sh_increase_interval == 0 {
            return Err(TrainError::Config("sh_increase_interval must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.optimization.lambda_dssim) {
            return Err(TrainError::Config("lambda_dssim must be within 0..=1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "schedule": { "mode2_iters": 50, "grad_threshold": 0.5 },
                        "optimization": { "position_lr": { "init": 1.0, "final": 0.01, "max_steps": 100 } } }"#;
        let config: TrainingConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.schedule.mode2_iters, 50);
        assert_eq!(config.schedule.grad_threshold, 0.5);
        assert_eq!(config.schedule.densification_interval, 100);
        assert_eq!(config.optimization.position_lr.final_rate, Some(0.01));
        assert_eq!(config.optimization.position_lr.delay_mult, 1.0);
        assert_eq!(config.optimization.iterations, 30_000);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = TrainingConfig::default();
        config.schedule.densification_interval = 0;
        assert!(matches!(config.validate(), Err(TrainError::Config(_))));
    }

    #[test]
    fn test_scaled_schedule() {
        let schedule = GroupSchedule::decay(1.0, 0.1, 10).scaled(5.0);
        assert_eq!(schedule.init, 5.0);
        assert_eq!(schedule.final_rate, Some(0.5));
    }
}
