//! Learning-rate schedules.

use bprim_data::ParamGroup;
use std::f64::consts::FRAC_PI_2;

use crate::config::{GroupSchedule, OptimizationConfig, ScheduleConfig};
use crate::mode::Mode;

/// Rate of `schedule` at `effective` iterations past its origin.
///
/// Log-linear interpolation from `init` to `final`, clamped to `final` once
/// `max_steps` is reached, with an optional sine warm-up over `delay_steps`.
pub fn decayed_rate(schedule: &GroupSchedule, effective: u32) -> f32 {
    let Some(final_rate) = schedule.final_rate else {
        return schedule.init;
    };
    let init = schedule.init as f64;
    let end = final_rate as f64;
    let eff = effective as f64;

    let delay = if schedule.delay_steps > 0 && effective < schedule.delay_steps {
        let mult = schedule.delay_mult as f64;
        mult + (1.0 - mult) * (FRAC_PI_2 * (eff / schedule.delay_steps as f64)).sin()
    } else {
        1.0
    };

    if effective >= schedule.max_steps {
        return (end * delay) as f32;
    }
    let t = eff / schedule.max_steps as f64;
    let rate = if init > 0.0 && end > 0.0 {
        (init.ln() * (1.0 - t) + end.ln() * t).exp()
    } else {
        init * (1.0 - t) + end * t
    };
    (rate * delay) as f32
}

/// Maps parameter groups to learning rates relative to an iteration origin.
#[derive(Debug, Clone, PartialEq)]
pub struct LearningRateScheduler {
    groups: Vec<(ParamGroup, GroupSchedule)>,
    origin: u32,
}

impl LearningRateScheduler {
    pub fn new(groups: Vec<(ParamGroup, GroupSchedule)>, origin: u32) -> Self {
        Self { groups, origin }
    }

    /// Scheduler for the given groups using the configured laws.
    pub fn from_config(config: &OptimizationConfig, groups: &[ParamGroup], origin: u32) -> Self {
        Self::new(
            groups.iter().map(|g| (*g, config.schedule_for(*g))).collect(),
            origin,
        )
    }

    pub fn origin(&self) -> u32 {
        self.origin
    }

    /// Replace the law of one group. Returns false if the group is unknown.
    pub fn set_schedule(&mut self, group: ParamGroup, schedule: GroupSchedule) -> bool {
        match self.groups.iter_mut().find(|(g, _)| *g == group) {
            Some((_, slot)) => {
                *slot = schedule;
                true
            }
            None => false,
        }
    }

    pub fn schedule(&self, group: ParamGroup) -> Option<&GroupSchedule> {
        self.groups.iter().find(|(g, _)| *g == group).map(|(_, s)| s)
    }

    pub fn effective_iteration(&self, iteration: u32) -> u32 {
        iteration.saturating_sub(self.origin)
    }

    pub fn rate_for(&self, group: ParamGroup, iteration: u32) -> Option<f32> {
        self.schedule(group)
            .map(|s| decayed_rate(s, self.effective_iteration(iteration)))
    }

    pub fn rates(&self, iteration: u32) -> impl Iterator<Item = (ParamGroup, f32)> + '_ {
        let effective = self.effective_iteration(iteration);
        self.groups
            .iter()
            .map(move |(g, s)| (*g, decayed_rate(s, effective)))
    }
}

/// Iteration origin the scheduler uses inside `mode`.
pub fn origin_for(mode: Mode, schedule: &ScheduleConfig) -> u32 {
    match mode {
        Mode::Init | Mode::Refine => 0,
        Mode::Finalize => schedule.finalize_lr_origin,
    }
}

/// Whether rates are pushed into the optimizer at `iteration` in `mode`.
pub fn pushes_rates(mode: Mode, iteration: u32, schedule: &ScheduleConfig) -> bool {
    match mode {
        Mode::Init => false,
        Mode::Refine => true,
        Mode::Finalize => iteration > schedule.finalize_lr_start,
    }
}
