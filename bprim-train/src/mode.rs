//! Representation modes and their transitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

use crate::config::ScheduleConfig;
use crate::control::ControlState;

/// Optimization regime. Ordered: transitions only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Init,
    Refine,
    Finalize,
}

impl Mode {
    pub fn index(self) -> u32 {
        match self {
            Mode::Init => 0,
            Mode::Refine => 1,
            Mode::Finalize => 2,
        }
    }

    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(Mode::Init),
            1 => Some(Mode::Refine),
            2 => Some(Mode::Finalize),
            _ => None,
        }
    }

    /// Whether primitives carry geometric boundaries in this mode.
    pub fn supports_boundaries(self) -> bool {
        self != Mode::Init
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Init => "init",
            Mode::Refine => "refine",
            Mode::Finalize => "finalize",
        };
        write!(f, "{name}({})", self.index())
    }
}

/// A mode change that fired at `iteration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Mode,
    pub to: Mode,
    pub iteration: u32,
}

/// Owns the active mode.
///
/// The requested mode lives in [`ControlState::mode`] so the interactive
/// client and the iteration triggers can both ask for a change. [`step`] is
/// called every iteration; entry actions run only when the request is ahead of
/// the active mode, so calling it repeatedly never reconfigures twice.
///
/// [`step`]: ModeStateMachine::step
#[derive(Debug, Clone, Default)]
pub struct ModeStateMachine {
    current: Mode,
}

impl ModeStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Mode {
        self.current
    }

    pub fn step(
        &mut self,
        iteration: u32,
        schedule: &ScheduleConfig,
        control: &mut ControlState,
    ) -> Option<Transition> {
        if let Some(refine_at) = schedule.refine_from_iter {
            if iteration >= refine_at && control.mode < Mode::Refine {
                control.mode = Mode::Refine;
            }
        }
        if iteration >= schedule.mode2_iters && control.mode < Mode::Finalize {
            control.mode = Mode::Finalize;
        }

        let requested = control.mode;
        let transition = if requested > self.current {
            Some(self.enter(requested, iteration, schedule, control))
        } else {
            if requested < self.current {
                debug!(
                    "Ignoring request for {} while in {} at iteration {}",
                    requested, self.current, iteration
                );
                control.mode = self.current;
            }
            None
        };

        if self.current == Mode::Init {
            control.boundary_scale = schedule.init_boundary_scale;
        }
        transition
    }

    /// Jump straight to `mode`, running only that mode's entry actions.
    /// Used when resuming from a late checkpoint.
    pub fn force(
        &mut self,
        mode: Mode,
        iteration: u32,
        schedule: &ScheduleConfig,
        control: &mut ControlState,
    ) -> Option<Transition> {
        if mode <= self.current {
            return None;
        }
        control.mode = mode;
        Some(self.enter(mode, iteration, schedule, control))
    }

    fn enter(
        &mut self,
        mode: Mode,
        iteration: u32,
        schedule: &ScheduleConfig,
        control: &mut ControlState,
    ) -> Transition {
        let from = self.current;
        match mode {
            Mode::Init => {}
            Mode::Refine => {
                control.boundary_scale = control.boundary_scale.max(schedule.refine_min_boundary_scale);
            }
            Mode::Finalize => {
                control.boundary_scale = schedule.finalize_boundary_scale;
                if iteration > schedule.fix_iters {
                    control.structural_edit_enabled = false;
                }
            }
        }
        self.current = mode;
        info!("Mode {} -> {} at iteration {}", from, mode, iteration);
        Transition {
            from,
            to: mode,
            iteration,
        }
    }
}
