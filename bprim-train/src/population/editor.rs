//! Density control for the patch population.

use bprim_data::{BPrimitive, Parameters};
use ordered_float::OrderedFloat;
use std::cmp::Reverse;
use tracing::{debug, info};

use super::{EditPlan, PrimitiveSet, SlotOrigin};
use crate::config::ScheduleConfig;
use crate::control::ControlState;
use crate::error::TrainError;
use crate::mode::Mode;
use crate::stats::Channel;

/// Thresholds deciding which primitives grow, refine or go away.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EditThresholds {
    pub grad: f32,
    pub edge: f32,
    pub vis: f32,
    pub area: f32,
    pub min_child_area: f32,
    pub max_primitives: Option<usize>,
}

impl From<&ScheduleConfig> for EditThresholds {
    fn from(schedule: &ScheduleConfig) -> Self {
        Self {
            grad: schedule.grad_threshold,
            edge: schedule.edge_threshold,
            vis: schedule.vis_threshold,
            area: schedule.area_threshold,
            min_child_area: schedule.min_child_area,
            max_primitives: schedule.max_primitives,
        }
    }
}

/// Counts of what one edit did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EditSummary {
    pub split: usize,
    pub refined: usize,
    pub removed: usize,
    pub degenerate: usize,
    pub before: usize,
    pub after: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Keep,
    Split,
    Refine,
    Remove,
}

impl Action {
    /// Primitives added on top of the parent.
    fn growth(self) -> usize {
        match self {
            Action::Split => 1,
            Action::Refine => 3,
            Action::Keep | Action::Remove => 0,
        }
    }
}

/// Splits, refines and removes primitives from accumulated statistics.
#[derive(Debug, Clone)]
pub struct PopulationEditor {
    thresholds: EditThresholds,
}

impl PopulationEditor {
    pub fn new(thresholds: EditThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &EditThresholds {
        &self.thresholds
    }

    /// Edits run below the deadline, on the interval, and only when allowed.
    pub fn is_due(iteration: u32, schedule: &ScheduleConfig, control: &ControlState) -> bool {
        control.structural_edit_enabled
            && iteration < schedule.densify_until_iter
            && iteration % schedule.densification_interval.max(1) == 0
    }

    /// Rewrite the population in one step.
    ///
    /// Returns `None` without touching anything when no frame has been
    /// accumulated since the last edit. Otherwise the statistic channels are
    /// consumed, and the returned plan must also be applied to the optimizer.
    pub fn densify_and_prune(
        &self,
        set: &mut PrimitiveSet,
        mode: Mode,
        iteration: u32,
    ) -> Result<Option<(EditPlan, EditSummary)>, TrainError> {
        set.check_consistency()?;
        let stats = set.stats();
        let channels = [Channel::Gradient, Channel::Edge, Channel::Visibility];
        if !channels.iter().any(|c| stats.has_samples(*c)) {
            debug!("No statistics since the last edit, skipping at iteration {}", iteration);
            return Ok(None);
        }

        let grad = stats.average(Channel::Gradient);
        let vis = stats.average(Channel::Visibility);
        let edge = stats.average(Channel::Edge);
        let mut actions = self.classify(set.params(), &grad, &vis, &edge, mode);
        if let Some(cap) = self.thresholds.max_primitives {
            apply_cap(&mut actions, &grad, cap);
        }

        let before = set.len();
        let mut summary = EditSummary {
            before,
            ..EditSummary::default()
        };
        let mut slots = Vec::with_capacity(before);
        let mut params = Vec::with_capacity(before);
        for (i, (prim, action)) in set.params().iter().zip(&actions).enumerate() {
            let children: Vec<BPrimitive> = match action {
                Action::Keep => {
                    slots.push(SlotOrigin::Retained(i));
                    params.push(*prim);
                    continue;
                }
                Action::Remove => {
                    summary.removed += 1;
                    continue;
                }
                Action::Split => prim.bisect(prim.longest_edge()).to_vec(),
                Action::Refine => prim.subdivide().to_vec(),
            };
            if children.iter().all(|c| self.is_usable(c)) {
                match action {
                    Action::Refine => summary.refined += 1,
                    _ => summary.split += 1,
                }
                for child in children {
                    slots.push(SlotOrigin::Inserted { parent: i });
                    params.push(child);
                }
            } else {
                summary.degenerate += 1;
                slots.push(SlotOrigin::Retained(i));
                params.push(*prim);
            }
        }

        if slots.is_empty() {
            return Err(TrainError::EmptyPopulation { iteration });
        }

        let plan = EditPlan::new(before, slots);
        for channel in channels {
            set.stats_mut().consume_and_reset(channel);
        }
        set.apply_edit(&plan, params)?;
        summary.after = set.len();
        info!(
            "Iteration {}: {} -> {} primitives ({} split, {} refined, {} removed, {} degenerate)",
            iteration,
            summary.before,
            summary.after,
            summary.split,
            summary.refined,
            summary.removed,
            summary.degenerate
        );
        Ok(Some((plan, summary)))
    }

    fn classify(
        &self,
        params: &[BPrimitive],
        grad: &[f32],
        vis: &[f32],
        edge: &[f32],
        mode: Mode,
    ) -> Vec<Action> {
        let t = &self.thresholds;
        params
            .iter()
            .enumerate()
            .map(|(i, prim)| {
                if mode.supports_boundaries() && edge[i] > t.edge {
                    Action::Refine
                } else if grad[i] > t.grad && vis[i] > t.vis {
                    Action::Split
                } else if prim.corner_area() < t.area {
                    Action::Remove
                } else {
                    Action::Keep
                }
            })
            .collect()
    }

    fn is_usable(&self, child: &BPrimitive) -> bool {
        child.is_finite() && child.corner_area() >= self.thresholds.min_child_area
    }
}

/// Keep the edited population under `cap`, preferring the largest gradients.
fn apply_cap(actions: &mut [Action], grad: &[f32], cap: usize) {
    let kept = actions.iter().filter(|a| **a != Action::Remove).count();
    let mut budget = cap.saturating_sub(kept);
    let mut candidates: Vec<usize> = (0..actions.len())
        .filter(|i| actions[*i].growth() > 0)
        .collect();
    candidates.sort_by_key(|i| Reverse(OrderedFloat(grad[*i])));
    for i in candidates {
        let growth = actions[i].growth();
        if growth <= budget {
            budget -= growth;
        } else {
            actions[i] = Action::Keep;
        }
    }
}
