//! The trainable patch population and its structural edits.

mod editor;

pub use editor::{EditSummary, EditThresholds, PopulationEditor};

use bprim_data::{BPrimitive, MAX_SH_DEGREE, Parameters};
use bytemuck::Zeroable;

use crate::error::TrainError;
use crate::stats::{StatAccumulator, StatsError};

/// Where a slot of the edited population comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOrigin {
    /// Carried over from this index of the previous population.
    Retained(usize),
    /// Newly created from the given previous index.
    Inserted { parent: usize },
}

/// Mapping from a population to its edited successor.
///
/// The same plan rewrites the parameters, the statistics and the optimizer
/// moments, so all per-primitive arrays stay aligned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditPlan {
    source_len: usize,
    slots: Vec<SlotOrigin>,
}

impl EditPlan {
    pub fn new(source_len: usize, slots: Vec<SlotOrigin>) -> Self {
        Self { source_len, slots }
    }

    /// Plan that keeps `len` primitives in place.
    pub fn identity(len: usize) -> Self {
        Self::new(len, (0..len).map(SlotOrigin::Retained).collect())
    }

    pub fn source_len(&self) -> usize {
        self.source_len
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[SlotOrigin] {
        &self.slots
    }

    pub fn inserted(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, SlotOrigin::Inserted { .. }))
            .count()
    }

    /// Every referenced index must exist in the source population.
    pub fn validate(&self) -> Result<(), TrainError> {
        let bad = self.slots.iter().find(|slot| match slot {
            SlotOrigin::Retained(i) | SlotOrigin::Inserted { parent: i } => *i >= self.source_len,
        });
        match bad {
            Some(slot) => Err(TrainError::InvariantViolation(format!(
                "edit plan slot {slot:?} outside a population of {}",
                self.source_len
            ))),
            None => Ok(()),
        }
    }

    /// Retained entries are carried, inserted ones come from `inserted`.
    pub fn remap<T: Copy>(&self, old: &[T], inserted: impl Fn(usize) -> T) -> Result<Vec<T>, TrainError> {
        if old.len() != self.source_len {
            return Err(TrainError::InvariantViolation(format!(
                "edit plan expects {} entries, found {}",
                self.source_len,
                old.len()
            )));
        }
        self.validate()?;
        Ok(self
            .slots
            .iter()
            .map(|slot| match *slot {
                SlotOrigin::Retained(i) => old[i],
                SlotOrigin::Inserted { parent } => inserted(parent),
            })
            .collect())
    }
}

/// Patch parameters, their gradients and the statistics gathered for them.
///
/// All three arrays have the same length at every observable point; an edit
/// replaces them together.
#[derive(Debug, Clone)]
pub struct PrimitiveSet {
    params: Vec<BPrimitive>,
    grads: Vec<BPrimitive>,
    stats: StatAccumulator,
    active_sh_degree: u32,
    max_sh_degree: u32,
}

impl PrimitiveSet {
    pub fn new(params: Vec<BPrimitive>, max_sh_degree: u32) -> Self {
        let len = params.len();
        Self {
            params,
            grads: vec![BPrimitive::zeroed(); len],
            stats: StatAccumulator::new(len),
            active_sh_degree: 0,
            max_sh_degree: max_sh_degree.min(MAX_SH_DEGREE),
        }
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn params(&self) -> &[BPrimitive] {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut [BPrimitive] {
        &mut self.params
    }

    pub fn grads(&self) -> &[BPrimitive] {
        &self.grads
    }

    pub fn grads_mut(&mut self) -> &mut [BPrimitive] {
        &mut self.grads
    }

    /// Parameters and gradients borrowed together for an optimizer step.
    pub fn params_and_grads(&mut self) -> (&mut [BPrimitive], &[BPrimitive]) {
        (&mut self.params, &self.grads)
    }

    pub fn zero_grad(&mut self) {
        self.grads.fill(BPrimitive::zeroed());
    }

    pub fn grads_finite(&self) -> bool {
        self.grads.iter().all(|g| g.is_finite())
    }

    pub fn stats(&self) -> &StatAccumulator {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut StatAccumulator {
        &mut self.stats
    }

    /// Fails loudly if any per-primitive array drifted from the parameters.
    pub fn check_consistency(&self) -> Result<(), StatsError> {
        self.stats.check_len(self.params.len())?;
        if self.grads.len() != self.params.len() {
            return Err(StatsError::LengthMismatch {
                accumulator: self.grads.len(),
                population: self.params.len(),
            });
        }
        Ok(())
    }

    pub fn active_sh_degree(&self) -> u32 {
        self.active_sh_degree
    }

    pub fn max_sh_degree(&self) -> u32 {
        self.max_sh_degree
    }

    pub fn set_active_sh_degree(&mut self, degree: u32) {
        self.active_sh_degree = degree.min(self.max_sh_degree);
    }

    /// Raise the active SH degree by one, up to the maximum.
    pub fn one_up_sh_degree(&mut self) -> bool {
        if self.active_sh_degree < self.max_sh_degree {
            self.active_sh_degree += 1;
            true
        } else {
            false
        }
    }

    pub fn reset_sh_degree(&mut self) {
        self.active_sh_degree = 0;
    }

    /// Replace the population according to `plan`. `params` is the edited
    /// parameter array, one entry per plan slot. Gradients are discarded.
    pub fn apply_edit(&mut self, plan: &EditPlan, params: Vec<BPrimitive>) -> Result<(), TrainError> {
        self.check_consistency()?;
        if plan.source_len() != self.params.len() || params.len() != plan.len() {
            return Err(TrainError::InvariantViolation(format!(
                "edit of {} -> {} primitives does not match plan {} -> {}",
                self.params.len(),
                params.len(),
                plan.source_len(),
                plan.len()
            )));
        }
        plan.validate()?;
        self.stats.reindex(plan)?;
        self.grads = vec![BPrimitive::zeroed(); params.len()];
        self.params = params;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn patch(offset: f32) -> BPrimitive {
        let o = Vec3::splat(offset);
        BPrimitive::flat([o, o + Vec3::X, o + Vec3::Y], Vec3::ONE, 1.0)
    }

    #[test]
    fn test_plan_remap() {
        let plan = EditPlan::new(
            3,
            vec![
                SlotOrigin::Retained(0),
                SlotOrigin::Retained(2),
                SlotOrigin::Inserted { parent: 1 },
            ],
        );
        let out = plan.remap(&[10, 11, 12], |parent| parent * 100).unwrap();
        assert_eq!(out, vec![10, 12, 100]);
        assert_eq!(plan.inserted(), 1);
        assert!(plan.remap(&[1, 2], |_| 0).is_err());
    }

    #[test]
    fn test_plan_validate_rejects_bad_index() {
        let plan = EditPlan::new(1, vec![SlotOrigin::Inserted { parent: 4 }]);
        assert!(matches!(plan.validate(), Err(TrainError::InvariantViolation(_))));
    }

    #[test]
    fn test_sh_degree_is_capped() {
        let mut set = PrimitiveSet::new(vec![patch(0.0)], 2);
        assert!(set.one_up_sh_degree());
        assert!(set.one_up_sh_degree());
        assert!(!set.one_up_sh_degree());
        assert_eq!(set.active_sh_degree(), 2);
        set.reset_sh_degree();
        assert_eq!(set.active_sh_degree(), 0);
    }

    #[test]
    fn test_apply_edit_keeps_arrays_aligned() {
        let mut set = PrimitiveSet::new(vec![patch(0.0), patch(1.0)], 3);
        set.grads_mut()[0].opacity = 1.0;
        let plan = EditPlan::new(
            2,
            vec![
                SlotOrigin::Retained(1),
                SlotOrigin::Inserted { parent: 0 },
                SlotOrigin::Inserted { parent: 0 },
            ],
        );
        let params = vec![patch(1.0), patch(0.0), patch(0.5)];
        set.apply_edit(&plan, params).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.grads().len(), 3);
        assert_eq!(set.stats().len(), 3);
        assert_eq!(set.grads()[1].opacity, 0.0);
        set.check_consistency().unwrap();
    }

    #[test]
    fn test_apply_edit_rejects_mismatched_params() {
        let mut set = PrimitiveSet::new(vec![patch(0.0)], 3);
        let plan = EditPlan::identity(1);
        assert!(set.apply_edit(&plan, vec![]).is_err());
        assert_eq!(set.len(), 1);
    }
}
