//! Adam over POD parameter records.
//!
//! Moments are stored in the same record type as the parameters, so every
//! float has its moment at the same offset and an [`EditPlan`] can carry them
//! across population edits.

use bprim_data::{BPrimitive, OptimizerSnapshot, ParamGroup, Parameters};
use tracing::debug;

use crate::config::OptimizationConfig;
use crate::error::TrainError;
use crate::population::EditPlan;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamConfig {
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
}

impl From<&OptimizationConfig> for AdamConfig {
    fn from(config: &OptimizationConfig) -> Self {
        Self {
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.eps,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Adam<T: Parameters> {
    config: AdamConfig,
    rates: Vec<(ParamGroup, f32)>,
    first: Vec<T>,
    second: Vec<T>,
    step: u64,
}

impl<T: Parameters> Adam<T> {
    /// Fresh optimizer for `len` records, every group starting at rate 0.
    pub fn new(config: AdamConfig, len: usize) -> Self {
        Self {
            config,
            rates: T::GROUPS.iter().map(|(g, _)| (*g, 0.0)).collect(),
            first: vec![T::zeroed(); len],
            second: vec![T::zeroed(); len],
            step: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.first.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_empty()
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    pub fn learning_rate(&self, group: ParamGroup) -> Option<f32> {
        self.rates.iter().find(|(g, _)| *g == group).map(|(_, r)| *r)
    }

    /// Groups the record type does not have are ignored.
    pub fn set_learning_rate(&mut self, group: ParamGroup, rate: f32) {
        if let Some((_, slot)) = self.rates.iter_mut().find(|(g, _)| *g == group) {
            *slot = rate;
        }
    }

    pub fn step(&mut self, params: &mut [T], grads: &[T]) -> Result<(), TrainError> {
        if params.len() != self.len() || grads.len() != self.len() {
            return Err(TrainError::InvariantViolation(format!(
                "optimizer holds {} moments for {} parameters and {} gradients",
                self.len(),
                params.len(),
                grads.len()
            )));
        }

        self.step += 1;
        let AdamConfig { beta1, beta2, eps } = self.config;
        let bias1 = 1.0 - beta1.powf(self.step as f32);
        let bias2 = 1.0 - beta2.powf(self.step as f32);

        for (i, (param, grad)) in params.iter_mut().zip(grads).enumerate() {
            let p = param.floats_mut();
            let g = grad.floats();
            let m = self.first[i].floats_mut();
            let v = self.second[i].floats_mut();
            for (group, range) in T::GROUPS {
                let lr = self
                    .rates
                    .iter()
                    .find(|(name, _)| name == group)
                    .map_or(0.0, |(_, r)| *r);
                for k in range.clone() {
                    m[k] = m[k] * beta1 + g[k] * (1.0 - beta1);
                    v[k] = v[k] * beta2 + g[k] * g[k] * (1.0 - beta2);
                    let m_hat = m[k] / bias1;
                    let v_hat = v[k] / bias2;
                    p[k] -= lr * m_hat / (v_hat.sqrt() + eps);
                }
            }
        }
        Ok(())
    }

    /// Carry moments of retained records; inserted records start at zero.
    pub fn remap(&mut self, plan: &EditPlan) -> Result<(), TrainError> {
        let first = plan.remap(&self.first, |_| T::zeroed())?;
        let second = plan.remap(&self.second, |_| T::zeroed())?;
        self.first = first;
        self.second = second;
        debug!("Optimizer state remapped to {} records", self.len());
        Ok(())
    }

    /// Zero the moments of one group, keeping the step counter.
    pub fn reset_group(&mut self, group: ParamGroup) {
        let Some(range) = T::group_range(group) else {
            return;
        };
        for record in self.first.iter_mut().chain(self.second.iter_mut()) {
            record.floats_mut()[range.clone()].fill(0.0);
        }
    }
}

impl Adam<BPrimitive> {
    pub fn snapshot(&self) -> OptimizerSnapshot {
        OptimizerSnapshot {
            step: self.step,
            first_moment: self.first.clone(),
            second_moment: self.second.clone(),
        }
    }

    /// Rebuild from a checkpoint. Rates start at 0 until the scheduler pushes them.
    pub fn from_snapshot(config: AdamConfig, snapshot: OptimizerSnapshot, len: usize) -> Result<Self, TrainError> {
        if snapshot.first_moment.len() != len || snapshot.second_moment.len() != len {
            return Err(TrainError::InvariantViolation(format!(
                "optimizer snapshot has {}/{} moments for {} primitives",
                snapshot.first_moment.len(),
                snapshot.second_moment.len(),
                len
            )));
        }
        let mut adam = Self::new(config, 0);
        adam.first = snapshot.first_moment;
        adam.second = snapshot.second_moment;
        adam.step = snapshot.step;
        Ok(adam)
    }
}
