//! Per-primitive statistics gathered from rendered frames.
//!
//! Three channels are kept: the per-pixel loss gradient, the edge-alignment
//! score and the visibility fraction. Each has its own sum and denominator so
//! they can be consumed on independent cadences.

use thiserror::Error;

use crate::backend::{IndexMap, ScalarMap};
use crate::population::{EditPlan, SlotOrigin};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StatsError {
    #[error("Accumulator holds {accumulator} primitives but the population has {population}")]
    LengthMismatch { accumulator: usize, population: usize },

    #[error("{what} buffer is {found:?}, expected {expected:?}")]
    BufferSize {
        what: &'static str,
        expected: (u32, u32),
        found: (u32, u32),
    },

    #[error("Pixel refers to primitive {index} but only {len} exist")]
    IndexOutOfRange { index: u32, len: usize },
}

/// Statistic channel selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Gradient,
    Edge,
    Visibility,
}

/// Buffers produced by rendering one viewpoint.
#[derive(Debug, Clone, Copy)]
pub struct FrameStats<'a> {
    /// Front-most primitive per pixel.
    pub visibility: &'a IndexMap,
    /// Per-pixel loss gradient magnitude.
    pub gradient: Option<&'a ScalarMap>,
    /// Per-pixel edge-alignment value.
    pub edge: Option<&'a ScalarMap>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct ChannelSums {
    sum: Vec<f32>,
    denom: Vec<f32>,
}

impl ChannelSums {
    fn new(len: usize) -> Self {
        Self {
            sum: vec![0.0; len],
            denom: vec![0.0; len],
        }
    }

    fn average(&self) -> Vec<f32> {
        self.sum
            .iter()
            .zip(&self.denom)
            .map(|(s, d)| s / d.max(1.0))
            .collect()
    }

    fn reset(&mut self) {
        self.sum.fill(0.0);
        self.denom.fill(0.0);
    }

    fn has_samples(&self) -> bool {
        self.denom.iter().any(|d| *d > 0.0)
    }

    fn reindex(&mut self, plan: &EditPlan) {
        let carry = |old: &[f32]| -> Vec<f32> {
            plan.slots()
                .iter()
                .map(|slot| match *slot {
                    SlotOrigin::Retained(i) => old[i],
                    SlotOrigin::Inserted { .. } => 0.0,
                })
                .collect()
        };
        self.sum = carry(&self.sum);
        self.denom = carry(&self.denom);
    }
}

/// Running per-primitive sums for every channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatAccumulator {
    gradient: ChannelSums,
    edge: ChannelSums,
    visibility: ChannelSums,
}

impl StatAccumulator {
    pub fn new(len: usize) -> Self {
        Self {
            gradient: ChannelSums::new(len),
            edge: ChannelSums::new(len),
            visibility: ChannelSums::new(len),
        }
    }

    pub fn len(&self) -> usize {
        self.gradient.sum.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fails unless the accumulator is sized for `population` primitives.
    pub fn check_len(&self, population: usize) -> Result<(), StatsError> {
        if self.len() != population {
            return Err(StatsError::LengthMismatch {
                accumulator: self.len(),
                population,
            });
        }
        Ok(())
    }

    fn channel(&self, channel: Channel) -> &ChannelSums {
        match channel {
            Channel::Gradient => &self.gradient,
            Channel::Edge => &self.edge,
            Channel::Visibility => &self.visibility,
        }
    }

    fn channel_mut(&mut self, channel: Channel) -> &mut ChannelSums {
        match channel {
            Channel::Gradient => &mut self.gradient,
            Channel::Edge => &mut self.edge,
            Channel::Visibility => &mut self.visibility,
        }
    }

    /// Add one frame. Every buffer is validated before anything is written,
    /// so a failed call leaves the sums unchanged.
    pub fn accumulate(&mut self, frame: &FrameStats<'_>) -> Result<(), StatsError> {
        let dims = frame.visibility.dimensions();
        for (what, map) in [("gradient", frame.gradient), ("edge", frame.edge)] {
            if let Some(map) = map {
                if map.dimensions() != dims {
                    return Err(StatsError::BufferSize {
                        what,
                        expected: dims,
                        found: map.dimensions(),
                    });
                }
            }
        }

        let len = self.len();
        let mut covered = vec![0u32; len];
        for index in frame.visibility.data().iter().flatten() {
            let slot = covered
                .get_mut(*index as usize)
                .ok_or(StatsError::IndexOutOfRange { index: *index, len })?;
            *slot += 1;
        }

        for (pixel, index) in frame.visibility.data().iter().enumerate() {
            let Some(index) = index else { continue };
            let i = *index as usize;
            if let Some(gradient) = frame.gradient {
                self.gradient.sum[i] += gradient.as_raw()[pixel];
                self.gradient.denom[i] += 1.0;
            }
            if let Some(edge) = frame.edge {
                self.edge.sum[i] += edge.as_raw()[pixel];
                self.edge.denom[i] += 1.0;
            }
        }

        let frame_pixels = (dims.0 as f32 * dims.1 as f32).max(1.0);
        for (i, count) in covered.iter().enumerate() {
            if *count > 0 {
                self.visibility.sum[i] += *count as f32 / frame_pixels;
                self.visibility.denom[i] += 1.0;
            }
        }
        Ok(())
    }

    /// Averaged channel values without resetting.
    pub fn average(&self, channel: Channel) -> Vec<f32> {
        self.channel(channel).average()
    }

    /// Averaged channel values; the channel is zeroed afterwards.
    pub fn consume_and_reset(&mut self, channel: Channel) -> Vec<f32> {
        let sums = self.channel_mut(channel);
        let averaged = sums.average();
        sums.reset();
        averaged
    }

    pub fn has_samples(&self, channel: Channel) -> bool {
        self.channel(channel).has_samples()
    }

    /// Rewrite every channel into the layout produced by `plan`.
    pub fn reindex(&mut self, plan: &EditPlan) -> Result<(), StatsError> {
        self.check_len(plan.source_len())?;
        for channel in [Channel::Gradient, Channel::Edge, Channel::Visibility] {
            self.channel_mut(channel).reindex(plan);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn frame_map() -> IndexMap {
        // 2x2 frame: primitive 0 covers three pixels, primitive 2 one.
        let mut map = IndexMap::new(2, 2);
        map.set(0, 0, Some(0));
        map.set(1, 0, Some(0));
        map.set(0, 1, Some(0));
        map.set(1, 1, Some(2));
        map
    }

    #[test]
    fn test_accumulate_and_consume() {
        let map = frame_map();
        let gradient = ScalarMap::from_fn(2, 2, |x, y| Luma([(x + 2 * y) as f32]));
        let mut acc = StatAccumulator::new(3);
        acc.accumulate(&FrameStats {
            visibility: &map,
            gradient: Some(&gradient),
            edge: None,
        })
        .unwrap();

        assert_eq!(acc.average(Channel::Gradient), vec![1.0, 0.0, 3.0]);
        assert_eq!(acc.average(Channel::Visibility), vec![0.75, 0.0, 0.25]);
        assert!(!acc.has_samples(Channel::Edge));

        let first = acc.consume_and_reset(Channel::Gradient);
        assert_eq!(first, vec![1.0, 0.0, 3.0]);
        let second = acc.consume_and_reset(Channel::Gradient);
        assert_eq!(second, vec![0.0, 0.0, 0.0]);
        // Other channels are untouched.
        assert!(acc.has_samples(Channel::Visibility));
    }

    #[test]
    fn test_visibility_denominator_counts_frames() {
        let map = frame_map();
        let mut acc = StatAccumulator::new(3);
        let frame = FrameStats {
            visibility: &map,
            gradient: None,
            edge: None,
        };
        acc.accumulate(&frame).unwrap();
        acc.accumulate(&frame).unwrap();
        assert_eq!(acc.average(Channel::Visibility), vec![0.75, 0.0, 0.25]);
    }

    #[test]
    fn test_out_of_range_index_fails_without_writing() {
        let map = frame_map();
        let gradient = ScalarMap::from_pixel(2, 2, Luma([1.0]));
        let mut acc = StatAccumulator::new(2);
        let err = acc
            .accumulate(&FrameStats {
                visibility: &map,
                gradient: Some(&gradient),
                edge: None,
            })
            .unwrap_err();
        assert_eq!(err, StatsError::IndexOutOfRange { index: 2, len: 2 });
        assert!(!acc.has_samples(Channel::Gradient));
    }

    #[test]
    fn test_buffer_size_mismatch() {
        let map = frame_map();
        let edge = ScalarMap::new(3, 2);
        let mut acc = StatAccumulator::new(3);
        let err = acc
            .accumulate(&FrameStats {
                visibility: &map,
                gradient: None,
                edge: Some(&edge),
            })
            .unwrap_err();
        assert!(matches!(err, StatsError::BufferSize { what: "edge", .. }));
    }

    #[test]
    fn test_reindex_carries_retained_and_zeroes_inserted() {
        let map = frame_map();
        let gradient = ScalarMap::from_pixel(2, 2, Luma([2.0]));
        let mut acc = StatAccumulator::new(3);
        acc.accumulate(&FrameStats {
            visibility: &map,
            gradient: Some(&gradient),
            edge: None,
        })
        .unwrap();

        let plan = EditPlan::new(
            3,
            vec![
                SlotOrigin::Retained(2),
                SlotOrigin::Inserted { parent: 0 },
                SlotOrigin::Inserted { parent: 0 },
            ],
        );
        acc.reindex(&plan).unwrap();
        assert_eq!(acc.len(), 3);
        assert_eq!(acc.average(Channel::Gradient), vec![2.0, 0.0, 0.0]);

        let wrong = EditPlan::new(5, vec![SlotOrigin::Retained(0)]);
        assert!(matches!(acc.reindex(&wrong), Err(StatsError::LengthMismatch { .. })));
    }
}
