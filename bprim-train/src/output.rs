//! Where checkpoints and exported point clouds go.

use bprim_data::{Checkpoint, Splat, write_splats_ply};
use std::path::{Path, PathBuf};

use crate::error::TrainError;

/// Destination for run artifacts. Called with shared references only.
pub trait CheckpointSink {
    fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), TrainError>;

    fn save_point_cloud(&mut self, iteration: u32, splats: &[Splat]) -> Result<(), TrainError>;
}

/// Writes `chkpnt{iteration}.bin` and `point_cloud/iteration_{iteration}/point_cloud.ply`
/// under the model directory.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn checkpoint_path(&self, iteration: u32) -> PathBuf {
        self.root.join(format!("chkpnt{iteration}.bin"))
    }
}

impl CheckpointSink for DirectorySink {
    fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), TrainError> {
        std::fs::create_dir_all(&self.root)?;
        checkpoint.save(self.checkpoint_path(checkpoint.iteration))?;
        Ok(())
    }

    fn save_point_cloud(&mut self, iteration: u32, splats: &[Splat]) -> Result<(), TrainError> {
        let dir = self
            .root
            .join("point_cloud")
            .join(format!("iteration_{iteration}"));
        std::fs::create_dir_all(&dir)?;
        write_splats_ply(dir.join("point_cloud.ply"), splats)?;
        Ok(())
    }
}

/// Keeps everything in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub checkpoints: Vec<Checkpoint>,
    pub point_clouds: Vec<(u32, usize)>,
}

impl CheckpointSink for MemorySink {
    fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), TrainError> {
        self.checkpoints.push(checkpoint.clone());
        Ok(())
    }

    fn save_point_cloud(&mut self, iteration: u32, splats: &[Splat]) -> Result<(), TrainError> {
        self.point_clouds.push((iteration, splats.len()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bprim_data::{BPrimitive, OptimizerSnapshot};
    use bytemuck::Zeroable;

    #[test]
    fn test_directory_sink_names() {
        let root = std::env::temp_dir().join(format!("bprim-sink-{}", std::process::id()));
        let mut sink = DirectorySink::new(&root);
        let checkpoint = Checkpoint {
            iteration: 42,
            active_sh_degree: 0,
            mode: 0,
            primitives: vec![BPrimitive::zeroed()],
            optimizer: OptimizerSnapshot {
                step: 0,
                first_moment: vec![BPrimitive::zeroed()],
                second_moment: vec![BPrimitive::zeroed()],
            },
        };
        sink.save_checkpoint(&checkpoint).unwrap();
        let restored = Checkpoint::load(sink.checkpoint_path(42)).unwrap();
        assert_eq!(restored, checkpoint);
        std::fs::remove_dir_all(&root).ok();
    }
}
