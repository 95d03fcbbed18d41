//! Checkpoint file format.
//!
//! Layout (header fields little-endian, arrays in host byte order, which is
//! little-endian on every supported target):
//!
//! | field               | type          |
//! |---------------------|---------------|
//! | magic `BPCK`        | `[u8; 4]`     |
//! | format version      | `u32`         |
//! | iteration           | `u32`         |
//! | active SH degree    | `u32`         |
//! | mode index          | `u32`         |
//! | primitive count `n` | `u64`         |
//! | optimizer step      | `u64`         |
//! | parameters          | `n` records   |
//! | first moments       | `n` records   |
//! | second moments      | `n` records   |
//!
//! Version 1 files have no mode index and read back as mode 0.

use crate::types::BPrimitive;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::{debug, info};

const MAGIC: [u8; 4] = *b"BPCK";
const VERSION: u32 = 2;
const HEADER_LEN: u64 = 4 + 4 + 4 + 4 + 4 + 8 + 8;
const HEADER_LEN_V1: u64 = HEADER_LEN - 4;
const RECORD_LEN: u64 = std::mem::size_of::<BPrimitive>() as u64;

/// Errors raised while reading or writing checkpoints.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Not a checkpoint file (bad magic)")]
    BadMagic,
    #[error("Unsupported checkpoint version {0}")]
    UnsupportedVersion(u32),
    #[error("Checkpoint size mismatch: expected {expected} bytes, found {found}")]
    SizeMismatch { expected: u64, found: u64 },
    #[error("Optimizer state has {moments} records for {primitives} primitives")]
    OptimizerShape { primitives: usize, moments: usize },
}

/// Adam moments for every primitive plus the global step counter.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OptimizerSnapshot {
    pub step: u64,
    pub first_moment: Vec<BPrimitive>,
    pub second_moment: Vec<BPrimitive>,
}

/// Snapshot of the trainable population at one iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub iteration: u32,
    pub active_sh_degree: u32,
    /// Index of the representation mode active when the checkpoint was taken.
    pub mode: u32,
    pub primitives: Vec<BPrimitive>,
    pub optimizer: OptimizerSnapshot,
}

impl Checkpoint {
    /// Check that the optimizer state matches the parameter shapes.
    pub fn validate(&self) -> Result<(), CheckpointError> {
        let primitives = self.primitives.len();
        for moments in [&self.optimizer.first_moment, &self.optimizer.second_moment] {
            if moments.len() != primitives {
                return Err(CheckpointError::OptimizerShape {
                    primitives,
                    moments: moments.len(),
                });
            }
        }
        Ok(())
    }

    /// Size in bytes of the encoded checkpoint.
    pub fn encoded_len(&self) -> u64 {
        HEADER_LEN + 3 * RECORD_LEN * self.primitives.len() as u64
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<(), CheckpointError> {
        self.validate()?;
        out.write_all(&MAGIC)?;
        out.write_all(&VERSION.to_le_bytes())?;
        out.write_all(&self.iteration.to_le_bytes())?;
        out.write_all(&self.active_sh_degree.to_le_bytes())?;
        out.write_all(&self.mode.to_le_bytes())?;
        out.write_all(&(self.primitives.len() as u64).to_le_bytes())?;
        out.write_all(&self.optimizer.step.to_le_bytes())?;
        out.write_all(bytemuck::cast_slice(&self.primitives))?;
        out.write_all(bytemuck::cast_slice(&self.optimizer.first_moment))?;
        out.write_all(bytemuck::cast_slice(&self.optimizer.second_moment))?;
        Ok(())
    }

    /// Decode a checkpoint. `available` is the total encoded size when known,
    /// and is checked against the header before any record is allocated.
    pub fn read_from<R: Read>(input: &mut R, available: Option<u64>) -> Result<Self, CheckpointError> {
        let mut magic = [0u8; 4];
        input.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(CheckpointError::BadMagic);
        }
        let version = read_u32(input)?;
        let header_len = match version {
            1 => HEADER_LEN_V1,
            VERSION => HEADER_LEN,
            other => return Err(CheckpointError::UnsupportedVersion(other)),
        };
        let iteration = read_u32(input)?;
        let active_sh_degree = read_u32(input)?;
        let mode = if version == 1 { 0 } else { read_u32(input)? };
        let count = read_u64(input)?;
        let step = read_u64(input)?;

        let expected = count
            .checked_mul(3 * RECORD_LEN)
            .and_then(|body| body.checked_add(header_len))
            .ok_or(CheckpointError::SizeMismatch {
                expected: u64::MAX,
                found: available.unwrap_or(0),
            })?;
        if let Some(found) = available {
            if found != expected {
                return Err(CheckpointError::SizeMismatch { expected, found });
            }
        }

        let count = count as usize;
        let primitives = read_records(input, count)?;
        let first_moment = read_records(input, count)?;
        let second_moment = read_records(input, count)?;

        Ok(Self {
            iteration,
            active_sh_degree,
            mode,
            primitives,
            optimizer: OptimizerSnapshot {
                step,
                first_moment,
                second_moment,
            },
        })
    }

    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display(), iteration = self.iteration))]
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CheckpointError> {
        let file = File::create(path.as_ref())?;
        let mut out = BufWriter::new(file);
        self.write_to(&mut out)?;
        out.flush()?;
        info!("Saved checkpoint with {} primitives", self.primitives.len());
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        let mut input = BufReader::new(file);
        let checkpoint = Self::read_from(&mut input, Some(len))?;
        debug!(
            "Loaded checkpoint at iteration {} with {} primitives",
            checkpoint.iteration,
            checkpoint.primitives.len()
        );
        Ok(checkpoint)
    }
}

fn read_u32<R: Read>(input: &mut R) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(input: &mut R) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_records<R: Read>(input: &mut R, count: usize) -> std::io::Result<Vec<BPrimitive>> {
    let mut records: Vec<BPrimitive> = bytemuck::zeroed_vec(count);
    input.read_exact(bytemuck::cast_slice_mut(&mut records))?;
    Ok(records)
}
