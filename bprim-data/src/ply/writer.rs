//! ASCII PLY export of baseline splats, using the conventional 3DGS property names.

use super::PlyError;
use crate::types::Splat;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

/// Write splats as an ASCII PLY point cloud.
#[tracing::instrument(skip_all, fields(path = %path.as_ref().display(), count = splats.len()))]
pub fn write_splats_ply(path: impl AsRef<Path>, splats: &[Splat]) -> Result<(), PlyError> {
    let file = File::create(path.as_ref())?;
    let mut out = BufWriter::new(file);
    write_splats(&mut out, splats)?;
    out.flush()?;
    info!("Wrote {} splats", splats.len());
    Ok(())
}

fn write_splats<W: Write>(out: &mut W, splats: &[Splat]) -> std::io::Result<()> {
    writeln!(out, "ply")?;
    writeln!(out, "format ascii 1.0")?;
    writeln!(out, "element vertex {}", splats.len())?;
    for name in ["x", "y", "z", "f_dc_0", "f_dc_1", "f_dc_2", "opacity"] {
        writeln!(out, "property float {name}")?;
    }
    for i in 0..3 {
        writeln!(out, "property float scale_{i}")?;
    }
    for i in 0..4 {
        writeln!(out, "property float rot_{i}")?;
    }
    writeln!(out, "end_header")?;

    for s in splats {
        let [x, y, z] = s.position;
        let [r, g, b] = s.color;
        let [sx, sy, sz] = s.scale;
        // Stored as (x, y, z, w); 3DGS files use (w, x, y, z).
        let [qx, qy, qz, qw] = s.rotation;
        writeln!(
            out,
            "{x} {y} {z} {r} {g} {b} {} {sx} {sy} {sz} {qw} {qx} {qy} {qz}",
            s.opacity
        )?;
    }
    Ok(())
}
