//! PLY file loading functions

use crate::types::Point;
use glam::Vec3;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, info, warn};

/// Errors that can occur while reading or writing PLY files.
#[derive(Debug, thiserror::Error)]
pub enum PlyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PLY parsing error: {0}")]
    Parse(String),
    #[error("Missing '{property}' at vertex {index}")]
    MissingProperty { property: &'static str, index: usize },
}

// PLY file structure; faces are ignored, only the vertex element is read.
#[derive(Deserialize, Debug)]
struct PlyFile {
    #[serde(rename = "vertex")]
    vertex: Vec<HashMap<String, JsonValue>>,
}

fn get_f32(prop: Option<&JsonValue>) -> Option<f32> {
    prop.and_then(|v| match v {
        JsonValue::Number(n) => n.as_f64().map(|f| f as f32),
        _ => None,
    })
}

fn get_u8(prop: Option<&JsonValue>) -> Option<u8> {
    prop.and_then(|v| match v {
        JsonValue::Number(n) => n
            .as_u64()
            .map(|u| u as u8)
            .or_else(|| n.as_i64().map(|i| i as u8)),
        _ => None,
    })
}

/// Load a colored point cloud (e.g. structure-from-motion points) from a PLY file.
///
/// Colors are read from `red/green/blue` or `r/g/b` byte properties and default
/// to light gray when absent.
#[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
pub fn load_points_from_ply(path: impl AsRef<Path>) -> Result<Vec<Point>, PlyError> {
    let path = path.as_ref();
    debug!("Loading PLY points from: {}", path.display());
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let ply_data: PlyFile = serde_ply::from_reader(reader).map_err(|e| {
        warn!("Failed to parse PLY file: {}", e);
        PlyError::Parse(e.to_string())
    })?;

    let mut points = Vec::with_capacity(ply_data.vertex.len());

    for (index, vertex) in ply_data.vertex.iter().enumerate() {
        let coord = |property: &'static str| {
            get_f32(vertex.get(property)).ok_or(PlyError::MissingProperty { property, index })
        };
        let position = Vec3::new(coord("x")?, coord("y")?, coord("z")?);

        let color = if let (Some(r), Some(g), Some(b)) = (
            get_u8(vertex.get("red")),
            get_u8(vertex.get("green")),
            get_u8(vertex.get("blue")),
        ) {
            Vec3::new(r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0)
        } else if let (Some(r), Some(g), Some(b)) = (
            get_u8(vertex.get("r")),
            get_u8(vertex.get("g")),
            get_u8(vertex.get("b")),
        ) {
            Vec3::new(r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0)
        } else {
            Vec3::splat(0.8)
        };

        points.push(Point::new(position, color));
    }

    info!("Loaded {} points from PLY file", points.len());
    Ok(points)
}
