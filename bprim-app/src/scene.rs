//! Scene loading from `transforms*.json` camera files.
//!
//! Camera matrices are camera-to-world with +Y up and -Z forward; they are
//! converted to the trainer's +Y down, +Z forward convention on load.

use bprim_data::{PlyError, Point, load_points_from_ply};
use bprim_train::backend::ScalarMap;
use bprim_train::{Scene, TrainError, Viewpoint};
use glam::{Mat3, Quat, Vec3};
use image::{Luma, Rgb, Rgb32FImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Random points used when the scene ships without a point cloud.
const RANDOM_POINTS: usize = 10_000;
const RANDOM_EXTENT: f32 = 1.3;

#[derive(Debug, Error)]
pub enum SceneError {
    #[error("No transforms_train.json or transforms.json in {0}")]
    MissingTransforms(PathBuf),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("PLY error: {0}")]
    Ply(#[from] PlyError),

    #[error(transparent)]
    Train(#[from] TrainError),
}

#[derive(Debug, Deserialize)]
struct TransformsFile {
    camera_angle_x: f32,
    #[serde(default)]
    camera_angle_y: Option<f32>,
    frames: Vec<FrameEntry>,
}

#[derive(Debug, Deserialize)]
struct FrameEntry {
    file_path: String,
    /// Row-major 4x4 camera-to-world matrix.
    transform_matrix: [[f32; 4]; 4],
}

/// Load training and test cameras plus the initialization point cloud.
#[tracing::instrument(skip_all, fields(path = %source.display()))]
pub fn load_scene(source: &Path, white_background: bool, seed: Option<u64>) -> Result<Scene, SceneError> {
    let background = if white_background { Vec3::ONE } else { Vec3::ZERO };
    let train_file = ["transforms_train.json", "transforms.json"]
        .iter()
        .map(|name| source.join(name))
        .find(|path| path.exists())
        .ok_or_else(|| SceneError::MissingTransforms(source.to_path_buf()))?;
    let train = read_cameras(source, &train_file, background, 0)?;

    let test_file = source.join("transforms_test.json");
    let test = if test_file.exists() {
        read_cameras(source, &test_file, background, train.len())?
    } else {
        Vec::new()
    };

    let ply = source.join("points3d.ply");
    let points = if ply.exists() {
        load_points_from_ply(&ply)?
    } else {
        warn!("No points3d.ply found, seeding {} random points", RANDOM_POINTS);
        random_points(RANDOM_POINTS, seed)
    };

    info!(
        "Loaded {} training and {} test cameras with {} points",
        train.len(),
        test.len(),
        points.len()
    );
    Ok(Scene::new(train, test, points)?)
}

fn read_cameras(
    root: &Path,
    file: &Path,
    background: Vec3,
    first_uid: usize,
) -> Result<Vec<Viewpoint>, SceneError> {
    let text = std::fs::read_to_string(file).map_err(|source| SceneError::Io {
        path: file.to_path_buf(),
        source,
    })?;
    let transforms: TransformsFile = serde_json::from_str(&text).map_err(|source| SceneError::Json {
        path: file.to_path_buf(),
        source,
    })?;

    transforms
        .frames
        .iter()
        .enumerate()
        .map(|(i, frame)| -> Result<Viewpoint, SceneError> {
            let mut path = root.join(&frame.file_path);
            if path.extension().is_none() {
                path.set_extension("png");
            }
            let (target, mask) = load_image(&path, background)?;
            let (rotation, position) = camera_pose(&frame.transform_matrix);
            let fov_x = transforms.camera_angle_x;
            let fov_y = transforms.camera_angle_y.unwrap_or_else(|| {
                let aspect = target.height() as f32 / target.width().max(1) as f32;
                2.0 * ((fov_x * 0.5).tan() * aspect).atan()
            });
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let mut view = Viewpoint::new(first_uid + i, name, rotation, position, fov_x, fov_y, target);
            view.valid_mask = mask.map(Arc::new);
            Ok(view)
        })
        .collect()
}

/// Camera-to-world rotation and center in the +Y down, +Z forward convention.
fn camera_pose(m: &[[f32; 4]; 4]) -> (Quat, Vec3) {
    let column = |c: usize| Vec3::new(m[0][c], m[1][c], m[2][c]);
    let rotation = Mat3::from_cols(column(0), -column(1), -column(2));
    (Quat::from_mat3(&rotation).normalize(), column(3))
}

/// Decode an image, compositing alpha over `background`. Pixels with zero
/// alpha are marked invalid.
fn load_image(path: &Path, background: Vec3) -> Result<(Rgb32FImage, Option<ScalarMap>), SceneError> {
    let decoded = image::open(path).map_err(|source| SceneError::Image {
        path: path.to_path_buf(),
        source,
    })?;
    let has_alpha = decoded.color().has_alpha();
    let rgba = decoded.to_rgba32f();
    let (w, h) = rgba.dimensions();
    let image = Rgb32FImage::from_fn(w, h, |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let c = Vec3::new(r, g, b) * a + background * (1.0 - a);
        Rgb(c.to_array())
    });
    let mask = has_alpha.then(|| ScalarMap::from_fn(w, h, |x, y| Luma([rgba.get_pixel(x, y).0[3]])));
    Ok((image, mask))
}

fn random_points(count: usize, seed: Option<u64>) -> Vec<Point> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    (0..count)
        .map(|_| {
            let position = Vec3::new(rng.r#gen(), rng.r#gen(), rng.r#gen()) * (2.0 * RANDOM_EXTENT) - RANDOM_EXTENT;
            let color = Vec3::new(rng.r#gen(), rng.r#gen(), rng.r#gen());
            Point::new(position, color)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camera_pose_flips_to_forward_z() {
        // Camera at +5 Z looking back at the origin (-Z forward in the file).
        let m = [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 5.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        let (rotation, position) = camera_pose(&m);
        assert_eq!(position, Vec3::new(0.0, 0.0, 5.0));
        let forward = rotation * Vec3::Z;
        assert!((forward - Vec3::NEG_Z).length() < 1e-5);
        let down = rotation * Vec3::Y;
        assert!((down - Vec3::NEG_Y).length() < 1e-5);
    }

    #[test]
    fn test_load_scene_from_directory() {
        let dir = std::env::temp_dir().join(format!("bprim-scene-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        image::RgbaImage::from_pixel(4, 2, image::Rgba([255, 0, 0, 255]))
            .save(dir.join("r_0.png"))
            .unwrap();
        let json = r#"{ "camera_angle_x": 0.8, "frames": [
            { "file_path": "./r_0", "transform_matrix": [[1,0,0,0],[0,1,0,0],[0,0,1,4],[0,0,0,1]] } ] }"#;
        std::fs::write(dir.join("transforms_train.json"), json).unwrap();

        let scene = load_scene(&dir, false, Some(1)).unwrap();
        assert_eq!(scene.train.len(), 1);
        assert!(scene.test.is_empty());
        assert_eq!(scene.points.len(), RANDOM_POINTS);
        let view = &scene.train[0];
        assert_eq!((view.width(), view.height()), (4, 2));
        assert_eq!(view.target.get_pixel(0, 0).0, [1.0, 0.0, 0.0]);
        assert!(view.fov_y < view.fov_x);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_transforms() {
        let dir = std::env::temp_dir().join(format!("bprim-empty-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        assert!(matches!(load_scene(&dir, false, None), Err(SceneError::MissingTransforms(_))));
        std::fs::remove_dir_all(&dir).ok();
    }
}
