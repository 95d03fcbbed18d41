//! Cameras, scenes and the training viewpoint sampler.

use bprim_data::Point;
use glam::{Quat, Vec2, Vec3};
use image::Rgb32FImage;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::sync::Arc;

use crate::backend::ScalarMap;
use crate::error::TrainError;
use crate::session::ClientPose;

const NEAR_PLANE: f32 = 0.01;

/// A calibrated camera with its ground-truth image.
///
/// Camera space looks down +Z with +X right and +Y down.
#[derive(Debug, Clone)]
pub struct Viewpoint {
    pub uid: usize,
    pub name: String,
    /// Camera-to-world rotation.
    pub rotation: Quat,
    /// Camera center in world space.
    pub position: Vec3,
    pub fov_x: f32,
    pub fov_y: f32,
    pub target: Arc<Rgb32FImage>,
    /// Pixels outside the mask (value 0) are ignored by the edge statistics.
    pub valid_mask: Option<Arc<ScalarMap>>,
}

impl Viewpoint {
    pub fn new(
        uid: usize,
        name: impl Into<String>,
        rotation: Quat,
        position: Vec3,
        fov_x: f32,
        fov_y: f32,
        target: Rgb32FImage,
    ) -> Self {
        Self {
            uid,
            name: name.into(),
            rotation,
            position,
            fov_x,
            fov_y,
            target: Arc::new(target),
            valid_mask: None,
        }
    }

    /// Ephemeral viewpoint for the interactive client. Intrinsics and the
    /// ground-truth image come from `template`.
    pub fn from_client(pose: &ClientPose, template: &Viewpoint) -> Self {
        Self {
            uid: usize::MAX,
            name: "client".to_string(),
            rotation: pose.rotation.normalize(),
            position: pose.position,
            ..template.clone()
        }
    }

    pub fn width(&self) -> u32 {
        self.target.width()
    }

    pub fn height(&self) -> u32 {
        self.target.height()
    }

    /// Focal lengths in pixels.
    pub fn focal(&self) -> Vec2 {
        Vec2::new(
            self.width() as f32 / (2.0 * (self.fov_x * 0.5).tan()),
            self.height() as f32 / (2.0 * (self.fov_y * 0.5).tan()),
        )
    }

    pub fn world_to_camera(&self, point: Vec3) -> Vec3 {
        self.rotation.inverse() * (point - self.position)
    }

    /// Pixel coordinates and depth of a world point in front of the camera.
    pub fn project(&self, point: Vec3) -> Option<(Vec2, f32)> {
        let cam = self.world_to_camera(point);
        if cam.z <= NEAR_PLANE {
            return None;
        }
        let focal = self.focal();
        let center = Vec2::new(self.width() as f32, self.height() as f32) * 0.5;
        Some((Vec2::new(cam.x, cam.y) / cam.z * focal + center, cam.z))
    }

    /// Whether pixel `(x, y)` counts for the edge statistics.
    pub fn is_valid(&self, x: u32, y: u32) -> bool {
        match &self.valid_mask {
            Some(mask) => mask.get_pixel_checked(x, y).is_some_and(|p| p.0[0] > 0.0),
            None => true,
        }
    }
}

/// Training and held-out viewpoints plus the initialization point cloud.
#[derive(Debug, Clone)]
pub struct Scene {
    pub train: Vec<Viewpoint>,
    pub test: Vec<Viewpoint>,
    pub points: Vec<Point>,
    /// Radius enclosing all training camera centers, padded by 10%.
    pub extent: f32,
}

impl Scene {
    pub fn new(train: Vec<Viewpoint>, test: Vec<Viewpoint>, points: Vec<Point>) -> Result<Self, TrainError> {
        if train.is_empty() {
            return Err(TrainError::NoViewpoints);
        }
        let center = train.iter().map(|v| v.position).sum::<Vec3>() / train.len() as f32;
        let radius = train
            .iter()
            .map(|v| v.position.distance(center))
            .fold(0.0f32, f32::max);
        Ok(Self {
            train,
            test,
            points,
            extent: (radius * 1.1).max(1e-6),
        })
    }
}

/// Visits every training viewpoint once per shuffled pass.
#[derive(Debug, Clone)]
pub struct ViewpointSampler {
    count: usize,
    pending: Vec<usize>,
    rng: StdRng,
}

impl ViewpointSampler {
    pub fn new(count: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            count,
            pending: Vec::new(),
            rng,
        }
    }

    /// Index of the next viewpoint, or `None` if there are none.
    pub fn next_index(&mut self) -> Option<usize> {
        if self.count == 0 {
            return None;
        }
        if self.pending.is_empty() {
            self.pending = (0..self.count).collect();
            self.pending.shuffle(&mut self.rng);
        }
        self.pending.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn view(position: Vec3) -> Viewpoint {
        Viewpoint::new(
            0,
            "v",
            Quat::IDENTITY,
            position,
            std::f32::consts::FRAC_PI_2,
            std::f32::consts::FRAC_PI_2,
            Rgb32FImage::new(8, 8),
        )
    }

    #[test]
    fn test_sampler_visits_each_once_per_pass() {
        let mut sampler = ViewpointSampler::new(5, Some(7));
        for _ in 0..3 {
            let pass: HashSet<usize> = (0..5).filter_map(|_| sampler.next_index()).collect();
            assert_eq!(pass, (0..5).collect());
        }
        assert_eq!(ViewpointSampler::new(0, Some(1)).next_index(), None);
    }

    #[test]
    fn test_projection_center_and_behind() {
        let v = view(Vec3::ZERO);
        let (pixel, depth) = v.project(Vec3::new(0.0, 0.0, 2.0)).unwrap();
        assert_eq!(pixel, Vec2::new(4.0, 4.0));
        assert_eq!(depth, 2.0);
        // 90 degree fov: focal is half the width.
        let (pixel, _) = v.project(Vec3::new(1.0, 0.0, 1.0)).unwrap();
        assert!((pixel.x - 8.0).abs() < 1e-4);
        assert!(v.project(Vec3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn test_scene_extent_and_empty() {
        let scene = Scene::new(vec![view(Vec3::X), view(-Vec3::X)], vec![], vec![]).unwrap();
        assert!((scene.extent - 1.1).abs() < 1e-6);
        assert!(matches!(Scene::new(vec![], vec![], vec![]), Err(TrainError::NoViewpoints)));
    }

    #[test]
    fn test_client_view_uses_template_intrinsics() {
        let template = view(Vec3::ZERO);
        let pose = ClientPose::from_wxyz([1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0]);
        let client = Viewpoint::from_client(&pose, &template);
        assert_eq!(client.position, Vec3::Y);
        assert_eq!(client.width(), 8);
        assert_eq!(client.fov_x, template.fov_x);
    }
}
