//! Interactive client interface.
//!
//! The session is polled once per iteration. A session without a connected
//! client turns every call into a no-op.

use glam::{Quat, Vec3};
use image::RgbImage;

use crate::control::ControlState;

/// Camera pose reported by the live client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientPose {
    /// Camera-to-world rotation.
    pub rotation: Quat,
    pub position: Vec3,
}

impl ClientPose {
    /// Quaternion given as `[w, x, y, z]`, the order viewer clients send.
    pub fn from_wxyz(wxyz: [f32; 4], position: [f32; 3]) -> Self {
        let [w, x, y, z] = wxyz;
        Self {
            rotation: Quat::from_xyzw(x, y, z, w),
            position: Vec3::from_array(position),
        }
    }
}

pub trait InteractiveSession {
    fn is_connected(&self) -> bool;

    /// Apply pending client changes to `control`. Never blocks.
    fn poll(&mut self, control: &mut ControlState);

    /// Latest client camera, if one is known.
    fn client_pose(&self) -> Option<ClientPose>;

    fn publish_frame(&mut self, frame: &RgbImage);

    /// Push the controller's view of the controls back to the client.
    fn publish_controls(&mut self, control: &ControlState);

    fn set_primitive_count(&mut self, count: usize);
}

/// Session used when the viewer is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSession;

impl InteractiveSession for NoSession {
    fn is_connected(&self) -> bool {
        false
    }

    fn poll(&mut self, _control: &mut ControlState) {}

    fn client_pose(&self) -> Option<ClientPose> {
        None
    }

    fn publish_frame(&mut self, _frame: &RgbImage) {}

    fn publish_controls(&mut self, _control: &ControlState) {}

    fn set_primitive_count(&mut self, _count: usize) {}
}
