//! Camera math and the raygen push-constant block.
//!
//! Matrices use Vulkan clip-space conventions: Y flipped in the projection,
//! depth range [0, 1], column-major storage (glam default). The manifest
//! describes the camera as a position plus a view direction.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

/// Camera state taken from the scene manifest.
#[derive(Debug, Clone, Copy)]
pub struct Camera {
    pub position: Vec3,
    pub view: Vec3,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 10.0),
            view: Vec3::new(0.0, 0.0, -1.0),
        }
    }
}

pub const FOV_Y_DEG: f32 = 45.0;
pub const NEAR: f32 = 0.1;
pub const FAR: f32 = 1000.0;

/// Per-frame camera block written into each frame slot's transient arena
/// and read by the ray-tracing stages.
///
/// 80 bytes: inverse view-projection (64) + eye position (12) + light count.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct CameraConstants {
    pub screen_to_world: Mat4,
    pub eye: [f32; 3],
    pub light_count: u32,
}

impl Camera {
    pub fn view_matrix(&self) -> Mat4 {
        look_at(self.position, self.position + self.view, Vec3::Y)
    }

    pub fn projection_matrix(&self, aspect: f32) -> Mat4 {
        perspective(FOV_Y_DEG.to_radians(), aspect, NEAR, FAR)
    }

    pub fn constants(&self, aspect: f32, light_count: u32) -> CameraConstants {
        let view_proj = self.projection_matrix(aspect) * self.view_matrix();
        CameraConstants {
            screen_to_world: view_proj.inverse(),
            eye: self.position.to_array(),
            light_count,
        }
    }
}

/// Perspective projection for Vulkan clip space (Y flipped, depth [0, 1]).
pub fn perspective(fov_y: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
    let f = 1.0 / (fov_y / 2.0).tan();
    Mat4::from_cols(
        Vec4::new(f / aspect, 0.0, 0.0, 0.0),
        Vec4::new(0.0, -f, 0.0, 0.0),
        Vec4::new(0.0, 0.0, far / (near - far), -1.0),
        Vec4::new(0.0, 0.0, (near * far) / (near - far), 0.0),
    )
}

/// Look-at view matrix (column-major).
pub fn look_at(eye: Vec3, target: Vec3, up: Vec3) -> Mat4 {
    let f = (target - eye).normalize();
    let s = f.cross(up).normalize();
    let u = s.cross(f);

    Mat4::from_cols(
        Vec4::new(s.x, u.x, -f.x, 0.0),
        Vec4::new(s.y, u.y, -f.y, 0.0),
        Vec4::new(s.z, u.z, -f.z, 0.0),
        Vec4::new(-s.dot(eye), -u.dot(eye), f.dot(eye), 1.0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_matrix_moves_eye_to_origin() {
        let camera = Camera {
            position: Vec3::new(1.0, 2.0, 3.0),
            view: Vec3::new(0.0, 0.0, -1.0),
        };
        let at_origin = camera.view_matrix() * camera.position.extend(1.0);
        assert!(at_origin.truncate().length() < 1e-5);
    }

    #[test]
    fn screen_to_world_inverts_view_projection() {
        let camera = Camera::default();
        let pc = camera.constants(16.0 / 9.0, 0);
        let view_proj = camera.projection_matrix(16.0 / 9.0) * camera.view_matrix();
        let roundtrip = pc.screen_to_world * view_proj;
        for (a, b) in roundtrip
            .to_cols_array()
            .iter()
            .zip(Mat4::IDENTITY.to_cols_array().iter())
        {
            assert!((a - b).abs() < 1e-4);
        }
    }
}
