//! Free-fly camera
//!
//! - WASD: Move forward/backward/left/right
//! - Space/Alt: Move up/down
//! - Shift: Sprint
//! - Mouse: Look around (while `mouse_look_active`)

use glam::{Mat4, Vec2, Vec3};

/// Input state collected from the window between frames
#[derive(Debug, Clone, Default)]
pub struct CameraInput {
    pub forward: bool,
    pub backward: bool,
    pub left: bool,
    pub right: bool,
    pub up: bool,
    pub down: bool,

    /// Sprint modifier (shift)
    pub sprint: bool,

    /// Mouse delta since last frame (in pixels)
    pub mouse_delta: Vec2,

    /// Whether mouse look is active (right mouse button held)
    pub mouse_look_active: bool,
}

impl CameraInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset per-frame deltas (call after update)
    pub fn reset_deltas(&mut self) {
        self.mouse_delta = Vec2::ZERO;
    }
}

/// Camera that supplies the per-frame view matrix
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub up: Vec3,
    /// Horizontal rotation in radians
    pub yaw: f32,
    /// Vertical rotation in radians, positive looks up
    pub pitch: f32,
    /// Base movement speed in units per second
    pub move_speed: f32,
    pub sprint_multiplier: f32,
    /// Radians per pixel
    pub mouse_sensitivity: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 2.0, 8.0),
            up: Vec3::Y,
            yaw: -std::f32::consts::FRAC_PI_2,
            pitch: 0.0,
            move_speed: 5.0,
            sprint_multiplier: 3.0,
            mouse_sensitivity: 0.003,
        }
    }
}

impl Camera {
    pub fn new(position: Vec3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    pub fn with_speed(mut self, speed: f32) -> Self {
        self.move_speed = speed;
        self
    }

    /// Unit view direction derived from yaw and pitch
    pub fn front(&self) -> Vec3 {
        Vec3::new(
            self.yaw.cos() * self.pitch.cos(),
            self.pitch.sin(),
            self.yaw.sin() * self.pitch.cos(),
        )
        .normalize()
    }

    /// Right direction, kept on the XZ plane
    pub fn right(&self) -> Vec3 {
        self.front().cross(self.up).normalize()
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.position + self.front(), self.up)
    }

    /// Apply one frame of input
    pub fn update(&mut self, input: &CameraInput, dt: f32) {
        if input.mouse_look_active && input.mouse_delta != Vec2::ZERO {
            self.yaw += input.mouse_delta.x * self.mouse_sensitivity;
            self.pitch -= input.mouse_delta.y * self.mouse_sensitivity;

            // Clamp pitch to avoid flipping over the poles
            let max_pitch = std::f32::consts::FRAC_PI_2 - 0.01;
            self.pitch = self.pitch.clamp(-max_pitch, max_pitch);
            self.yaw %= std::f32::consts::TAU;
        }

        let front = self.front();
        let right = self.right();
        let mut velocity = Vec3::ZERO;

        if input.forward {
            velocity += front;
        }
        if input.backward {
            velocity -= front;
        }
        if input.right {
            velocity += right;
        }
        if input.left {
            velocity -= right;
        }
        if input.up {
            velocity += self.up;
        }
        if input.down {
            velocity -= self.up;
        }

        // Normalize if moving diagonally
        if velocity.length_squared() > 0.0 {
            velocity = velocity.normalize();
        }

        let speed = if input.sprint {
            self.move_speed * self.sprint_multiplier
        } else {
            self.move_speed
        };

        self.position += velocity * speed * dt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_looks_down_negative_z() {
        let camera = Camera::default();
        assert!((camera.front() - Vec3::NEG_Z).length() < 1e-5);
    }

    #[test]
    fn test_forward_movement() {
        let mut camera = Camera::new(Vec3::ZERO).with_speed(2.0);
        let input = CameraInput {
            forward: true,
            ..CameraInput::new()
        };
        camera.update(&input, 0.5);
        assert!((camera.position - Vec3::new(0.0, 0.0, -1.0)).length() < 1e-5);
    }

    #[test]
    fn test_sprint_and_diagonal() {
        let mut camera = Camera::new(Vec3::ZERO).with_speed(1.0);
        let input = CameraInput {
            forward: true,
            right: true,
            sprint: true,
            ..CameraInput::new()
        };
        camera.update(&input, 1.0);
        assert!((camera.position.length() - camera.sprint_multiplier).abs() < 1e-5);
    }

    #[test]
    fn test_pitch_is_clamped() {
        let mut camera = Camera::default();
        let input = CameraInput {
            mouse_look_active: true,
            mouse_delta: Vec2::new(0.0, -100_000.0),
            ..CameraInput::new()
        };
        camera.update(&input, 0.016);
        assert!(camera.pitch < std::f32::consts::FRAC_PI_2);
        assert!(camera.front().y > 0.99);
    }

    #[test]
    fn test_view_matrix_maps_position_to_origin() {
        let camera = Camera::new(Vec3::new(3.0, 4.0, 5.0));
        let eye = camera.view_matrix().transform_point3(camera.position);
        assert!(eye.length() < 1e-5);
    }
}
