use serde::{Deserialize, Serialize};

// Basic 3D vector type used for particle positions and velocities.
#[derive(Copy, Clone, Default, Debug, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    #[inline(always)]
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
    #[inline(always)]
    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }
    #[inline(always)]
    pub fn length_squared(self) -> f64 {
        self.x * self.x + self.y * self.y + self.z * self.z
    }
    #[inline(always)]
    pub fn length(self) -> f64 {
        self.length_squared().sqrt()
    }
}
