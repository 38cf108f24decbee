//! Scalar noise sources for the CPU density kernel

use glam::Vec3;
use noise::{NoiseFn, Perlin};

/// Smooth 3D noise in roughly [-1, 1]
pub trait NoiseSampler: Send + Sync {
    fn sample(&self, p: Vec3) -> f32;
}

/// Gradient noise backed by the `noise` crate
pub struct PerlinSampler {
    perlin: Perlin,
}

impl PerlinSampler {
    pub fn new(seed: u32) -> Self {
        Self { perlin: Perlin::new(seed) }
    }
}

impl NoiseSampler for PerlinSampler {
    fn sample(&self, p: Vec3) -> f32 {
        self.perlin.get([p.x as f64, p.y as f64, p.z as f64]) as f32
    }
}
