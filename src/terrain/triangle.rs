//! Triangle records produced by surface extraction

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// One extracted triangle: three world-space vertices.
///
/// Laid out as nine packed floats so that GPU readback can be cast directly.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Triangle {
    pub a: Vec3,
    pub b: Vec3,
    pub c: Vec3,
}

impl Triangle {
    pub const SIZE: usize = std::mem::size_of::<Triangle>();

    pub fn new(a: Vec3, b: Vec3, c: Vec3) -> Self {
        Self { a, b, c }
    }

    pub fn points(&self) -> [Vec3; 3] {
        [self.a, self.b, self.c]
    }

    /// Unnormalized face normal following the a -> b -> c winding
    pub fn face_normal(&self) -> Vec3 {
        (self.b - self.a).cross(self.c - self.a)
    }
}
