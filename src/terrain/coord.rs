//! Integer chunk coordinates on the horizontal grid

use std::fmt;

use glam::Vec3;

use crate::config::WorldSettings;

/// Integer coordinate identifying a chunk column in the world grid.
///
/// Chunks span a single vertical layer, so only X and Z are tracked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkCoord {
    pub x: i32,
    pub z: i32,
}

impl ChunkCoord {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Convert a world position to the coordinate of the chunk containing it
    pub fn from_world_pos(pos: Vec3, chunk_size: f32) -> Self {
        Self {
            x: (pos.x / chunk_size).floor() as i32,
            z: (pos.z / chunk_size).floor() as i32,
        }
    }

    /// World-space origin (minimum corner) of this chunk
    pub fn world_origin(&self, world: &WorldSettings) -> Vec3 {
        Vec3::new(
            self.x as f32 * world.chunk_size,
            world.ground_level,
            self.z as f32 * world.chunk_size,
        )
    }

    pub fn offset(&self, dx: i32, dz: i32) -> Self {
        Self::new(self.x + dx, self.z + dz)
    }

    /// Distance in chunks along the larger of the two axes
    pub fn chebyshev_distance(&self, other: &ChunkCoord) -> u32 {
        let dx = (self.x - other.x).unsigned_abs();
        let dz = (self.z - other.z).unsigned_abs();
        dx.max(dz)
    }
}

impl fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.x, self.z)
    }
}
