//! Workgroup and grid sizing for the extraction kernels

use crate::config::WorldSettings;
use crate::core::{Error, Result};

/// Threads per workgroup along each axis
pub const THREAD_GROUP_SIZE: u32 = 8;

/// Maximum triangles a single marching cube can emit
pub const MAX_TRIANGLES_PER_CUBE: u32 = 5;

/// Number of workgroups needed to cover `threads` invocations
pub fn number_of_groups(threads: i64, group_size: u32) -> Result<u32> {
    if threads <= 0 {
        return Err(Error::Compute(format!("thread count must be positive, got {}", threads)));
    }
    if group_size == 0 {
        return Err(Error::Compute("group size must be positive".into()));
    }
    let groups = (threads as u64).div_ceil(group_size as u64);
    u32::try_from(groups).map_err(|_| Error::Compute(format!("{} workgroups exceed device limits", groups)))
}

/// Cube and sample counts of one chunk's grid
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GridDims {
    pub cubes_xz: u32,
    pub cubes_y: u32,
}

impl GridDims {
    pub fn new(cubes_xz: u32, cubes_y: u32) -> Self {
        Self { cubes_xz, cubes_y }
    }

    pub fn from_world(world: &WorldSettings) -> Self {
        Self::new(world.num_cubes_xz, world.num_cubes_y)
    }

    pub fn points_xz(&self) -> u32 {
        self.cubes_xz + 1
    }

    pub fn points_y(&self) -> u32 {
        self.cubes_y + 1
    }

    pub fn num_points(&self) -> usize {
        let xz = self.points_xz() as usize;
        xz * xz * self.points_y() as usize
    }

    pub fn num_cubes(&self) -> usize {
        let xz = self.cubes_xz as usize;
        xz * xz * self.cubes_y as usize
    }

    /// Capacity of the triangle append buffer
    pub fn max_triangles(&self) -> usize {
        self.num_cubes() * MAX_TRIANGLES_PER_CUBE as usize
    }

    /// Linear index of a sample; x varies fastest, then y, then z
    pub fn point_index(&self, x: u32, y: u32, z: u32) -> usize {
        let px = self.points_xz() as usize;
        let py = self.points_y() as usize;
        x as usize + px * (y as usize + py * z as usize)
    }

    /// Workgroups covering every sample point, as (x, y, z)
    pub fn point_groups(&self) -> Result<[u32; 3]> {
        Ok([
            number_of_groups(self.points_xz() as i64, THREAD_GROUP_SIZE)?,
            number_of_groups(self.points_y() as i64, THREAD_GROUP_SIZE)?,
            number_of_groups(self.points_xz() as i64, THREAD_GROUP_SIZE)?,
        ])
    }

    /// Workgroups covering every cube, as (x, y, z)
    pub fn cube_groups(&self) -> Result<[u32; 3]> {
        Ok([
            number_of_groups(self.cubes_xz as i64, THREAD_GROUP_SIZE)?,
            number_of_groups(self.cubes_y as i64, THREAD_GROUP_SIZE)?,
            number_of_groups(self.cubes_xz as i64, THREAD_GROUP_SIZE)?,
        ])
    }
}
