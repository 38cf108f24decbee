//! Device abstraction shared by the CPU and GPU extraction paths

use glam::Vec3;

use crate::compute::density::DensityParams;
use crate::compute::pool::DeviceBufferSet;
use crate::compute::GridDims;
use crate::config::MAX_OCTAVES;
use crate::core::Result;
use crate::terrain::Triangle;

/// Element counts of one buffer set
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferLayout {
    /// Density samples
    pub num_points: usize,
    /// Triangle append buffer capacity
    pub max_triangles: usize,
    /// Noise offset slots
    pub max_octaves: usize,
}

impl BufferLayout {
    pub fn for_grid(grid: GridDims) -> Self {
        Self {
            num_points: grid.num_points(),
            max_triangles: grid.max_triangles(),
            max_octaves: MAX_OCTAVES as usize,
        }
    }

    pub fn density_bytes(&self) -> u64 {
        (self.num_points * std::mem::size_of::<f32>()) as u64
    }

    pub fn triangle_bytes(&self) -> u64 {
        (self.max_triangles * Triangle::SIZE) as u64
    }

    /// Offsets are stored as padded vec4s
    pub fn offset_bytes(&self) -> u64 {
        (self.max_octaves * 4 * std::mem::size_of::<f32>()) as u64
    }
}

/// Identifies one in-flight extraction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(pub u64);

/// Everything a device needs to extract one chunk
#[derive(Clone, Debug)]
pub struct ExtractionJob {
    pub ticket: Ticket,
    pub grid: GridDims,
    pub params: DensityParams,
    pub offsets: Vec<Vec3>,
}

/// A finished dispatch handing its buffer set back
pub struct Readback<S> {
    pub ticket: Ticket,
    pub result: Result<Vec<Triangle>>,
    pub buffers: DeviceBufferSet<S>,
}

/// A compute device able to run the density and extraction stages.
///
/// `dispatch` never blocks. Every dispatched job produces exactly one
/// [`Readback`] from a later `poll`, including jobs that failed.
pub trait ComputeBackend {
    /// Device-side storage of one buffer set
    type Storage: Send + 'static;

    fn name(&self) -> &'static str;

    fn allocate(&self, layout: &BufferLayout) -> Result<Self::Storage>;

    fn dispatch(&mut self, job: ExtractionJob, buffers: DeviceBufferSet<Self::Storage>);

    /// Collect finished dispatches without blocking
    fn poll(&mut self) -> Result<Vec<Readback<Self::Storage>>>;

    fn in_flight(&self) -> usize;
}
