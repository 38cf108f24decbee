//! Density sampling and surface extraction on CPU or GPU devices

pub mod dispatch;
pub mod tables;
pub mod noise;
pub mod density;
pub mod marching;
pub mod backend;
pub mod pool;
pub mod cpu;
pub mod gpu;
pub mod extractor;

pub use dispatch::{GridDims, THREAD_GROUP_SIZE, number_of_groups};
pub use noise::{NoiseSampler, PerlinSampler};
pub use backend::{BufferLayout, ComputeBackend, Ticket};
pub use pool::{DeviceBufferPool, DeviceBufferSet, PoolStats};
pub use cpu::CpuBackend;
pub use gpu::GpuBackend;
pub use extractor::{CompletedExtraction, DensityMeshExtractor, Extraction};
