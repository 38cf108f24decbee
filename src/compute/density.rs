//! Layered density field evaluated at every grid sample
//!
//! The density is a ridged fBm shaped by vertical bias terms. Heights are
//! normalized to the chunk (`h = sample_y / cubes_y`), so the ceiling and floor
//! settings are fractions of the chunk height.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::compute::GridDims;
use crate::compute::noise::NoiseSampler;
use crate::config::{MAX_OCTAVES, NoiseSettings, WorldSettings};

/// Per-dispatch kernel parameters, uploaded verbatim as a uniform block
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct DensityParams {
    pub origin_x: f32,
    pub origin_y: f32,
    pub origin_z: f32,
    pub cube_size: f32,

    pub space_offset_x: f32,
    pub space_offset_y: f32,
    pub space_offset_z: f32,
    pub num_octaves: u32,

    /// Already divided by 100
    pub frequency: f32,
    pub lacunarity: f32,
    pub amplitude: f32,
    pub persistence: f32,

    pub offset_y: f32,
    pub y_weight: f32,
    pub noise_weight: f32,
    pub v_weight: f32,

    pub ceiling_y: f32,
    pub ceiling_weight: f32,
    pub hard_ceiling_y: f32,
    pub hard_ceiling_weight: f32,

    pub floor_y: f32,
    pub floor_weight: f32,
    pub hard_floor_y: f32,
    pub hard_floor_weight: f32,

    /// Already divided by 1000
    pub warp_frequency: f32,
    pub warp_amplitude: f32,
    pub terrace_period: f32,
    pub terrace_strength: f32,

    pub points_xz: u32,
    pub points_y: u32,
    pub cubes_y: u32,
    pub threshold: f32,
}

impl DensityParams {
    pub const SIZE: usize = std::mem::size_of::<DensityParams>();

    pub fn new(origin: Vec3, world: &WorldSettings, noise: &NoiseSettings) -> Self {
        let grid = GridDims::from_world(world);
        Self {
            origin_x: origin.x,
            origin_y: origin.y,
            origin_z: origin.z,
            cube_size: world.cube_size(),
            space_offset_x: noise.space_offset.x,
            space_offset_y: noise.space_offset.y,
            space_offset_z: noise.space_offset.z,
            num_octaves: noise.num_octaves.min(MAX_OCTAVES),
            frequency: noise.frequency / 100.0,
            lacunarity: noise.lacunarity,
            amplitude: noise.amplitude,
            persistence: noise.persistence,
            offset_y: noise.offset_y,
            y_weight: noise.y_weight,
            noise_weight: noise.noise_weight,
            v_weight: noise.v_weight,
            ceiling_y: noise.ceiling_y,
            ceiling_weight: noise.ceiling_weight,
            hard_ceiling_y: noise.hard_ceiling_y,
            hard_ceiling_weight: noise.hard_ceiling_weight,
            floor_y: noise.floor_y,
            floor_weight: noise.floor_weight,
            hard_floor_y: noise.hard_floor_y,
            hard_floor_weight: noise.hard_floor_weight,
            warp_frequency: noise.warp_frequency / 1000.0,
            warp_amplitude: noise.warp_amplitude,
            terrace_period: noise.terracing.x,
            terrace_strength: noise.terracing.y,
            points_xz: grid.points_xz(),
            points_y: grid.points_y(),
            cubes_y: grid.cubes_y,
            threshold: world.threshold,
        }
    }

    pub fn origin(&self) -> Vec3 {
        Vec3::new(self.origin_x, self.origin_y, self.origin_z)
    }

    pub fn space_offset(&self) -> Vec3 {
        Vec3::new(self.space_offset_x, self.space_offset_y, self.space_offset_z)
    }

    /// World position of a grid sample
    pub fn sample_position(&self, x: u32, y: u32, z: u32) -> Vec3 {
        self.origin() + Vec3::new(x as f32, y as f32, z as f32) * self.cube_size
    }
}

/// Minimal PCG-style generator for reproducible octave offsets
struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    fn new(seed: u64) -> Self {
        Self { state: seed.wrapping_add(1) }
    }

    fn next_u32(&mut self) -> u32 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let mut h = (self.state >> 32) as u32;
        h = h.wrapping_mul(0x45d9f3b);
        h ^= h >> 16;
        h = h.wrapping_mul(0x45d9f3b);
        h ^= h >> 16;
        h
    }

    /// f32 in [0, 1); the top 24 bits keep the result strictly below 1
    fn next_float(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / (1u32 << 24) as f32
    }

    fn range(&mut self, min: f32, max: f32) -> f32 {
        min + self.next_float() * (max - min)
    }
}

/// Per-octave sample offsets derived from the seed, each component in [-1000, 1000)
pub fn octave_offsets(seed: i32, count: u32) -> Vec<Vec3> {
    let mut rng = SimpleRng::new(seed as u32 as u64);
    (0..count)
        .map(|_| {
            Vec3::new(
                rng.range(-1000.0, 1000.0),
                rng.range(-1000.0, 1000.0),
                rng.range(-1000.0, 1000.0),
            )
        })
        .collect()
}

/// Evaluate the density at grid sample (x, y, z)
pub fn sample_density(params: &DensityParams, offsets: &[Vec3], sampler: &dyn NoiseSampler, x: u32, y: u32, z: u32) -> f32 {
    let mut p = params.sample_position(x, y, z) + params.space_offset();
    let h = y as f32 / params.cubes_y.max(1) as f32;

    if params.warp_amplitude != 0.0 {
        let wp = p * params.warp_frequency;
        let warp = Vec3::new(
            sampler.sample(wp),
            sampler.sample(wp + Vec3::splat(100.0)),
            sampler.sample(wp + Vec3::splat(200.0)),
        );
        p += warp * params.warp_amplitude;
    }

    let mut noise = 0.0;
    let mut frequency = params.frequency;
    let mut amplitude = params.amplitude;
    let mut weight = 1.0;
    let octaves = (params.num_octaves as usize).min(offsets.len());
    for offset in &offsets[..octaves] {
        let n = sampler.sample(p * frequency + *offset);
        let mut v = 1.0 - n.abs();
        v = v * v * weight;
        weight = (v * params.v_weight).clamp(0.0, 1.0);
        noise += v * amplitude;
        amplitude *= params.persistence;
        frequency *= params.lacunarity;
    }

    let mut density = noise * params.noise_weight + (params.offset_y - h) * params.y_weight;

    if params.terrace_period > 0.0 {
        density += h.rem_euclid(params.terrace_period) * params.terrace_strength;
    }

    if h > params.ceiling_y {
        density -= (h - params.ceiling_y) * params.ceiling_weight;
    }
    if h > params.hard_ceiling_y {
        density += params.hard_ceiling_weight;
    }
    if h < params.floor_y {
        density += (params.floor_y - h) * params.floor_weight;
    }
    if h < params.hard_floor_y {
        density += params.hard_floor_weight;
    }

    density
}

/// Fill `out` with the density of every sample, x fastest then y then z
pub fn fill_densities(params: &DensityParams, offsets: &[Vec3], sampler: &dyn NoiseSampler, grid: GridDims, out: &mut [f32]) {
    use rayon::prelude::*;

    let px = grid.points_xz() as usize;
    let py = grid.points_y() as usize;
    out[..grid.num_points()]
        .par_chunks_mut(px * py)
        .enumerate()
        .for_each(|(z, slab)| {
            for (i, value) in slab.iter_mut().enumerate() {
                let x = (i % px) as u32;
                let y = (i / px) as u32;
                *value = sample_density(params, offsets, sampler, x, y, z as u32);
            }
        });
}
