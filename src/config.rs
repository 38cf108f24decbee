//! Streaming, world-grid and noise configuration.
//!
//! All settings are plain value objects with sensible defaults. They can be
//! loaded from JSON (missing fields fall back to defaults) and must pass
//! [`Config::validate`] before they are handed to the pipeline.

use std::path::Path;

use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};

/// Upper bound on fBm octaves; sizes the per-set noise offset buffer
pub const MAX_OCTAVES: u32 = 12;

/// Chunk grid and isosurface parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldSettings {
    /// Horizontal edge length of a chunk in world units
    pub chunk_size: f32,
    /// Marching cubes per chunk along X and Z
    pub num_cubes_xz: u32,
    /// Marching cubes per chunk along Y
    pub num_cubes_y: u32,
    /// Density value at which the surface is extracted
    pub threshold: f32,
    /// World-space Y of every chunk origin
    pub ground_level: f32,
    /// Extra height above the chunk top where the water surface sits
    pub surface_level_offset: f32,
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self {
            chunk_size: 32.0,
            num_cubes_xz: 32,
            num_cubes_y: 64,
            threshold: 0.5,
            ground_level: 0.0,
            surface_level_offset: 30.0,
        }
    }
}

impl WorldSettings {
    /// Edge length of a single marching cube
    pub fn cube_size(&self) -> f32 {
        self.chunk_size / self.num_cubes_xz as f32
    }

    /// Vertical extent of a chunk
    pub fn chunk_height(&self) -> f32 {
        self.num_cubes_y as f32 * self.cube_size()
    }

    /// World-space Y of the water surface
    pub fn surface_level(&self) -> f32 {
        self.ground_level + self.chunk_height() + self.surface_level_offset
    }

    /// Snap a world position to the origin of the chunk containing it.
    ///
    /// X and Z are floored to a multiple of the chunk size; Y is always the
    /// ground level since chunks span a single vertical layer.
    pub fn pos_to_chunk_pos(&self, pos: Vec3) -> Vec3 {
        Vec3::new(
            (pos.x / self.chunk_size).floor() * self.chunk_size,
            self.ground_level,
            (pos.z / self.chunk_size).floor() * self.chunk_size,
        )
    }
}

/// Layered noise parameters for the density field
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseSettings {
    pub seed: i32,
    /// Constant offset added to every sample position
    pub space_offset: Vec3,

    // Fractional Brownian motion
    pub num_octaves: u32,
    /// Base frequency, divided by 100 before sampling
    pub frequency: f32,
    pub lacunarity: f32,
    pub amplitude: f32,
    pub persistence: f32,

    // Vertical shaping
    /// Normalized height where the vertical bias crosses zero
    pub offset_y: f32,
    pub y_weight: f32,
    pub noise_weight: f32,
    /// Ridge weight multiplier between octaves
    pub v_weight: f32,

    // Ceiling (heights are fractions of the chunk height)
    pub ceiling_y: f32,
    pub ceiling_weight: f32,
    pub hard_ceiling_y: f32,
    pub hard_ceiling_weight: f32,

    // Floor
    pub floor_y: f32,
    pub floor_weight: f32,
    pub hard_floor_y: f32,
    pub hard_floor_weight: f32,

    // Domain warp
    /// Warp frequency, divided by 1000 before sampling
    pub warp_frequency: f32,
    pub warp_amplitude: f32,

    /// Terrace period (x, normalized height) and strength (y); disabled when x is 0
    pub terracing: Vec2,
}

impl Default for NoiseSettings {
    fn default() -> Self {
        Self {
            seed: 0,
            space_offset: Vec3::ZERO,
            num_octaves: 9,
            frequency: 2.0,
            lacunarity: 2.0,
            amplitude: 1.0,
            persistence: 0.5,
            offset_y: 0.5,
            y_weight: 1.0,
            noise_weight: 1.0,
            v_weight: 1.0,
            ceiling_y: 0.8,
            ceiling_weight: 1.0,
            hard_ceiling_y: 0.95,
            hard_ceiling_weight: -100.0,
            floor_y: 0.5,
            floor_weight: 1.0,
            hard_floor_y: 0.05,
            hard_floor_weight: 100.0,
            warp_frequency: 0.0,
            warp_amplitude: 0.0,
            terracing: Vec2::ZERO,
        }
    }
}

/// Viewpoint-driven streaming parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingSettings {
    /// Chunks kept around the viewpoint in each horizontal direction
    pub render_distance: u32,
    /// Extra rings used to size the pre-warmed chunk pool
    pub render_distance_offset: u32,
    /// Budget shared by the activation, readback and assembly stages
    pub max_chunks_per_frame: u32,
    /// Sleep between discovery passes
    pub discovery_interval_ms: u64,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            render_distance: 3,
            render_distance_offset: 2,
            max_chunks_per_frame: 4,
            discovery_interval_ms: 250,
        }
    }
}

impl StreamingSettings {
    /// Number of chunk entities created up front
    pub fn prewarm_count(&self) -> usize {
        let ring = (self.render_distance + self.render_distance_offset) as usize;
        ring * ring
    }
}

/// Complete pipeline configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub world: WorldSettings,
    pub noise: NoiseSettings,
    pub streaming: StreamingSettings,
}

impl Config {
    /// Load and validate a configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_json(&text)?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse and validate a configuration from a JSON string
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let world = &self.world;
        if !(world.chunk_size > 0.0) || !world.chunk_size.is_finite() {
            return Err(Error::Config(format!("chunk_size must be positive, got {}", world.chunk_size)));
        }
        if world.num_cubes_xz == 0 || world.num_cubes_y == 0 {
            return Err(Error::Config(format!(
                "cube counts must be positive, got {}x{}",
                world.num_cubes_xz, world.num_cubes_y
            )));
        }
        if !world.threshold.is_finite() {
            return Err(Error::Config("threshold must be finite".into()));
        }

        let noise = &self.noise;
        if noise.num_octaves == 0 || noise.num_octaves > MAX_OCTAVES {
            return Err(Error::Config(format!(
                "num_octaves must be in 1..={}, got {}",
                MAX_OCTAVES, noise.num_octaves
            )));
        }

        let streaming = &self.streaming;
        if streaming.render_distance == 0 {
            return Err(Error::Config("render_distance must be positive".into()));
        }
        if streaming.max_chunks_per_frame == 0 {
            return Err(Error::Config("max_chunks_per_frame must be positive".into()));
        }
        if streaming.discovery_interval_ms == 0 {
            return Err(Error::Config("discovery_interval_ms must be positive".into()));
        }
        Ok(())
    }
}
