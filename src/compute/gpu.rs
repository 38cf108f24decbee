//! wgpu compute device running the density and marching cubes kernels
//!
//! Each dispatch clears the append counter, runs both passes and copies the
//! counter to a staging buffer. Readback happens in two non-blocking steps:
//! the counter is mapped first, then exactly that many triangles are copied
//! and mapped.

use std::sync::mpsc::{Receiver, TryRecvError, channel};

use crate::compute::backend::{BufferLayout, ComputeBackend, ExtractionJob, Readback, Ticket};
use crate::compute::density::DensityParams;
use crate::compute::dispatch::THREAD_GROUP_SIZE;
use crate::compute::pool::DeviceBufferSet;
use crate::compute::tables::tri_table_flat;
use crate::core::{Error, Result};
use crate::terrain::Triangle;

type MapResult = std::result::Result<(), wgpu::BufferAsyncError>;

/// Device buffers and bind groups of one buffer set
pub struct GpuStorage {
    params: wgpu::Buffer,
    offsets: wgpu::Buffer,
    /// Kept alive for the bind groups
    #[allow(dead_code)]
    densities: wgpu::Buffer,
    triangles: wgpu::Buffer,
    counter: wgpu::Buffer,
    counter_staging: wgpu::Buffer,
    triangle_staging: wgpu::Buffer,
    density_bind_group: wgpu::BindGroup,
    march_bind_group: wgpu::BindGroup,
    max_triangles: u32,
}

enum Stage {
    Counter,
    Triangles { count: u32 },
}

struct PendingReadback {
    ticket: Ticket,
    buffers: DeviceBufferSet<GpuStorage>,
    stage: Stage,
    rx: Receiver<MapResult>,
}

pub struct GpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    density_pipeline: wgpu::ComputePipeline,
    march_pipeline: wgpu::ComputePipeline,
    density_layout: wgpu::BindGroupLayout,
    march_layout: wgpu::BindGroupLayout,
    tri_table: wgpu::Buffer,
    pending: Vec<PendingReadback>,
    /// Dispatches that failed before reaching the device
    failed: Vec<Readback<GpuStorage>>,
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn create_pipeline(
    device: &wgpu::Device,
    label: &str,
    source: &str,
    layout: &wgpu::BindGroupLayout,
) -> wgpu::ComputePipeline {
    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });

    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[layout],
        immediate_size: 0,
    });

    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        module: &shader,
        entry_point: Some("main"),
        compilation_options: Default::default(),
        cache: None,
    })
}

impl GpuBackend {
    /// Create a headless device, blocking until it is ready
    pub fn new() -> Result<Self> {
        pollster::block_on(Self::new_async())
    }

    pub async fn new_async() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| Error::Compute(format!("No suitable adapter found: {:?}", e)))?;

        let adapter_limits = adapter.limits();
        let invocations = THREAD_GROUP_SIZE.pow(3);
        if adapter_limits.max_compute_invocations_per_workgroup < invocations {
            return Err(Error::Compute(format!(
                "Adapter supports {} invocations per workgroup, {} required",
                adapter_limits.max_compute_invocations_per_workgroup, invocations
            )));
        }

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("abyss_compute_device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits {
                    max_compute_invocations_per_workgroup: invocations,
                    max_storage_buffer_binding_size: adapter_limits.max_storage_buffer_binding_size,
                    max_buffer_size: adapter_limits.max_buffer_size,
                    ..Default::default()
                },
                memory_hints: wgpu::MemoryHints::Performance,
                experimental_features: Default::default(),
                trace: Default::default(),
            })
            .await
            .map_err(|e| Error::Compute(e.to_string()))?;

        let info = adapter.get_info();
        log::info!("GPU compute backend ready: {} ({:?})", info.name, info.backend);

        Ok(Self::with_device(device, queue))
    }

    /// Build pipelines on an existing device
    pub fn with_device(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let density_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("density_layout"),
            entries: &[uniform_entry(0), storage_entry(1, true), storage_entry(2, false)],
        });

        let march_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("march_layout"),
            entries: &[
                uniform_entry(0),
                storage_entry(1, true),
                storage_entry(2, false),
                storage_entry(3, false),
                storage_entry(4, true),
            ],
        });

        let density_pipeline = create_pipeline(
            &device,
            "density_pipeline",
            concat!(include_str!("../../shaders/common.wgsl"), include_str!("../../shaders/density.wgsl")),
            &density_layout,
        );
        let march_pipeline = create_pipeline(
            &device,
            "march_pipeline",
            concat!(include_str!("../../shaders/common.wgsl"), include_str!("../../shaders/marching_cubes.wgsl")),
            &march_layout,
        );

        let table = tri_table_flat();
        let tri_table = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("tri_table"),
            size: (table.len() * std::mem::size_of::<i32>()) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        queue.write_buffer(&tri_table, 0, bytemuck::cast_slice(&table));

        Self {
            device,
            queue,
            density_pipeline,
            march_pipeline,
            density_layout,
            march_layout,
            tri_table,
            pending: Vec::new(),
            failed: Vec::new(),
        }
    }

    fn buffer(&self, label: &str, size: u64, usage: wgpu::BufferUsages) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: size.max(4),
            usage,
            mapped_at_creation: false,
        })
    }

    fn encode(&self, job: &ExtractionJob, storage: &GpuStorage) -> Result<wgpu::SubmissionIndex> {
        let point_groups = job.grid.point_groups()?;
        let cube_groups = job.grid.cube_groups()?;

        let offsets: Vec<[f32; 4]> = job.offsets.iter().map(|o| [o.x, o.y, o.z, 0.0]).collect();
        self.queue.write_buffer(&storage.params, 0, bytemuck::bytes_of(&job.params));
        if !offsets.is_empty() {
            self.queue.write_buffer(&storage.offsets, 0, bytemuck::cast_slice(&offsets));
        }

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("extraction_encoder"),
        });
        encoder.clear_buffer(&storage.counter, 0, None);
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("density_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.density_pipeline);
            pass.set_bind_group(0, &storage.density_bind_group, &[]);
            pass.dispatch_workgroups(point_groups[0], point_groups[1], point_groups[2]);
        }
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("march_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.march_pipeline);
            pass.set_bind_group(0, &storage.march_bind_group, &[]);
            pass.dispatch_workgroups(cube_groups[0], cube_groups[1], cube_groups[2]);
        }
        encoder.copy_buffer_to_buffer(&storage.counter, 0, &storage.counter_staging, 0, 4);

        Ok(self.queue.submit(Some(encoder.finish())))
    }

    /// Advance one pending readback; `Some` once it has finished
    fn advance(&self, pending: &mut PendingReadback, mapped: MapResult) -> Option<Result<Vec<Triangle>>> {
        if let Err(e) = mapped {
            return Some(Err(Error::Compute(format!("Readback failed: {}", e))));
        }
        let Some(storage) = pending.buffers.storage() else {
            return Some(Err(Error::Compute("buffer set lost its storage".into())));
        };

        match pending.stage {
            Stage::Counter => {
                let count = {
                    let data = storage.counter_staging.slice(..).get_mapped_range();
                    u32::from_le_bytes([data[0], data[1], data[2], data[3]])
                };
                storage.counter_staging.unmap();

                let count = count.min(storage.max_triangles);
                if count == 0 {
                    return Some(Ok(Vec::new()));
                }

                let bytes = count as u64 * Triangle::SIZE as u64;
                let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("triangle_readback_encoder"),
                });
                encoder.copy_buffer_to_buffer(&storage.triangles, 0, &storage.triangle_staging, 0, bytes);
                self.queue.submit(Some(encoder.finish()));

                let (tx, rx) = channel();
                storage.triangle_staging.slice(..bytes).map_async(wgpu::MapMode::Read, move |result| {
                    let _ = tx.send(result);
                });
                pending.stage = Stage::Triangles { count };
                pending.rx = rx;
                None
            }
            Stage::Triangles { count } => {
                let bytes = count as u64 * Triangle::SIZE as u64;
                let triangles = {
                    let data = storage.triangle_staging.slice(..bytes).get_mapped_range();
                    bytemuck::cast_slice::<u8, Triangle>(&data).to_vec()
                };
                storage.triangle_staging.unmap();
                Some(Ok(triangles))
            }
        }
    }
}

impl ComputeBackend for GpuBackend {
    type Storage = GpuStorage;

    fn name(&self) -> &'static str {
        "gpu"
    }

    fn allocate(&self, layout: &BufferLayout) -> Result<GpuStorage> {
        use wgpu::BufferUsages as U;

        let max_triangles = u32::try_from(layout.max_triangles)
            .map_err(|_| Error::Compute(format!("{} triangles exceed device limits", layout.max_triangles)))?;
        if layout.triangle_bytes() > self.device.limits().max_storage_buffer_binding_size as u64 {
            return Err(Error::Compute(format!(
                "Triangle buffer of {} bytes exceeds the device binding limit",
                layout.triangle_bytes()
            )));
        }

        let params = self.buffer("density_params", DensityParams::SIZE as u64, U::UNIFORM | U::COPY_DST);
        let offsets = self.buffer("octave_offsets", layout.offset_bytes(), U::STORAGE | U::COPY_DST);
        let densities = self.buffer("densities", layout.density_bytes(), U::STORAGE);
        let triangles = self.buffer("triangles", layout.triangle_bytes(), U::STORAGE | U::COPY_SRC);
        let counter = self.buffer("triangle_counter", 4, U::STORAGE | U::COPY_SRC | U::COPY_DST);
        let counter_staging = self.buffer("triangle_counter_staging", 4, U::MAP_READ | U::COPY_DST);
        let triangle_staging = self.buffer("triangle_staging", layout.triangle_bytes(), U::MAP_READ | U::COPY_DST);

        let density_bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("density_bind_group"),
            layout: &self.density_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: params.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: offsets.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: densities.as_entire_binding() },
            ],
        });

        let march_bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("march_bind_group"),
            layout: &self.march_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: params.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: densities.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: triangles.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: counter.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 4, resource: self.tri_table.as_entire_binding() },
            ],
        });

        Ok(GpuStorage {
            params,
            offsets,
            densities,
            triangles,
            counter,
            counter_staging,
            triangle_staging,
            density_bind_group,
            march_bind_group,
            max_triangles,
        })
    }

    fn dispatch(&mut self, job: ExtractionJob, buffers: DeviceBufferSet<GpuStorage>) {
        let submitted = match buffers.storage() {
            Some(storage) => self.encode(&job, storage),
            None => Err(Error::Compute("buffer set dispatched before initialization".into())),
        };

        match submitted {
            Ok(_) => {
                let (tx, rx) = channel();
                if let Some(storage) = buffers.storage() {
                    storage.counter_staging.slice(..).map_async(wgpu::MapMode::Read, move |result| {
                        let _ = tx.send(result);
                    });
                }
                log::trace!("Dispatched ticket {:?}", job.ticket);
                self.pending.push(PendingReadback {
                    ticket: job.ticket,
                    buffers,
                    stage: Stage::Counter,
                    rx,
                });
            }
            Err(e) => self.failed.push(Readback { ticket: job.ticket, result: Err(e), buffers }),
        }
    }

    fn poll(&mut self) -> Result<Vec<Readback<GpuStorage>>> {
        if !self.pending.is_empty() {
            self.device
                .poll(wgpu::PollType::Poll)
                .map_err(|e| Error::Compute(format!("Device poll failed: {}", e)))?;
        }
        // Failed dispatches stay queued until a poll succeeds
        let mut done = std::mem::take(&mut self.failed);
        if self.pending.is_empty() {
            return Ok(done);
        }

        let mut still_pending = Vec::with_capacity(self.pending.len());
        for mut pending in std::mem::take(&mut self.pending) {
            let mapped = match pending.rx.try_recv() {
                Ok(mapped) => mapped,
                Err(TryRecvError::Empty) => {
                    still_pending.push(pending);
                    continue;
                }
                Err(TryRecvError::Disconnected) => Err(wgpu::BufferAsyncError),
            };

            match self.advance(&mut pending, mapped) {
                Some(result) => done.push(Readback {
                    ticket: pending.ticket,
                    result,
                    buffers: pending.buffers,
                }),
                None => still_pending.push(pending),
            }
        }
        self.pending = still_pending;
        Ok(done)
    }

    fn in_flight(&self) -> usize {
        self.pending.len() + self.failed.len()
    }
}
