use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::Sender;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use weir_hash_spec::{dp_masks, words_to_state};
use wgpu::util::DeviceExt;

use crate::backend::{DpPair, WalkBackend, WalkConfig, WalkEvent};

const BACKEND_NAME: &str = "wgpu";
const WALK_KERNEL_SRC: &str = include_str!("sha256.wgsl");
const WORKGROUP_SIZE: u32 = 256;

struct Shared {
    shutdown: AtomicBool,
    event_sink: RwLock<Option<Sender<WalkEvent>>>,
}

/// GPU walker. All chain state is resident on the device; the host only
/// seeds randomness, reads back finished pairs, and counts hashes.
pub struct WgpuBackend {
    config: WalkConfig,
    lanes: usize,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl WgpuBackend {
    pub fn new(config: WalkConfig) -> Self {
        Self {
            config,
            lanes: 0,
            shared: Arc::new(Shared {
                shutdown: AtomicBool::new(false),
                event_sink: RwLock::new(None),
            }),
            worker: None,
        }
    }
}

impl WalkBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn lanes(&self) -> usize {
        self.lanes
    }

    fn set_event_sink(&mut self, sink: Sender<WalkEvent>) {
        if let Ok(mut slot) = self.shared.event_sink.write() {
            *slot = Some(sink);
        }
    }

    fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let mut engine = GpuWalkEngine::new(self.config)?;
        self.lanes = engine.lanes();
        self.shared.shutdown.store(false, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("weir-wgpu-walker".to_string())
            .spawn(move || walker_loop(&mut engine, &shared))
            .map_err(|err| anyhow!("failed to spawn wgpu walker thread: {err}"))?;
        self.worker = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

fn walker_loop(engine: &mut GpuWalkEngine, shared: &Shared) {
    while !shared.shutdown.load(Ordering::Relaxed) {
        match engine.dispatch() {
            Ok(outcome) => {
                emit_event(
                    shared,
                    WalkEvent::Hashes {
                        backend: BACKEND_NAME,
                        count: outcome.hashes,
                    },
                );
                if outcome.dropped > 0 {
                    emit_event(
                        shared,
                        WalkEvent::DpOverflow {
                            backend: BACKEND_NAME,
                            dropped: outcome.dropped,
                        },
                    );
                }
                if !outcome.pairs.is_empty() {
                    emit_event(
                        shared,
                        WalkEvent::DistinguishedPoints {
                            backend: BACKEND_NAME,
                            pairs: outcome.pairs,
                        },
                    );
                }
            }
            Err(err) => {
                emit_event(
                    shared,
                    WalkEvent::Error {
                        backend: BACKEND_NAME,
                        message: format!("dispatch failed: {err:#}"),
                    },
                );
                break;
            }
        }
    }
}

fn emit_event(shared: &Shared, event: WalkEvent) {
    let tx = match shared.event_sink.read() {
        Ok(slot) => slot.clone(),
        Err(_) => None,
    };
    if let Some(tx) = tx {
        let _ = tx.send(event);
    }
}

struct DispatchOutcome {
    pairs: Vec<DpPair>,
    hashes: u64,
    dropped: u64,
}

struct GpuWalkEngine {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
    dp_buffer: wgpu::Buffer,
    dp_count: wgpu::Buffer,
    dp_count_staging: wgpu::Buffer,
    dp_buffer_staging: wgpu::Buffer,
    config: WalkConfig,
    lanes: usize,
    rng: StdRng,
}

impl GpuWalkEngine {
    fn new(config: WalkConfig) -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| anyhow!("no suitable GPU adapter found"))?;

        let info = adapter.get_info();
        println!("[wgpu] using {} ({:?})", info.name, info.backend);

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("weir-walker"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
            },
            None,
        ))
        .context("failed to acquire GPU device")?;

        // Round the lane count up to a whole number of workgroups.
        let lanes = config.lanes.max(1).div_ceil(WORKGROUP_SIZE as usize) * WORKGROUP_SIZE as usize;
        let num_words = config.params.num_words();
        if config.max_dps_per_dispatch == 0 {
            bail!("max_dps_per_dispatch must be at least 1");
        }

        let shader_source = specialize_kernel(WALK_KERNEL_SRC, &config);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("weir-walk-kernel"),
            source: wgpu::ShaderSource::Wgsl(shader_source.into()),
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("weir-walk-pipeline"),
            layout: None,
            module: &module,
            entry_point: "walk",
            compilation_options: Default::default(),
        });

        let mut rng = StdRng::from_entropy();

        // Every lane begins on a fresh random chain; states equal starts.
        let state_words: Vec<u32> = (0..lanes * num_words).map(|_| rng.gen()).collect();
        let storage = wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST;

        let current_states = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("weir-current-states"),
            contents: bytemuck::cast_slice(&state_words),
            usage: storage,
        });
        let start_points = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("weir-start-points"),
            contents: bytemuck::cast_slice(&state_words),
            usage: storage,
        });

        let seed_words = random_seed_words(&mut rng, config.max_dps_per_dispatch, num_words);
        let dp_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("weir-dp-buffer"),
            contents: bytemuck::cast_slice(&seed_words),
            usage: storage,
        });

        let dp_count = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("weir-dp-count"),
            contents: bytemuck::bytes_of(&0u32),
            usage: storage,
        });

        let (mask0, mask1) = dp_masks(config.dp_bits);
        let masks = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("weir-dp-masks"),
            contents: bytemuck::cast_slice(&[mask0, mask1]),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let dp_count_staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("weir-dp-count-staging"),
            size: 4,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let dp_buffer_bytes = (config.max_dps_per_dispatch * 2 * num_words * 4) as u64;
        let dp_buffer_staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("weir-dp-buffer-staging"),
            size: dp_buffer_bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("weir-walk-bind-group"),
            layout: &pipeline.get_bind_group_layout(0),
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: current_states.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: start_points.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: dp_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: dp_count.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: masks.as_entire_binding(),
                },
            ],
        });

        Ok(Self {
            device,
            queue,
            pipeline,
            bind_group,
            dp_buffer,
            dp_count,
            dp_count_staging,
            dp_buffer_staging,
            config,
            lanes,
            rng,
        })
    }

    fn lanes(&self) -> usize {
        self.lanes
    }

    /// Advance every lane by `steps_per_dispatch` iterations and collect
    /// the `(start, dp)` pairs found along the way.
    fn dispatch(&mut self) -> Result<DispatchOutcome> {
        self.queue
            .write_buffer(&self.dp_count, 0, bytemuck::bytes_of(&0u32));

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("weir-walk-dispatch"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("weir-walk-pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &self.bind_group, &[]);
            pass.dispatch_workgroups(self.lanes as u32 / WORKGROUP_SIZE, 1, 1);
        }
        encoder.copy_buffer_to_buffer(&self.dp_count, 0, &self.dp_count_staging, 0, 4);
        self.queue.submit(Some(encoder.finish()));

        let count_bytes = self.read_staging(&self.dp_count_staging)?;
        let raw_count = u32::from_le_bytes(
            count_bytes[..4]
                .try_into()
                .map_err(|_| anyhow!("short dp_count readback"))?,
        ) as usize;

        let max_dps = self.config.max_dps_per_dispatch;
        let dropped = raw_count.saturating_sub(max_dps) as u64;
        let found = raw_count.min(max_dps);

        let mut pairs = Vec::with_capacity(found);
        if found > 0 {
            let num_words = self.config.params.num_words();
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("weir-dp-readback"),
                });
            encoder.copy_buffer_to_buffer(
                &self.dp_buffer,
                0,
                &self.dp_buffer_staging,
                0,
                self.dp_buffer_staging.size(),
            );
            self.queue.submit(Some(encoder.finish()));

            let data = self.read_staging(&self.dp_buffer_staging)?;
            // pod_collect_to_vec copies, sidestepping the alignment of the
            // readback Vec<u8>.
            let words: Vec<u32> = bytemuck::pod_collect_to_vec(&data);
            for slot in 0..found {
                let base = slot * 2 * num_words;
                pairs.push(DpPair {
                    start: words_to_state(&self.config.params, &words[base..base + num_words]),
                    dp: words_to_state(
                        &self.config.params,
                        &words[base + num_words..base + 2 * num_words],
                    ),
                });
            }

            // Reseed the consumed slots so the next dispatch steals fresh
            // random starts again.
            let seed_words = random_seed_words(&mut self.rng, found, num_words);
            self.queue
                .write_buffer(&self.dp_buffer, 0, bytemuck::cast_slice(&seed_words));
        }

        Ok(DispatchOutcome {
            pairs,
            hashes: self.lanes as u64 * u64::from(self.config.steps_per_dispatch),
            dropped,
        })
    }

    fn read_staging(&self, staging: &wgpu::Buffer) -> Result<Vec<u8>> {
        let slice = staging.slice(..);
        let (tx, rx) = crossbeam_channel::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| anyhow!("map_async callback dropped"))?
            .map_err(|err| anyhow!("buffer mapping failed: {err}"))?;
        let data = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(data)
    }
}

/// Random `[start | dp]` slots for dp_buffer. The MSB of each slot's word 0
/// is forced to 1 so a stolen start can never itself be distinguished.
fn random_seed_words<R: Rng>(rng: &mut R, slots: usize, num_words: usize) -> Vec<u32> {
    let width = 2 * num_words;
    let mut words: Vec<u32> = (0..slots * width).map(|_| rng.gen()).collect();
    for slot in 0..slots {
        words[slot * width] |= 0x8000_0000;
    }
    words
}

/// WGSL has no preprocessor: specialize the kernel by substituting the
/// walk constants as plain numerals.
fn specialize_kernel(src: &str, config: &WalkConfig) -> String {
    src.replace("KERNEL_STEPS", &config.steps_per_dispatch.to_string())
        .replace("KERNEL_MAX_DPS", &config.max_dps_per_dispatch.to_string())
        .replace("KERNEL_WORKGROUP", &WORKGROUP_SIZE.to_string())
        .replace(
            "HASH_PREFIX_BYTES",
            &config.params.prefix_bytes().to_string(),
        )
        .replace(
            "HASH_SUFFIX_BYTES",
            &config.params.suffix_bytes().to_string(),
        )
        .replace("HASH_TOTAL_BYTES", &config.params.total_bytes().to_string())
        .replace("HASH_NUM_WORDS", &config.params.num_words().to_string())
        .replace("HASH_ASCII_BYTES", &config.params.ascii_bytes().to_string())
}
