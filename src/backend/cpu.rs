use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};

use anyhow::Result;
use crossbeam_channel::Sender;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use weir_hash_spec::{is_distinguished, step_into};

use crate::backend::{DpPair, WalkBackend, WalkConfig, WalkEvent};

const HASH_EVENT_BATCH: u64 = 4096;

struct Shared {
    started: AtomicBool,
    shutdown: AtomicBool,
    event_sink: RwLock<Option<Sender<WalkEvent>>>,
}

/// Software walker: one chain per worker thread, stepped with the reference
/// implementation of the walk function. Slow next to a GPU but bit-exact,
/// and the fallback when no adapter is available.
pub struct CpuBackend {
    threads: usize,
    config: WalkConfig,
    shared: Arc<Shared>,
    worker_handles: Vec<JoinHandle<()>>,
}

impl CpuBackend {
    pub fn new(threads: usize, config: WalkConfig) -> Self {
        Self {
            threads: threads.max(1),
            config,
            shared: Arc::new(Shared {
                started: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                event_sink: RwLock::new(None),
            }),
            worker_handles: Vec::new(),
        }
    }
}

impl WalkBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn lanes(&self) -> usize {
        self.threads
    }

    fn set_event_sink(&mut self, sink: Sender<WalkEvent>) {
        if let Ok(mut slot) = self.shared.event_sink.write() {
            *slot = Some(sink);
        }
    }

    fn start(&mut self) -> Result<()> {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.shared.shutdown.store(false, Ordering::SeqCst);

        for thread_idx in 0..self.threads {
            let shared = Arc::clone(&self.shared);
            let config = self.config;
            self.worker_handles.push(
                thread::Builder::new()
                    .name(format!("weir-cpu-walker-{thread_idx}"))
                    .spawn(move || cpu_walker_loop(shared, config))
                    .expect("cpu walker thread should spawn"),
            );
        }

        Ok(())
    }

    fn stop(&mut self) {
        if !self.shared.started.swap(false, Ordering::SeqCst) {
            return;
        }

        self.shared.shutdown.store(true, Ordering::SeqCst);

        for handle in self.worker_handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Fresh chain start: random bytes with the top bit forced so the start is
/// never itself distinguished (which would make a zero-length chain).
pub fn random_start<R: Rng>(rng: &mut R, total_bytes: usize) -> Vec<u8> {
    let mut start = vec![0u8; total_bytes];
    rng.fill(&mut start[..]);
    start[0] |= 0x80;
    start
}

fn cpu_walker_loop(shared: Arc<Shared>, config: WalkConfig) {
    let total_bytes = config.params.total_bytes();
    let mut rng = StdRng::from_entropy();
    let mut start = random_start(&mut rng, total_bytes);
    let mut state = start.clone();
    let mut next = vec![0u8; total_bytes];
    let mut hash_batch = 0u64;
    let mut found: Vec<DpPair> = Vec::new();

    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            flush(&shared, &mut hash_batch, &mut found);
            break;
        }

        for _ in 0..config.steps_per_dispatch {
            step_into(&config.params, &state, &mut next);
            std::mem::swap(&mut state, &mut next);
            hash_batch += 1;

            if is_distinguished(&state, config.dp_bits) {
                found.push(DpPair {
                    start: std::mem::replace(
                        &mut start,
                        random_start(&mut rng, total_bytes),
                    ),
                    dp: state.clone(),
                });
                state.copy_from_slice(&start);
            }
        }

        if hash_batch >= HASH_EVENT_BATCH || !found.is_empty() {
            flush(&shared, &mut hash_batch, &mut found);
        }
    }
}

fn flush(shared: &Shared, hash_batch: &mut u64, found: &mut Vec<DpPair>) {
    if *hash_batch > 0 {
        emit_event(
            shared,
            WalkEvent::Hashes {
                backend: "cpu",
                count: *hash_batch,
            },
        );
        *hash_batch = 0;
    }
    if !found.is_empty() {
        emit_event(
            shared,
            WalkEvent::DistinguishedPoints {
                backend: "cpu",
                pairs: std::mem::take(found),
            },
        );
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
