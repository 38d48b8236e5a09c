use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};

use crate::api::{ApiClient, SubmitError};
use crate::backend::cpu::CpuBackend;
use crate::backend::wgpu::WgpuBackend;
use crate::backend::{DpPair, WalkBackend, WalkConfig, WalkEvent};
use crate::config::BackendKind;

const EVENT_WAIT: Duration = Duration::from_millis(100);
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const MAX_INFLIGHT_BATCHES: usize = 4;

#[derive(Debug, Clone)]
pub struct MinerConfig {
    pub walk: WalkConfig,
    pub backends: Vec<BackendKind>,
    pub cpu_threads: usize,
    pub stats_interval: Duration,
    pub verify: bool,
}

struct Stats {
    started_at: Instant,
    hashes: u64,
    dps_found: u64,
    dps_submitted: u64,
    dps_dropped: u64,
    flushes_deferred: u64,
}

impl Stats {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            hashes: 0,
            dps_found: 0,
            dps_submitted: 0,
            dps_dropped: 0,
            flushes_deferred: 0,
        }
    }

    fn print(&self) {
        let elapsed = self.started_at.elapsed().as_secs_f64().max(0.001);
        println!(
            "[stats] {:.1}s elapsed | {} hashes | {} | dps={} ({:.2} DP/s) submitted={} dropped={} deferred={}",
            elapsed,
            self.hashes,
            format_hashrate(self.hashes as f64 / elapsed),
            self.dps_found,
            self.dps_found as f64 / elapsed,
            self.dps_submitted,
            self.dps_dropped,
            self.flushes_deferred,
        );
    }
}

/// Run the mining loop until shutdown. With no client the miner is in dry
///-run mode and prints pairs instead of submitting them.
pub fn run(config: &MinerConfig, client: Option<ApiClient>, shutdown: &Arc<AtomicBool>) -> Result<()> {
    let (event_tx, event_rx) = unbounded::<WalkEvent>();
    let mut backends = activate_backends(build_backends(config), event_tx)?;

    println!(
        "starting weir miner | backends={} | lanes={} | {} | dp_bits={} | {}",
        backend_names(&backends),
        total_lanes(&backends),
        config.walk.params,
        config.walk.dp_bits,
        if client.is_some() {
            "submitting"
        } else {
            "dry run"
        },
    );

    let submitter = client.map(|client| spawn_submitter(client, Arc::clone(shutdown)));
    let result = run_walk_loop(config, &event_rx, submitter.as_ref().map(|s| &s.0), shutdown);

    for backend in &mut backends {
        backend.stop();
    }
    if let Some((tx, handle)) = submitter {
        drop(tx);
        let _ = handle.join();
    }
    result
}

fn run_walk_loop(
    config: &MinerConfig,
    event_rx: &Receiver<WalkEvent>,
    submit_tx: Option<&Sender<Vec<DpPair>>>,
    shutdown: &AtomicBool,
) -> Result<()> {
    let mut stats = Stats::new();
    let mut pending: Vec<DpPair> = Vec::new();
    let mut last_flush = Instant::now();
    let mut last_stats_print = Instant::now();

    while !shutdown.load(Ordering::Relaxed) {
        crossbeam_channel::select! {
            recv(event_rx) -> event => {
                let event = match event {
                    Ok(event) => event,
                    Err(_) => break,
                };
                handle_walk_event(config, event, &mut stats, &mut pending)?;
            }
            default(EVENT_WAIT) => {}
        }

        if !pending.is_empty() && last_flush.elapsed() >= FLUSH_INTERVAL {
            match submit_tx {
                Some(tx) => {
                    let batch_len = pending.len() as u64;
                    match tx.try_send(std::mem::take(&mut pending)) {
                        Ok(()) => {
                            stats.dps_submitted += batch_len;
                            last_flush = Instant::now();
                        }
                        // Submission pipeline is saturated: keep the pairs
                        // and keep mining; retry on the next flush tick.
                        Err(TrySendError::Full(batch)) => {
                            pending = batch;
                            stats.flushes_deferred += 1;
                            last_flush = Instant::now();
                        }
                        Err(TrySendError::Disconnected(_)) => break,
                    }
                }
                None => {
                    for pair in pending.drain(..) {
                        println!(
                            "[dp] start={} dp={}",
                            hex::encode(&pair.start),
                            hex::encode(&pair.dp)
                        );
                    }
                    last_flush = Instant::now();
                }
            }
        }

        if last_stats_print.elapsed() >= config.stats_interval {
            stats.print();
            last_stats_print = Instant::now();
        }
    }

    // Best-effort flush of anything still pending at shutdown.
    if let Some(tx) = submit_tx {
        if !pending.is_empty() {
            let _ = tx.try_send(std::mem::take(&mut pending));
        }
    }

    stats.print();
    println!("weir miner stopped");
    Ok(())
}

fn handle_walk_event(
    config: &MinerConfig,
    event: WalkEvent,
    stats: &mut Stats,
    pending: &mut Vec<DpPair>,
) -> Result<()> {
    match event {
        WalkEvent::Hashes { count, .. } => {
            stats.hashes = stats.hashes.saturating_add(count);
        }
        WalkEvent::DistinguishedPoints { backend, pairs } => {
            stats.dps_found += pairs.len() as u64;
            if config.verify {
                if let Some(pair) = pairs.first() {
                    verify_pair(config, backend, pair);
                }
            }
            pending.extend(pairs);
        }
        WalkEvent::DpOverflow { backend, dropped } => {
            stats.dps_dropped += dropped;
            eprintln!(
                "[warn] {backend}: dp buffer overflowed, {dropped} chains dropped; \
                 consider raising dp_bits"
            );
        }
        WalkEvent::Error { backend, message } => {
            bail!("backend '{backend}' reported error: {message}");
        }
    }
    Ok(())
}

/// Cross-check one reported pair against the reference walk. Catches a
/// compute backend that disagrees with the reference implementation of
/// the walk function.
fn verify_pair(config: &MinerConfig, backend: &str, pair: &DpPair) {
    let limit = 1u64
        .checked_shl(config.walk.dp_bits + 8)
        .unwrap_or(u64::MAX);
    match weir_hash_spec::walk_to_dp(&config.walk.params, config.walk.dp_bits, &pair.start, limit) {
        Some((dp, len)) if dp == pair.dp => {
            println!("[verify] {backend}: chain ok (length {len})");
        }
        Some((dp, _)) => {
            eprintln!(
                "[verify] {backend}: MISMATCH! reported dp={} but reference walk gives {}",
                hex::encode(&pair.dp),
                hex::encode(&dp)
            );
        }
        None => {
            eprintln!(
                "[verify] {backend}: reference walk did not terminate within {limit} steps"
            );
        }
    }
}

fn spawn_submitter(
    client: ApiClient,
    shutdown: Arc<AtomicBool>,
) -> (Sender<Vec<DpPair>>, JoinHandle<()>) {
    let (tx, rx) = bounded::<Vec<DpPair>>(MAX_INFLIGHT_BATCHES);
    let handle = thread::Builder::new()
        .name("weir-submitter".to_string())
        .spawn(move || {
            while let Ok(batch) = rx.recv() {
                println!("[submit] sending {} DPs...", batch.len());
                match client.submit_work_with_retry(&batch) {
                    Ok(response) => println!("[submit] server says: {}", response.status),
                    Err(SubmitError::AuthFailure) => {
                        eprintln!("[submit] bad username and/or usertoken; stopping miner");
                        shutdown.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(SubmitError::Rejected(status)) => {
                        eprintln!("[submit] batch rejected, dropping it: {status}");
                    }
                    Err(SubmitError::Transient(status)) => {
                        eprintln!("[submit] giving up on batch after retries: {status}");
                    }
                }
            }
        })
        .expect("submitter thread should spawn");
    (tx, handle)
}

fn build_backends(config: &MinerConfig) -> Vec<Box<dyn WalkBackend>> {
    config
        .backends
        .iter()
        .map(|kind| match kind {
            BackendKind::Cpu => {
                Box::new(CpuBackend::new(config.cpu_threads, config.walk)) as Box<dyn WalkBackend>
            }
            BackendKind::Wgpu => Box::new(WgpuBackend::new(config.walk)) as Box<dyn WalkBackend>,
        })
        .collect()
}

fn activate_backends(
    mut backends: Vec<Box<dyn WalkBackend>>,
    event_tx: Sender<WalkEvent>,
) -> Result<Vec<Box<dyn WalkBackend>>> {
    let mut active = Vec::new();
    for mut backend in backends.drain(..) {
        let backend_name = backend.name();
        backend.set_event_sink(event_tx.clone());
        match backend.start() {
            Ok(()) => active.push(backend),
            Err(err) => {
                eprintln!("[backend] {backend_name} unavailable: {err:#}");
            }
        }
    }
    if active.is_empty() {
        bail!("no walk backend could be started");
    }
    Ok(active)
}

fn backend_names(backends: &[Box<dyn WalkBackend>]) -> String {
    backends
        .iter()
        .map(|backend| backend.name())
        .collect::<Vec<_>>()
        .join(",")
}

fn total_lanes(backends: &[Box<dyn WalkBackend>]) -> usize {
    backends.iter().map(|backend| backend.lanes()).sum()
}

fn format_hashrate(hps: f64) -> String {
    if hps >= 1_000_000_000.0 {
        return format!("{:.3} GH/s", hps / 1_000_000_000.0);
    }
    if hps >= 1_000_000.0 {
        return format!("{:.3} MH/s", hps / 1_000_000.0);
    }
    if hps >= 1_000.0 {
        return format!("{:.3} KH/s", hps / 1_000.0);
    }
    format!("{hps:.3} H/s")
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_hash_spec::HashParams;

    fn test_config() -> MinerConfig {
        MinerConfig {
            walk: WalkConfig {
                params: HashParams::new(5, 0).expect("valid params"),
                dp_bits: 8,
                lanes: 16,
                steps_per_dispatch: 64,
                max_dps_per_dispatch: 16,
            },
            backends: vec![BackendKind::Cpu],
            cpu_threads: 1,
            stats_interval: Duration::from_secs(3600),
            verify: false,
        }
    }

    #[test]
    fn format_hashrate_units() {
        assert_eq!(format_hashrate(5.0), "5.000 H/s");
        assert_eq!(format_hashrate(5_000.0), "5.000 KH/s");
        assert_eq!(format_hashrate(5_000_000.0), "5.000 MH/s");
        assert_eq!(format_hashrate(5_000_000_000.0), "5.000 GH/s");
    }

    #[test]
    fn walk_events_update_stats_and_pending() {
        let config = test_config();
        let mut stats = Stats::new();
        let mut pending = Vec::new();

        handle_walk_event(
            &config,
            WalkEvent::Hashes {
                backend: "cpu",
                count: 1000,
            },
            &mut stats,
            &mut pending,
        )
        .expect("hashes event");
        handle_walk_event(
            &config,
            WalkEvent::DistinguishedPoints {
                backend: "cpu",
                pairs: vec![DpPair {
                    start: vec![0x80, 1, 2, 3, 4],
                    dp: vec![0, 0, 1, 2, 3],
                }],
            },
            &mut stats,
            &mut pending,
        )
        .expect("dp event");
        handle_walk_event(
            &config,
            WalkEvent::DpOverflow {
                backend: "cpu",
                dropped: 3,
            },
            &mut stats,
            &mut pending,
        )
        .expect("overflow event");

        assert_eq!(stats.hashes, 1000);
        assert_eq!(stats.dps_found, 1);
        assert_eq!(stats.dps_dropped, 3);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn backend_errors_abort_the_loop() {
        let config = test_config();
        let mut stats = Stats::new();
        let mut pending = Vec::new();
        let result = handle_walk_event(
            &config,
            WalkEvent::Error {
                backend: "wgpu",
                message: "device lost".to_string(),
            },
            &mut stats,
            &mut pending,
        );
        assert!(result.is_err());
    }

    #[test]
    fn cpu_only_miner_builds_and_activates() {
        let config = test_config();
        let (event_tx, _event_rx) = unbounded();
        let mut backends =
            activate_backends(build_backends(&config), event_tx).expect("cpu backend activates");
        assert_eq!(backend_names(&backends), "cpu");
        assert_eq!(total_lanes(&backends), 1);
        for backend in &mut backends {
            backend.stop();
        }
    }
}
