use anyhow::Result;
use crossbeam_channel::Sender;
use weir_hash_spec::HashParams;

pub mod cpu;
pub mod wgpu;

/// Walk parameters shared by every backend. Chains advance in dispatches of
/// `steps_per_dispatch` iterations across `lanes` concurrent walks; at most
/// `max_dps_per_dispatch` distinguished points are collected per dispatch.
#[derive(Debug, Clone, Copy)]
pub struct WalkConfig {
    pub params: HashParams,
    pub dp_bits: u32,
    pub lanes: usize,
    pub steps_per_dispatch: u32,
    pub max_dps_per_dispatch: usize,
}

/// A reported chain: `dp` is the first distinguished point reachable from
/// `start` by iterating the walk function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpPair {
    pub start: Vec<u8>,
    pub dp: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum WalkEvent {
    DistinguishedPoints {
        backend: &'static str,
        pairs: Vec<DpPair>,
    },
    Hashes {
        backend: &'static str,
        count: u64,
    },
    /// The per-dispatch DP capacity overflowed and chains were dropped.
    /// Frequent overflows mean dp_bits is too low for the walk rate.
    DpOverflow {
        backend: &'static str,
        dropped: u64,
    },
    Error {
        backend: &'static str,
        message: String,
    },
}

pub trait WalkBackend: Send {
    fn name(&self) -> &'static str;

    fn lanes(&self) -> usize;

    fn set_event_sink(&mut self, sink: Sender<WalkEvent>);

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self);
}
