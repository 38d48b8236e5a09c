use std::fmt;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Upper bound on `prefix_bytes + suffix_bytes`. Keeps the ASCII rendering
/// (two characters per byte) inside a single 512-bit SHA-256 block.
pub const MAX_TOTAL_BYTES: usize = 27;
pub const MIN_TOTAL_BYTES: usize = 5;
/// Longest possible ASCII rendering (`2 * MAX_TOTAL_BYTES`).
pub const MAX_ASCII_BYTES: usize = MAX_TOTAL_BYTES * 2;
/// Words needed for the widest state.
pub const MAX_STATE_WORDS: usize = (MAX_TOTAL_BYTES + 3) / 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamsError {
    #[error("prefix_bytes must be 1-32, got {0}")]
    BadPrefix(usize),
    #[error("suffix_bytes must be 0-32, got {0}")]
    BadSuffix(usize),
    #[error("prefix+suffix must be {MIN_TOTAL_BYTES}-{MAX_TOTAL_BYTES} bytes, got {0}")]
    BadTotal(usize),
}

/// Truncation scheme for the walk function: keep the first `prefix_bytes`
/// and the last `suffix_bytes` of each 32-byte SHA-256 digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashParams {
    prefix_bytes: usize,
    suffix_bytes: usize,
}

impl HashParams {
    pub fn new(prefix_bytes: usize, suffix_bytes: usize) -> Result<Self, ParamsError> {
        if !(1..=32).contains(&prefix_bytes) {
            return Err(ParamsError::BadPrefix(prefix_bytes));
        }
        if suffix_bytes > 32 {
            return Err(ParamsError::BadSuffix(suffix_bytes));
        }
        let total = prefix_bytes + suffix_bytes;
        if !(MIN_TOTAL_BYTES..=MAX_TOTAL_BYTES).contains(&total) {
            return Err(ParamsError::BadTotal(total));
        }
        Ok(Self {
            prefix_bytes,
            suffix_bytes,
        })
    }

    pub fn prefix_bytes(&self) -> usize {
        self.prefix_bytes
    }

    pub fn suffix_bytes(&self) -> usize {
        self.suffix_bytes
    }

    /// Length in bytes of a truncated state.
    pub fn total_bytes(&self) -> usize {
        self.prefix_bytes + self.suffix_bytes
    }

    /// Length in bytes of the ASCII rendering fed to SHA-256.
    pub fn ascii_bytes(&self) -> usize {
        self.total_bytes() * 2
    }

    /// Number of big-endian u32 words holding one state on a compute device.
    pub fn num_words(&self) -> usize {
        (self.total_bytes() + 3) / 4
    }

    /// Truncate a full 32-byte digest to `total_bytes`.
    pub fn truncate_digest(&self, digest: &[u8; 32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_bytes());
        out.extend_from_slice(&digest[..self.prefix_bytes]);
        out.extend_from_slice(&digest[32 - self.suffix_bytes..]);
        out
    }
}

impl fmt::Display for HashParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.suffix_bytes == 0 {
            write!(f, "prefix={}B", self.prefix_bytes)
        } else {
            write!(
                f,
                "prefix={}B+suffix={}B",
                self.prefix_bytes, self.suffix_bytes
            )
        }
    }
}

/// Render a state as its ASCII form: each byte becomes two characters in
/// `'A'..='P'` (high nibble first, nibble + 0x41).
pub fn ascii_render(state: &[u8], out: &mut [u8]) {
    debug_assert!(out.len() >= state.len() * 2);
    for (i, &b) in state.iter().enumerate() {
        out[2 * i] = (b >> 4) + 0x41;
        out[2 * i + 1] = (b & 0x0F) + 0x41;
    }
}

/// One application of the walk function `F`: hash the ASCII rendering of
/// `state` and truncate the digest. `state` and `out` are `total_bytes`
/// long and may not alias.
pub fn step_into(params: &HashParams, state: &[u8], out: &mut [u8]) {
    debug_assert_eq!(state.len(), params.total_bytes());
    debug_assert_eq!(out.len(), params.total_bytes());
    let mut ascii = [0u8; MAX_ASCII_BYTES];
    let n = params.ascii_bytes();
    ascii_render(state, &mut ascii[..n]);
    let digest: [u8; 32] = Sha256::digest(&ascii[..n]).into();
    out[..params.prefix_bytes].copy_from_slice(&digest[..params.prefix_bytes]);
    out[params.prefix_bytes..].copy_from_slice(&digest[32 - params.suffix_bytes..]);
}

/// Allocating convenience wrapper around [`step_into`].
pub fn step(params: &HashParams, state: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; params.total_bytes()];
    step_into(params, state, &mut out);
    out
}

/// A state is distinguished when its leading `dp_bits` bits are zero.
pub fn is_distinguished(state: &[u8], dp_bits: u32) -> bool {
    let mut remaining = dp_bits;
    for &b in state {
        if remaining == 0 {
            return true;
        }
        if remaining >= 8 {
            if b != 0 {
                return false;
            }
            remaining -= 8;
        } else {
            return b.leading_zeros() >= remaining;
        }
    }
    remaining == 0
}

/// Mask pair for the word-level DP check used by compute kernels:
/// `(word0 & mask0) == 0 && (word1 & mask1) == 0` iff the leading
/// `dp_bits` bits are zero. Saturates to `(0, 0)` at `dp_bits = 0`.
pub fn dp_masks(dp_bits: u32) -> (u32, u32) {
    let bits = u64::from(dp_bits);
    if bits <= 32 {
        let mask0 = ((0xFFFF_FFFFu64 << (32 - bits)) & 0xFFFF_FFFF) as u32;
        (mask0, 0)
    } else {
        let mask1 = ((0xFFFF_FFFFu64 << (64 - bits.min(64))) & 0xFFFF_FFFF) as u32;
        (0xFFFF_FFFF, mask1)
    }
}

/// Pack a state into big-endian u32 words, zero-padding the tail word.
pub fn state_to_words(params: &HashParams, state: &[u8], words: &mut [u32]) {
    debug_assert_eq!(state.len(), params.total_bytes());
    debug_assert_eq!(words.len(), params.num_words());
    for (w, word) in words.iter_mut().enumerate() {
        let mut v = 0u32;
        for b in 0..4 {
            let idx = w * 4 + b;
            let byte = if idx < state.len() { state[idx] } else { 0 };
            v = (v << 8) | u32::from(byte);
        }
        *word = v;
    }
}

/// Inverse of [`state_to_words`]: take `total_bytes` bytes from big-endian
/// words, discarding any tail padding.
pub fn words_to_state(params: &HashParams, words: &[u32]) -> Vec<u8> {
    debug_assert_eq!(words.len(), params.num_words());
    let mut out = Vec::with_capacity(params.num_words() * 4);
    for word in words {
        out.extend_from_slice(&word.to_be_bytes());
    }
    out.truncate(params.total_bytes());
    out
}

/// Walk a chain from `start` until the first distinguished point, bounded
/// by `max_steps` applications of `F`. Returns the DP and the number of
/// steps taken, or `None` if the bound was exhausted first. A `start` that
/// is itself distinguished is a zero-length chain.
pub fn walk_to_dp(
    params: &HashParams,
    dp_bits: u32,
    start: &[u8],
    max_steps: u64,
) -> Option<(Vec<u8>, u64)> {
    let mut cur = start.to_vec();
    let mut next = vec![0u8; params.total_bytes()];
    let mut steps = 0u64;
    while !is_distinguished(&cur, dp_bits) {
        if steps >= max_steps {
            return None;
        }
        step_into(params, &cur, &mut next);
        std::mem::swap(&mut cur, &mut next);
        steps += 1;
    }
    Some((cur, steps))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(prefix: usize, suffix: usize) -> HashParams {
        HashParams::new(prefix, suffix).expect("valid test params")
    }

    #[test]
    fn rejects_out_of_range_params() {
        assert_eq!(HashParams::new(0, 5), Err(ParamsError::BadPrefix(0)));
        assert_eq!(HashParams::new(33, 0), Err(ParamsError::BadPrefix(33)));
        assert_eq!(HashParams::new(8, 33), Err(ParamsError::BadSuffix(33)));
        assert_eq!(HashParams::new(2, 2), Err(ParamsError::BadTotal(4)));
        assert_eq!(HashParams::new(20, 20), Err(ParamsError::BadTotal(40)));
        assert!(HashParams::new(8, 0).is_ok());
        assert!(HashParams::new(1, 26).is_ok());
    }

    #[test]
    fn ascii_rendering_matches_reference() {
        let state = hex_literal("4443504d4c424149");
        let mut out = [0u8; 16];
        ascii_render(&state, &mut out);
        assert_eq!(&out, b"EEEDFAENEMECEBEJ");
    }

    #[test]
    fn single_step_matches_reference_digest() {
        // SHA-256("EEEDFAENEMECEBEJ") =
        // 9faaef516feef95f509beeb5a76c740ede5855965dfff06cb4ef9b5c8ae145ef
        let start = hex_literal("4443504d4c424149");
        assert_eq!(step(&params(8, 0), &start), hex_literal("9faaef516feef95f"));
        assert_eq!(step(&params(6, 2), &start), hex_literal("9faaef516fee45ef"));
        assert_eq!(
            step(&params(7, 0), &start[..7]),
            hex_literal("d67f5d661706df")
        );
        assert_eq!(
            step(&params(5, 0), &hex_literal("0102030405")),
            hex_literal("b47096059a")
        );
    }

    #[test]
    fn iterated_walk_matches_pinned_chain() {
        let p = params(8, 0);
        let mut state = hex_literal("4443504d4c424149");
        let mut expected_at = vec![
            (100u32, hex_literal("15ab1c332bf71a58")),
            (10, hex_literal("53ed248c8e97e6c3")),
            (2, hex_literal("a3cfee677bfb0303")),
        ];
        for i in 1..=100u32 {
            state = step(&p, &state);
            if let Some((at, want)) = expected_at.last() {
                if *at == i {
                    assert_eq!(&state, want, "mismatch at iteration {i}");
                    expected_at.pop();
                }
            }
        }
        assert!(expected_at.is_empty());
    }

    #[test]
    fn prefix_suffix_walk_matches_pinned_chain() {
        let p = params(6, 2);
        let mut state = hex_literal("4443504d4c424149");
        for _ in 0..100 {
            state = step(&p, &state);
        }
        assert_eq!(state, hex_literal("a8238777aff51aee"));
    }

    #[test]
    fn truncation_overlap_between_prefix_only_and_prefix_suffix() {
        // Where the two schemes both keep a digest byte they must agree.
        let digest: [u8; 32] = core::array::from_fn(|i| (i as u8).wrapping_mul(17));
        let whole = params(8, 0).truncate_digest(&digest);
        let split = params(6, 2).truncate_digest(&digest);
        assert_eq!(whole[..6], split[..6]);
        assert_eq!(&split[6..], &digest[30..]);
    }

    #[test]
    fn dp_mask_table() {
        assert_eq!(dp_masks(0), (0, 0));
        assert_eq!(dp_masks(1), (0x8000_0000, 0));
        assert_eq!(dp_masks(15), (0xFFFE_0000, 0));
        assert_eq!(dp_masks(16), (0xFFFF_0000, 0));
        assert_eq!(dp_masks(32), (0xFFFF_FFFF, 0));
        assert_eq!(dp_masks(33), (0xFFFF_FFFF, 0x8000_0000));
        assert_eq!(dp_masks(48), (0xFFFF_FFFF, 0xFFFF_0000));
    }

    #[test]
    fn mask_predicate_agrees_with_byte_predicate() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let p = params(8, 0);
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut words = [0u32; 2];
        for dp_bits in [0u32, 1, 7, 15, 16, 23, 32, 33, 48] {
            let (mask0, mask1) = dp_masks(dp_bits);
            for _ in 0..2000 {
                // Bias toward leading zeros so high dp_bits get coverage.
                let zero_bytes = rng.gen_range(0..=8usize);
                let mut state = [0u8; 8];
                rng.fill(&mut state[zero_bytes..]);
                state_to_words(&p, &state, &mut words);
                let by_mask = (words[0] & mask0) == 0 && (words[1] & mask1) == 0;
                assert_eq!(
                    by_mask,
                    is_distinguished(&state, dp_bits),
                    "dp_bits={dp_bits} state={state:02x?}"
                );
            }
        }
    }

    #[test]
    fn predicate_frequency_is_near_expected() {
        // Pseudo-random but reproducible states: the leading 8 bytes of
        // SHA-256 over a little-endian counter.
        const N: usize = 1_000_000;
        let mut hits = [0u64; 3]; // dp_bits 1, 8, 16
        let mut high_hits = 0u64; // dp_bits 32
        for i in 0..N as u64 {
            let digest: [u8; 32] = Sha256::digest(i.to_le_bytes()).into();
            let state = &digest[..8];
            for (slot, bits) in [(0usize, 1u32), (1, 8), (2, 16)] {
                if is_distinguished(state, bits) {
                    hits[slot] += 1;
                }
            }
            if is_distinguished(state, 32) {
                high_hits += 1;
            }
        }
        for (slot, bits) in [(0usize, 1u32), (1, 8), (2, 16)] {
            let p = (2f64).powi(-(bits as i32));
            let mean = p * N as f64;
            let sigma = (N as f64 * p * (1.0 - p)).sqrt();
            let got = hits[slot] as f64;
            assert!(
                (got - mean).abs() <= 3.0 * sigma,
                "dp_bits={bits}: {got} hits, expected {mean:.1} +/- {:.1}",
                3.0 * sigma
            );
        }
        // Essentially impossible at 2^-32 per draw.
        assert!(high_hits <= 2, "dp_bits=32 hit {high_hits} times in 10^6 draws");

        // dp_bits = 0 matches everything.
        assert!(is_distinguished(&[0xFF; 8], 0));
    }

    #[test]
    fn word_packing_round_trips() {
        let aligned = params(8, 0);
        let mut words = [0u32; 2];
        let state = hex_literal("0123456789abcdef");
        state_to_words(&aligned, &state, &mut words);
        assert_eq!(words, [0x01234567, 0x89abcdef]);
        assert_eq!(words_to_state(&aligned, &words), state);

        let unaligned = params(7, 0);
        let mut words = [0u32; 2];
        let state = hex_literal("0123456789abcd");
        state_to_words(&unaligned, &state, &mut words);
        assert_eq!(words, [0x01234567, 0x89abcd00]);
        assert_eq!(words_to_state(&unaligned, &words), state);
    }

    #[test]
    fn walk_to_dp_counts_steps_and_honors_bound() {
        let p = params(5, 0);
        let start = hex_literal("b2a3edfbf3");
        let (dp, len) = walk_to_dp(&p, 8, &start, 10_000).expect("chain should terminate");
        assert_eq!(dp, hex_literal("00a5be6dac"));
        assert_eq!(len, 406);
        assert!(is_distinguished(&dp, 8));
        assert!(walk_to_dp(&p, 8, &start, 100).is_none());

        // A distinguished start is a zero-length chain.
        let (dp2, len2) = walk_to_dp(&p, 8, &dp, 10).expect("already distinguished");
        assert_eq!(len2, 0);
        assert_eq!(dp2, dp);
    }

    fn hex_literal(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).expect("valid hex literal"))
            .collect()
    }
}
