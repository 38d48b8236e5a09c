use thiserror::Error;
use weir_hash_spec::{ascii_render, step, walk_to_dp, HashParams};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FinalizeError {
    /// The two starts lie on the same chain (or are equal); the shared
    /// distinguished point witnesses nothing.
    #[error("the two starts share a chain; no collision exists")]
    NoCollision,
    #[error("chain from start_{which} exceeded {limit} steps without reaching a distinguished point")]
    ChainTooLong { which: char, limit: u64 },
    #[error("chains end at different distinguished points ({dp_a} vs {dp_b})")]
    DifferentEndpoints { dp_a: String, dp_b: String },
}

/// Two distinct states whose walk-function images coincide. The ASCII
/// renderings are the colliding messages: their full SHA-256 digests agree
/// on the truncation's prefix and suffix bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollisionWitness {
    pub pre_a: Vec<u8>,
    pub pre_b: Vec<u8>,
    pub image: Vec<u8>,
    pub dp: Vec<u8>,
    pub len_a: u64,
    pub len_b: u64,
}

impl CollisionWitness {
    /// The colliding ASCII messages.
    pub fn messages(&self) -> (String, String) {
        (ascii_message(&self.pre_a), ascii_message(&self.pre_b))
    }
}

fn ascii_message(state: &[u8]) -> String {
    let mut out = vec![0u8; state.len() * 2];
    ascii_render(state, &mut out);
    String::from_utf8(out).expect("rendering is ASCII in 'A'..='P'")
}

/// Recover the collision witness from a pre-collision: walk both chains to
/// the distinguished point to learn their lengths, advance the longer one
/// until both are equidistant, then step in lockstep until they meet.
///
/// Deterministic and single-threaded; bounded by `max_steps` per chain
/// (expected chain length is 2^dp_bits).
pub fn finalize(
    params: &HashParams,
    dp_bits: u32,
    start_a: &[u8],
    start_b: &[u8],
    max_steps: u64,
) -> Result<CollisionWitness, FinalizeError> {
    if start_a == start_b {
        return Err(FinalizeError::NoCollision);
    }

    let (dp_a, len_a) = walk_to_dp(params, dp_bits, start_a, max_steps).ok_or(
        FinalizeError::ChainTooLong {
            which: 'a',
            limit: max_steps,
        },
    )?;
    let (dp_b, len_b) = walk_to_dp(params, dp_bits, start_b, max_steps).ok_or(
        FinalizeError::ChainTooLong {
            which: 'b',
            limit: max_steps,
        },
    )?;
    if dp_a != dp_b {
        return Err(FinalizeError::DifferentEndpoints {
            dp_a: hex::encode(&dp_a),
            dp_b: hex::encode(&dp_b),
        });
    }

    // Equalize distance to the shared dp.
    let mut cur_a = start_a.to_vec();
    let mut cur_b = start_b.to_vec();
    for _ in len_b..len_a {
        cur_a = step(params, &cur_a);
    }
    for _ in len_a..len_b {
        cur_b = step(params, &cur_b);
    }

    // Both chains now reach the dp in the same number of steps. Equal here
    // means the shorter start sits on the longer chain: the robin-hood
    // case, which carries no collision.
    if cur_a == cur_b {
        return Err(FinalizeError::NoCollision);
    }

    let remaining = len_a.min(len_b);
    for _ in 0..=remaining {
        let next_a = step(params, &cur_a);
        let next_b = step(params, &cur_b);
        if next_a == next_b {
            return Ok(CollisionWitness {
                pre_a: cur_a,
                pre_b: cur_b,
                image: next_a,
                dp: dp_a,
                len_a,
                len_b,
            });
        }
        cur_a = next_a;
        cur_b = next_b;
    }

    // Unreachable for chains that genuinely share the dp, but chains are
    // attacker-supplied; refuse rather than loop.
    Err(FinalizeError::NoCollision)
}
