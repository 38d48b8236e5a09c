use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::DpPair;

/// Body of `POST /submit_work`. `results` carries hex-encoded chains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub username: String,
    pub usertoken: String,
    pub results: Vec<WireResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireResult {
    pub start: String,
    pub dp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub status: String,
}

impl WireResult {
    pub fn from_pair(pair: &DpPair) -> Self {
        Self {
            start: hex::encode(&pair.start),
            dp: hex::encode(&pair.dp),
        }
    }
}

/// Decode a hex field, accepting either case; `what` names the field for
/// error context.
pub fn decode_hex(value: &str, what: &str) -> Result<Vec<u8>> {
    hex::decode(value).with_context(|| format!("invalid hex in {what}"))
}
