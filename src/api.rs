use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;

use crate::backend::DpPair;
use crate::types::{SubmitRequest, SubmitResponse, WireResult};

const SUBMIT_RETRIES: u32 = 5;
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(500);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(8);

/// Submission failure taxonomy. Only `Transient` is worth retrying; the
/// other kinds will fail identically on a resend.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("bad username and/or usertoken")]
    AuthFailure,
    #[error("server rejected batch: {0}")]
    Rejected(String),
    #[error("transient error: {0}")]
    Transient(String),
}

#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    username: String,
    usertoken: String,
    client: reqwest::blocking::Client,
}

impl ApiClient {
    pub fn new(
        base_url: String,
        username: String,
        usertoken: String,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username,
            usertoken,
            client,
        })
    }

    pub fn submit_work(&self, pairs: &[DpPair]) -> Result<SubmitResponse, SubmitError> {
        let body = SubmitRequest {
            username: self.username.clone(),
            usertoken: self.usertoken.clone(),
            results: pairs.iter().map(WireResult::from_pair).collect(),
        };

        let response = self
            .client
            .post(format!("{}/submit_work", self.base_url))
            .json(&body)
            .send()
            .map_err(|err| SubmitError::Transient(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<SubmitResponse>()
                .map_err(|err| SubmitError::Transient(format!("bad response body: {err}")));
        }

        let detail = response
            .json::<SubmitResponse>()
            .map(|r| r.status)
            .unwrap_or_else(|_| status.to_string());

        match status.as_u16() {
            401 => Err(SubmitError::AuthFailure),
            400..=499 => Err(SubmitError::Rejected(detail)),
            _ => Err(SubmitError::Transient(detail)),
        }
    }

    /// Submit with bounded exponential backoff on transient failures.
    /// Auth and rejection errors are returned immediately; retrying them
    /// cannot succeed.
    pub fn submit_work_with_retry(&self, pairs: &[DpPair]) -> Result<SubmitResponse, SubmitError> {
        let mut backoff = RETRY_BACKOFF_BASE;
        let mut last_err = None;
        for attempt in 0..SUBMIT_RETRIES {
            match self.submit_work(pairs) {
                Ok(response) => return Ok(response),
                Err(SubmitError::Transient(msg)) => {
                    eprintln!(
                        "[submit] transient failure (attempt {}/{SUBMIT_RETRIES}): {msg}",
                        attempt + 1
                    );
                    last_err = Some(SubmitError::Transient(msg));
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(RETRY_BACKOFF_MAX);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| SubmitError::Transient("no attempts made".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client = ApiClient::new(
            "http://localhost:8080/".to_string(),
            "alice".to_string(),
            "token".to_string(),
            Duration::from_secs(5),
        )
        .expect("client should build");
        assert_eq!(client.base_url, "http://localhost:8080");
    }

    #[test]
    fn submit_to_unreachable_server_is_transient() {
        // Port 1 on loopback is not listening, so the connect fails fast.
        let client = ApiClient::new(
            "http://127.0.0.1:1".to_string(),
            "alice".to_string(),
            "token".to_string(),
            Duration::from_millis(200),
        )
        .expect("client should build");
        let pairs = [DpPair {
            start: vec![1, 2, 3, 4, 5],
            dp: vec![0, 0, 1, 2, 3],
        }];
        match client.submit_work(&pairs) {
            Err(SubmitError::Transient(_)) => {}
            other => panic!("expected transient error, got {other:?}"),
        }
    }
}
