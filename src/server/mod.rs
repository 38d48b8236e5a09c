use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tiny_http::{Header, Method, Response};
use weir_hash_spec::{is_distinguished, HashParams};

use crate::types::SubmitResponse;

pub mod dashboard;
pub mod db;

use db::{CollisionStore, DpOutcome};

const RECV_POLL: Duration = Duration::from_millis(250);
const MAX_BODY_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub params: HashParams,
    pub dp_bits: u32,
    pub handler_threads: usize,
}

pub struct ServerState {
    store: CollisionStore,
    params: HashParams,
    dp_bits: u32,
    db_path: PathBuf,
}

impl ServerState {
    pub fn new(store: CollisionStore, params: HashParams, dp_bits: u32, db_path: PathBuf) -> Self {
        Self {
            store,
            params,
            dp_bits,
            db_path,
        }
    }
}

/// Run the collision server until the shutdown flag is raised. Requests
/// are drained by a fixed pool of handler threads sharing the listener.
pub fn run(config: ServerConfig, shutdown: Arc<AtomicBool>) -> Result<()> {
    let store = CollisionStore::open(&config.db_path)?;
    let state = Arc::new(ServerState::new(
        store,
        config.params,
        config.dp_bits,
        config.db_path.clone(),
    ));

    let addr = format!("{}:{}", config.host, config.port);
    let server =
        tiny_http::Server::http(addr.as_str()).map_err(|err| anyhow!("failed to bind {addr}: {err}"))?;
    let server = Arc::new(server);

    println!(
        "[server] listening on http://{addr} | {} | dp_bits={} | db={}",
        config.params,
        config.dp_bits,
        config.db_path.display()
    );

    let mut handles = Vec::new();
    for idx in 0..config.handler_threads.max(1) {
        let server = Arc::clone(&server);
        let state = Arc::clone(&state);
        let shutdown = Arc::clone(&shutdown);
        handles.push(
            thread::Builder::new()
                .name(format!("weir-http-{idx}"))
                .spawn(move || {
                    while !shutdown.load(Ordering::Relaxed) {
                        match server.recv_timeout(RECV_POLL) {
                            Ok(Some(request)) => handle_request(&state, request),
                            Ok(None) => {}
                            Err(err) => {
                                eprintln!("[server] recv failed: {err}");
                                break;
                            }
                        }
                    }
                })
                .context("failed to spawn http worker")?,
        );
    }

    for handle in handles {
        let _ = handle.join();
    }
    println!("[server] stopped");
    Ok(())
}

fn handle_request(state: &ServerState, mut request: tiny_http::Request) {
    let method = request.method().clone();
    let url = request.url().to_string();

    let (code, body, content_type) = match (&method, url.as_str()) {
        (Method::Post, "/submit_work") => {
            let mut body = String::new();
            let read_ok = request
                .as_reader()
                .take(MAX_BODY_BYTES)
                .read_to_string(&mut body)
                .is_ok();
            let (code, status) = if read_ok {
                process_submission(state, &body)
            } else {
                (400, "bad request".to_string())
            };
            (code, json_status(&status), "application/json")
        }
        (Method::Get, "/") => match dashboard::render(state) {
            Ok(html) => (200, html, "text/html; charset=utf-8"),
            Err(err) => {
                eprintln!("[server] dashboard render failed: {err:#}");
                (500, json_status("transient server error"), "application/json")
            }
        },
        _ => (404, json_status("not found"), "application/json"),
    };

    let header = Header::from_bytes(&b"Content-Type"[..], content_type.as_bytes())
        .expect("static content-type header");
    let response = Response::from_string(body)
        .with_status_code(code)
        .with_header(header);
    // A failed respond means the client went away; the transaction for the
    // batch has already committed or not as a whole.
    let _ = request.respond(response);
}

/// Validate and fold one submission. Returns the HTTP status code and the
/// wire status string.
///
/// Rejection taxonomy: malformed body or missing top-level fields are a
/// `bad request`; a result entry that is not `{start, dp}` strings is
/// `invalid result data format`; hex that does not decode to exactly
/// `total_bytes` is `bad hash length`. A single bad record rejects the
/// whole batch before anything is written.
fn process_submission(state: &ServerState, body: &str) -> (u16, String) {
    let started = Instant::now();

    let value: serde_json::Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) => return (400, "bad request".to_string()),
    };
    let (Some(username), Some(usertoken), Some(results)) = (
        value.get("username").and_then(serde_json::Value::as_str),
        value.get("usertoken").and_then(serde_json::Value::as_str),
        value.get("results").and_then(serde_json::Value::as_array),
    ) else {
        return (400, "bad request".to_string());
    };
    if results.is_empty() {
        return (400, "bad request".to_string());
    }

    match state.store.authenticate(username, usertoken) {
        Ok(true) => {}
        Ok(false) => return (401, "bad username and/or usertoken".to_string()),
        Err(err) => {
            eprintln!("[server] auth lookup failed: {err:#}");
            return (500, "transient server error".to_string());
        }
    }

    let total_bytes = state.params.total_bytes();
    let mut decoded = Vec::with_capacity(results.len());
    for result in results {
        let (Some(start_hex), Some(dp_hex)) = (
            result.get("start").and_then(serde_json::Value::as_str),
            result.get("dp").and_then(serde_json::Value::as_str),
        ) else {
            return (400, "invalid result data format".to_string());
        };
        let (start, dp) = match (hex::decode(start_hex), hex::decode(dp_hex)) {
            (Ok(start), Ok(dp)) => (start, dp),
            _ => return (400, "bad hash length".to_string()),
        };
        if start.len() != total_bytes || dp.len() != total_bytes {
            return (400, "bad hash length".to_string());
        }
        decoded.push((start, dp));
    }

    // A dp that fails the server's predicate is a misconfigured worker;
    // drop it silently so it cannot pollute the table, but leave a trace
    // for the operator.
    let mut records = Vec::with_capacity(decoded.len());
    for (start, dp) in decoded {
        if !is_distinguished(&dp, state.dp_bits) {
            eprintln!(
                "[server] dropping non-distinguished dp {} from user '{username}' (dp_bits={})",
                hex::encode(&dp),
                state.dp_bits
            );
            continue;
        }
        records.push((dp, start));
    }

    let outcomes = match state.store.insert_batch(&records, username) {
        Ok(outcomes) => outcomes,
        Err(err) => {
            eprintln!("[server] insert failed: {err:#}");
            return (500, "transient server error".to_string());
        }
    };

    let mut accepted = 0u64;
    for ((dp, start), outcome) in records.iter().zip(&outcomes) {
        match outcome {
            DpOutcome::Inserted => accepted += 1,
            DpOutcome::Duplicate | DpOutcome::AlreadyCollided => {}
            DpOutcome::NewCollision { existing_start } => {
                accepted += 1;
                println!(
                    "[server] COLLISION FOUND! dp={} start_a={} start_b={}",
                    hex::encode(dp),
                    hex::encode(existing_start),
                    hex::encode(start)
                );
            }
        }
    }

    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    (200, format!("accepted {accepted} results in {elapsed_ms:.2}ms"))
}

fn json_status(status: &str) -> String {
    serde_json::to_string(&SubmitResponse {
        status: status.to_string(),
    })
    .expect("status serializes")
}
