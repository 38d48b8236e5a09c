mod api;
mod backend;
mod config;
mod finalize;
mod miner;
mod server;
mod types;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use sha2::{Digest, Sha256};
use weir_hash_spec::HashParams;

use api::ApiClient;
use backend::WalkConfig;
use config::{Cli, Command};
use miner::MinerConfig;
use server::db::CollisionStore;
use server::ServerConfig;
use types::decode_hex;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn main() {
    if let Err(err) = run() {
        eprintln!("fatal: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Server {
            host,
            port,
            db,
            dp_bits,
            hash_prefix_bytes,
            hash_suffix_bytes,
            threads,
        } => {
            let params = HashParams::new(hash_prefix_bytes, hash_suffix_bytes)?;
            let shutdown = install_shutdown_handler()?;
            server::run(
                ServerConfig {
                    host,
                    port,
                    db_path: db,
                    params,
                    dp_bits,
                    handler_threads: threads,
                },
                shutdown,
            )
        }

        Command::Mine {
            username,
            usertoken,
            server,
            dp_bits,
            hash_prefix_bytes,
            hash_suffix_bytes,
            backends,
            lanes,
            steps,
            max_dps,
            cpu_threads,
            dry_run,
            verify,
            stats_interval,
        } => {
            let params = HashParams::new(hash_prefix_bytes, hash_suffix_bytes)?;
            let client = if dry_run {
                None
            } else {
                let (Some(username), Some(usertoken)) = (username, usertoken) else {
                    bail!("username and usertoken are required unless --dry-run is given");
                };
                Some(ApiClient::new(server, username, usertoken, REQUEST_TIMEOUT)?)
            };

            let config = MinerConfig {
                walk: WalkConfig {
                    params,
                    dp_bits,
                    lanes,
                    steps_per_dispatch: steps,
                    max_dps_per_dispatch: max_dps,
                },
                backends,
                cpu_threads: cpu_threads.unwrap_or_else(num_cpus::get),
                stats_interval: Duration::from_secs(stats_interval.max(1)),
                verify,
            };
            let shutdown = install_shutdown_handler()?;
            miner::run(&config, client, &shutdown)
        }

        Command::Finalize {
            start_a,
            start_b,
            dp_bits,
            hash_prefix_bytes,
            hash_suffix_bytes,
            max_steps,
        } => {
            let params = HashParams::new(hash_prefix_bytes, hash_suffix_bytes)?;
            run_finalize(&params, dp_bits, &start_a, &start_b, max_steps)
        }

        Command::CreateUser {
            username,
            password,
            db,
        } => run_create_user(&db, &username, password),
    }
}

fn run_finalize(
    params: &HashParams,
    dp_bits: u32,
    start_a_hex: &str,
    start_b_hex: &str,
    max_steps: Option<u64>,
) -> Result<()> {
    let start_a = decode_hex(start_a_hex, "start_a")?;
    let start_b = decode_hex(start_b_hex, "start_b")?;
    let total = params.total_bytes();
    if start_a.len() != total || start_b.len() != total {
        bail!("both starting points must be {total} bytes ({} hex chars)", total * 2);
    }

    let max_steps = max_steps
        .unwrap_or_else(|| 1u64.checked_shl(dp_bits + 8).unwrap_or(u64::MAX));
    let witness = finalize::finalize(params, dp_bits, &start_a, &start_b, max_steps)
        .context("finalization failed")?;

    let (msg_a, msg_b) = witness.messages();
    let digest_a: [u8; 32] = Sha256::digest(msg_a.as_bytes()).into();
    let digest_b: [u8; 32] = Sha256::digest(msg_b.as_bytes()).into();

    println!("distinguished point: {}", hex::encode(&witness.dp));
    println!(
        "chain lengths: {} (start_a) / {} (start_b)",
        witness.len_a, witness.len_b
    );
    println!("collision: {msg_a} {msg_b} -> {}", hex::encode(&witness.image));
    println!("  sha256({msg_a}) = {}", hex::encode(digest_a));
    println!("  sha256({msg_b}) = {}", hex::encode(digest_b));
    println!(
        "  digests agree on the first {} and last {} bytes",
        params.prefix_bytes(),
        params.suffix_bytes()
    );
    Ok(())
}

fn run_create_user(db: &PathBuf, username: &str, password: Option<String>) -> Result<()> {
    let token = password.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let store = CollisionStore::open(db)?;
    store.create_user(username, &token)?;
    println!("created user '{username}'");
    println!("token: {token}");
    println!("(only a hash of the token is stored; keep this copy)");
    Ok(())
}

fn install_shutdown_handler() -> Result<Arc<AtomicBool>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })?;
    }
    Ok(shutdown)
}
