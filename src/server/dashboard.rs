use std::fmt::Write as _;
use std::fs;

use anyhow::Result;

use crate::server::ServerState;

/// Window used to estimate the network hashrate from recent DPs.
const HASHRATE_WINDOW_SECS: i64 = 60;

/// Render the operator dashboard: search progress, per-user counts,
/// recent distinguished points and every pre-collision found so far.
pub fn render(state: &ServerState) -> Result<String> {
    let dp_bits = state.dp_bits;
    let hash_bits = state.params.total_bytes() as u32 * 8;

    let dps_found = state.store.dp_count()?;
    let dps_recent = state.store.recent_dp_count(HASHRATE_WINDOW_SECS)?;
    let collisions = state.store.collisions()?;
    let collision_count = state.store.collision_count()?;
    let users = state.store.users_by_dp_count()?;
    let recent = state.store.recent_dps(10)?;

    let per_dp = (2f64).powi(dp_bits as i32);
    let hashrate = dps_recent as f64 * per_dp / HASHRATE_WINDOW_SECS as f64;
    let approx_hashes = dps_found as f64 * per_dp;
    let space = (2f64).powi(hash_bits as i32);
    // Birthday bound: 50% success around sqrt(2 * ln2 * space).
    let breakeven_hashes = (space * 2.0 * std::f64::consts::LN_2).sqrt();
    let progress_percent = approx_hashes / breakeven_hashes * 100.0;
    let success_percent = (1.0 - (-approx_hashes * approx_hashes / (space * 2.0)).exp()) * 100.0;
    let eta = if hashrate > 0.0 {
        let remaining = breakeven_hashes - approx_hashes;
        format_eta(remaining / hashrate)
    } else {
        "never".to_string()
    };
    let db_size = fs::metadata(&state.db_path)
        .map(|m| format_bytes(m.len()))
        .unwrap_or_else(|_| "?".to_string());

    let mut html = String::new();
    html.push_str(
        "<!DOCTYPE html><html><head><title>weir</title>\
         <style>body{font-family:monospace;margin:2em}table{border-collapse:collapse}\
         td,th{border:1px solid #999;padding:0.2em 0.6em;text-align:left}\
         h2{margin-top:1.5em}</style></head><body>",
    );
    html.push_str("<h1>weir collision search</h1>");

    let _ = write!(
        html,
        "<p>Target collision length: {hash_bits} bits<br>\
         Distinguished point difficulty: {dp_bits} bits<br>\
         Database size: {db_size}</p>"
    );

    let _ = write!(
        html,
        "<h2>Progress</h2>\
         <p>Distinguished points found: {dps_found}<br>\
         Approximate hashes: {approx_hashes:.3e}<br>\
         Network hashrate: {}<br>\
         Break-even hashes: {breakeven_hashes:.3e} ({progress_percent:.1}% there, ETA {eta})<br>\
         Success probability so far: {success_percent:.2}%<br>\
         Pre-collisions found: {collision_count}</p>",
        format_hashrate(hashrate)
    );

    html.push_str("<h2>Users</h2><table><tr><th>user</th><th>DPs</th><th>~hashes</th></tr>");
    for (username, count) in &users {
        let _ = write!(
            html,
            "<tr><td>{}</td><td>{count}</td><td>{:.3e}</td></tr>",
            escape(username),
            *count as f64 * per_dp
        );
    }
    html.push_str("</table>");

    html.push_str(
        "<h2>Recent distinguished points</h2>\
         <table><tr><th>user</th><th>start</th><th>dp</th></tr>",
    );
    for dp in &recent {
        let _ = write!(
            html,
            "<tr><td>{}</td><td>{}</td><td>{}</td></tr>",
            escape(&dp.username),
            hex::encode(&dp.start),
            hex::encode(&dp.dp)
        );
    }
    html.push_str("</table>");

    html.push_str(
        "<h2>Pre-collisions</h2>\
         <table><tr><th>dp</th><th>start_a</th><th>start_b</th></tr>",
    );
    for collision in &collisions {
        let _ = write!(
            html,
            "<tr><td>{}</td><td>{}</td><td>{}</td></tr>",
            hex::encode(&collision.dp),
            hex::encode(&collision.start_a),
            hex::encode(&collision.start_b)
        );
    }
    html.push_str("</table></body></html>");

    Ok(html)
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

fn format_eta(seconds: f64) -> String {
    if !seconds.is_finite() || seconds <= 0.0 {
        return "now".to_string();
    }
    let secs = seconds as u64;
    let (days, rem) = (secs / 86_400, secs % 86_400);
    let (hours, rem) = (rem / 3_600, rem % 3_600);
    let (mins, secs) = (rem / 60, rem % 60);
    if days > 0 {
        format!("{days}d {hours:02}:{mins:02}:{secs:02}")
    } else {
        format!("{hours:02}:{mins:02}:{secs:02}")
    }
}

fn format_bytes(len: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = len as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{len} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
