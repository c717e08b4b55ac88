use std::time::Instant;

use ledgerd_chainstate::LedgerAccessor;
use ledgerd_primitives::hash256_to_hex;
use ledgerd_sync::{PeerInfo, SyncManager};
use serde::Serialize;

use crate::logging;

#[derive(Clone, Debug, Serialize)]
pub struct StatsSnapshot {
    pub best_header_height: u32,
    pub best_block_height: u32,
    pub best_header_hash: String,
    pub best_block_hash: String,
    pub header_gap: u32,
    pub sync_state: String,
    pub sync_peers: usize,
    pub connected_peers: usize,
    pub header_flights: usize,
    pub block_flights: usize,
    pub cached_blocks: usize,
    pub uptime_ms: u64,
}

pub fn snapshot_stats<L: LedgerAccessor>(
    sync: &SyncManager<L>,
    start_time: Instant,
) -> Result<StatsSnapshot, String> {
    let progress = sync.snapshot();
    let ledger = sync.ledger();
    let best_block_hash = ledger
        .block_hash(progress.block_height)
        .map_err(|err| err.to_string())?;
    let sync_state = if progress.header_gap == 0 && progress.header_flights == 0 {
        "idle"
    } else {
        "syncing"
    };
    Ok(StatsSnapshot {
        best_header_height: progress.header_height,
        best_block_height: progress.block_height,
        best_header_hash: hash256_to_hex(&ledger.current_header_hash()),
        best_block_hash: hash256_to_hex(&best_block_hash),
        header_gap: progress.header_gap,
        sync_state: sync_state.to_string(),
        sync_peers: progress.sync_peers,
        connected_peers: sync.registry().count(),
        header_flights: progress.header_flights,
        block_flights: progress.block_flights,
        cached_blocks: progress.cached_blocks,
        uptime_ms: start_time.elapsed().as_millis().try_into().unwrap_or(u64::MAX),
    })
}

/// Header and block rates since the previous snapshot, formatted for the status line.
pub fn rates_from_last(current: &StatsSnapshot, last: Option<&StatsSnapshot>) -> (String, String) {
    let Some(prev) = last else {
        return ("-".to_string(), "-".to_string());
    };
    let delta_ms = current.uptime_ms.saturating_sub(prev.uptime_ms);
    if delta_ms == 0 {
        return ("-".to_string(), "-".to_string());
    }
    let secs = delta_ms as f64 / 1000.0;
    let headers = current
        .best_header_height
        .saturating_sub(prev.best_header_height);
    let blocks = current
        .best_block_height
        .saturating_sub(prev.best_block_height);
    (
        format!("{:.2}", f64::from(headers) / secs),
        format!("{:.2}", f64::from(blocks) / secs),
    )
}

pub fn status_line(stats: &StatsSnapshot, last: Option<&StatsSnapshot>) -> String {
    let (headers_per_sec, blocks_per_sec) = rates_from_last(stats, last);
    format!(
        "Status: headers {} blocks {} gap {} peers {} flights {}/{} cache {} h/s {} b/s {} header {} block {} uptime {}s",
        stats.best_header_height,
        stats.best_block_height,
        stats.header_gap,
        stats.sync_peers,
        stats.header_flights,
        stats.block_flights,
        stats.cached_blocks,
        headers_per_sec,
        blocks_per_sec,
        short_hex(&stats.best_header_hash),
        short_hex(&stats.best_block_hash),
        stats.uptime_ms / 1000
    )
}

fn short_hex(value: &str) -> &str {
    &value[..value.len().min(12)]
}

/// The newest captured warning and error lines, oldest first.
pub fn recent_warnings(scan: usize, keep: usize) -> Vec<String> {
    let mut lines: Vec<String> = logging::capture_snapshot(scan)
        .into_iter()
        .filter(|entry| entry.level <= logging::Level::Warn)
        .map(|entry| format!("{} {}: {}", entry.level.as_str(), entry.target, entry.msg))
        .collect();
    let excess = lines.len().saturating_sub(keep);
    lines.drain(..excess);
    lines
}

#[derive(Clone, Debug, Serialize)]
pub struct SourceReport {
    pub name: String,
    pub peer_id: u64,
    pub chain_height: u32,
    pub drop_percent: u8,
    pub corrupt: bool,
    pub connected: bool,
    pub sync_node: bool,
    pub timeouts: u32,
    pub error_responses: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub outcome: String,
    pub completed: bool,
    pub target_height: u32,
    pub elapsed_ms: u64,
    pub local: StatsSnapshot,
    pub peers: Vec<PeerInfo>,
    pub sources: Vec<SourceReport>,
    pub recent_warnings: Vec<String>,
}

impl RunReport {
    pub fn to_json(&self) -> Result<String, String> {
        serde_json::to_string_pretty(self).map_err(|err| err.to_string())
    }

    pub fn render_text(&self) -> String {
        let mut lines = vec![
            format!("outcome: {}", self.outcome),
            format!(
                "blocks: {} / {} (headers {})",
                self.local.best_block_height, self.target_height, self.local.best_header_height
            ),
            format!("best block: {}", self.local.best_block_hash),
            format!("elapsed: {}ms", self.elapsed_ms),
        ];
        for source in &self.sources {
            let mut faults = Vec::new();
            if source.drop_percent > 0 {
                faults.push(format!("drops {}%", source.drop_percent));
            }
            if source.corrupt {
                faults.push("corrupt".to_string());
            }
            let faults = if faults.is_empty() {
                "honest".to_string()
            } else {
                faults.join(", ")
            };
            lines.push(format!(
                "  {} (peer {}): height {} {} connected={} sync_node={} timeouts={} errors={}",
                source.name,
                source.peer_id,
                source.chain_height,
                faults,
                source.connected,
                source.sync_node,
                source.timeouts,
                source.error_responses
            ));
        }
        if !self.recent_warnings.is_empty() {
            lines.push("recent warnings:".to_string());
            for warning in &self.recent_warnings {
                lines.push(format!("  {warning}"));
            }
        }
        lines.join("\n")
    }
}
