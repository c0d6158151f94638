//! Prometheus counters and gauges.
//!
//! Metrics register themselves on first use via `OnceLock` accessors so
//! call sites stay one-liners. `render()` returns the text exposition for
//! whatever endpoint the embedding process wires up.

use std::sync::OnceLock;

use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntGauge, TextEncoder};

static ACCEPTED: OnceLock<IntCounter> = OnceLock::new();
static REJECTED: OnceLock<IntCounter> = OnceLock::new();
static BLOCKS_FOUND: OnceLock<IntCounter> = OnceLock::new();
static BLOCK_SUBMITS_FAILED: OnceLock<IntCounter> = OnceLock::new();
static VARDIFF_RETARGETS: OnceLock<IntCounter> = OnceLock::new();
static JOB_BROADCASTS: OnceLock<IntCounter> = OnceLock::new();
static RPC_REQUESTS: OnceLock<IntCounter> = OnceLock::new();
static RPC_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static RELAY_PUBLISHED: OnceLock<IntCounter> = OnceLock::new();
static RELAY_RECEIVED: OnceLock<IntCounter> = OnceLock::new();

static ACTIVE_CONNECTIONS: OnceLock<IntGauge> = OnceLock::new();
static TEMPLATE_HEIGHT: OnceLock<IntGauge> = OnceLock::new();

fn accepted() -> &'static IntCounter {
    ACCEPTED.get_or_init(|| {
        IntCounter::new("shares_accepted_total", "Total accepted shares").unwrap()
    })
}

fn rejected() -> &'static IntCounter {
    REJECTED.get_or_init(|| {
        IntCounter::new("shares_rejected_total", "Total rejected shares").unwrap()
    })
}

fn blocks_found() -> &'static IntCounter {
    BLOCKS_FOUND.get_or_init(|| {
        IntCounter::new("blocks_found_total", "Blocks accepted by a daemon").unwrap()
    })
}

fn block_submits_failed() -> &'static IntCounter {
    BLOCK_SUBMITS_FAILED.get_or_init(|| {
        IntCounter::new("block_submits_failed_total", "Block submissions rejected").unwrap()
    })
}

fn vardiff_retargets() -> &'static IntCounter {
    VARDIFF_RETARGETS.get_or_init(|| {
        IntCounter::new("vardiff_retargets_total", "Vardiff retarget events").unwrap()
    })
}

fn job_broadcasts() -> &'static IntCounter {
    JOB_BROADCASTS.get_or_init(|| {
        IntCounter::new("job_broadcasts_total", "Job notifications broadcast").unwrap()
    })
}

fn rpc_requests() -> &'static IntCounter {
    RPC_REQUESTS.get_or_init(|| {
        IntCounter::new("daemon_rpc_requests_total", "Daemon RPC requests").unwrap()
    })
}

fn rpc_errors() -> &'static IntCounter {
    RPC_ERRORS.get_or_init(|| {
        IntCounter::new("daemon_rpc_errors_total", "Daemon RPC failures").unwrap()
    })
}

fn relay_published() -> &'static IntCounter {
    RELAY_PUBLISHED.get_or_init(|| {
        IntCounter::new("relay_shares_published_total", "Shares published to the relay").unwrap()
    })
}

fn relay_received() -> &'static IntCounter {
    RELAY_RECEIVED.get_or_init(|| {
        IntCounter::new("relay_shares_received_total", "Shares received from remote relays")
            .unwrap()
    })
}

fn active_connections() -> &'static IntGauge {
    ACTIVE_CONNECTIONS.get_or_init(|| {
        IntGauge::new("stratum_connections", "Live stratum sessions").unwrap()
    })
}

fn template_height() -> &'static IntGauge {
    TEMPLATE_HEIGHT.get_or_init(|| {
        IntGauge::new("job_template_height", "Height of the newest job").unwrap()
    })
}

pub fn inc_accepted() {
    accepted().inc();
}

pub fn inc_rejected() {
    rejected().inc();
}

pub fn inc_blocks_found() {
    blocks_found().inc();
}

pub fn inc_block_submits_failed() {
    block_submits_failed().inc();
}

pub fn inc_vardiff_retargets() {
    vardiff_retargets().inc();
}

pub fn inc_job_broadcasts() {
    job_broadcasts().inc();
}

pub fn inc_rpc_requests() {
    rpc_requests().inc();
}

pub fn inc_rpc_errors() {
    rpc_errors().inc();
}

pub fn inc_relay_published() {
    relay_published().inc();
}

pub fn inc_relay_received() {
    relay_received().inc();
}

pub fn inc_connections() {
    active_connections().inc();
}

pub fn dec_connections() {
    active_connections().dec();
}

pub fn set_template_height(height: u64) {
    template_height().set(height as i64);
}

/// Text exposition of every metric touched so far.
pub fn render() -> String {
    let mut families = Vec::new();
    families.extend(accepted().collect());
    families.extend(rejected().collect());
    families.extend(blocks_found().collect());
    families.extend(block_submits_failed().collect());
    families.extend(vardiff_retargets().collect());
    families.extend(job_broadcasts().collect());
    families.extend(rpc_requests().collect());
    families.extend(rpc_errors().collect());
    families.extend(relay_published().collect());
    families.extend(relay_received().collect());
    families.extend(active_connections().collect());
    families.extend(template_height().collect());

    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
