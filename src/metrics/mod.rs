//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Sequence reservations and repairs
//! - Fee estimation and replacements
//! - Submission attempts and outcomes

use crate::error::{SubmitterError, SubmitterResult};

use axum::{http::StatusCode, routing::get, Router};
use ethers::types::U256;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Sequence metrics
    pub static ref RESERVATIONS: CounterVec = register_counter_vec!(
        "tx_submitter_reservations_total",
        "Sequence reservation transitions by outcome",
        &["chain_id", "outcome"]
    ).unwrap();

    pub static ref SEQUENCE_REPAIRS: CounterVec = register_counter_vec!(
        "tx_submitter_sequence_repairs_total",
        "Sequence resynchronizations against the ledger",
        &["chain_id"]
    ).unwrap();

    // Fee metrics
    pub static ref GAS_PRICE: GaugeVec = register_gauge_vec!(
        "tx_submitter_gas_price_gwei",
        "Last observed market gas price",
        &["chain_id"]
    ).unwrap();

    pub static ref FEE_DEGRADED: CounterVec = register_counter_vec!(
        "tx_submitter_fee_degraded_total",
        "Fee lookups served from the last known price",
        &["chain_id"]
    ).unwrap();

    pub static ref FEE_REPLACEMENTS: CounterVec = register_counter_vec!(
        "tx_submitter_fee_replacements_total",
        "Fee bumps by reason",
        &["chain_id", "reason"]
    ).unwrap();

    // Submission metrics
    pub static ref SUBMIT_ATTEMPTS: CounterVec = register_counter_vec!(
        "tx_submitter_submit_attempts_total",
        "Broadcast attempts by result class",
        &["chain_id", "result"]
    ).unwrap();

    pub static ref SUBMISSIONS: CounterVec = register_counter_vec!(
        "tx_submitter_submissions_total",
        "Finished submissions by status",
        &["chain_id", "status"]
    ).unwrap();

    pub static ref SUBMISSION_LATENCY: HistogramVec = register_histogram_vec!(
        "tx_submitter_submission_latency_seconds",
        "Time from submit to final outcome",
        &["chain_id"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> SubmitterResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| SubmitterError::Config(format!("Cannot bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| SubmitterError::Internal(format!("Metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    render().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// Text exposition of every registered metric
pub fn render() -> SubmitterResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| SubmitterError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| SubmitterError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_reservation(chain_id: u64, outcome: &str) {
    RESERVATIONS
        .with_label_values(&[&chain_id.to_string(), outcome])
        .inc();
}

pub fn record_sequence_repair(chain_id: u64) {
    SEQUENCE_REPAIRS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_gas_price(chain_id: u64, price_wei: U256) {
    let wei = price_wei.min(U256::from(u128::MAX)).as_u128();
    GAS_PRICE
        .with_label_values(&[&chain_id.to_string()])
        .set(wei as f64 / 1e9);
}

pub fn record_fee_degraded(chain_id: u64) {
    FEE_DEGRADED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_fee_replacement(chain_id: u64, reason: &str) {
    FEE_REPLACEMENTS
        .with_label_values(&[&chain_id.to_string(), reason])
        .inc();
}

pub fn record_submit_attempt(chain_id: u64, result: &str) {
    SUBMIT_ATTEMPTS
        .with_label_values(&[&chain_id.to_string(), result])
        .inc();
}

pub fn record_submission(chain_id: u64, status: &str) {
    SUBMISSIONS
        .with_label_values(&[&chain_id.to_string(), status])
        .inc();
}

pub fn record_submission_latency(chain_id: u64, latency_secs: f64) {
    SUBMISSION_LATENCY
        .with_label_values(&[&chain_id.to_string()])
        .observe(latency_secs);
}
