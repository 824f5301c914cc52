//! Driver Metrics
//!
//! Prometheus counters for RPC outcomes, exposed on the health listener.

use crate::error::{Error, Result};
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

/// Metric registry of one driver process
pub struct Metrics {
    registry: Registry,
    operations: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let operations = IntCounterVec::new(
            Opts::new(
                "pve_csi_operations_total",
                "Completed RPC calls by method and status class",
            ),
            &["method", "code"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(operations.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            operations,
        })
    }

    /// Count one completed call
    pub fn observe(&self, method: &str, code: &str) {
        self.operations.with_label_values(&[method, code]).inc();
    }

    pub fn operations(&self, method: &str, code: &str) -> u64 {
        self.operations.with_label_values(&[method, code]).get()
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}
