//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Backup runs
    pub static ref BACKUPS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("pgdump_s3_backups_total", "Total number of backup runs"),
        &["status"]
    ).expect("metric can be created");
    pub static ref BACKUP_STAGE_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "pgdump_s3_backup_stage_duration_seconds",
            "Duration of each backup stage in seconds"
        ).buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]),
        &["stage"]
    ).expect("metric can be created");
    pub static ref LAST_SUCCESS_TIMESTAMP_SECONDS: IntGauge = IntGauge::new(
        "pgdump_s3_last_success_timestamp_seconds",
        "Unix time of the last successful backup"
    ).expect("metric can be created");

    // Storage
    pub static ref BACKUP_BYTES_UPLOADED: IntCounter = IntCounter::new(
        "pgdump_s3_backup_bytes_uploaded_total",
        "Total bytes of dump artifacts uploaded"
    ).expect("metric can be created");
    pub static ref COPY_PARTS_TOTAL: IntCounter = IntCounter::new(
        "pgdump_s3_copy_parts_total",
        "Total number of parts copied server-side"
    ).expect("metric can be created");
    pub static ref COPY_SESSIONS_ABORTED_TOTAL: IntCounter = IntCounter::new(
        "pgdump_s3_copy_sessions_aborted_total",
        "Total number of copy sessions aborted after a failure"
    ).expect("metric can be created");

    // Errors
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("pgdump_s3_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry
///
/// Registers all metrics with the global registry.
/// Must be called once at application startup.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(BACKUPS_TOTAL.clone()))
        .expect("BACKUPS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(BACKUP_STAGE_DURATION_SECONDS.clone()))
        .expect("BACKUP_STAGE_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(LAST_SUCCESS_TIMESTAMP_SECONDS.clone()))
        .expect("LAST_SUCCESS_TIMESTAMP_SECONDS can be registered");
    REGISTRY
        .register(Box::new(BACKUP_BYTES_UPLOADED.clone()))
        .expect("BACKUP_BYTES_UPLOADED can be registered");
    REGISTRY
        .register(Box::new(COPY_PARTS_TOTAL.clone()))
        .expect("COPY_PARTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(COPY_SESSIONS_ABORTED_TOTAL.clone()))
        .expect("COPY_SESSIONS_ABORTED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}
