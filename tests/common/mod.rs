//! Common test utilities for integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use pgdump_s3::config::StorageConfig;
use pgdump_s3::dump::{DumpArtifact, DumpLogSink, DumpProducer};
use pgdump_s3::error::AppError;
use pgdump_s3::replication::MIN_PART_SIZE;
use tokio_util::sync::CancellationToken;

pub const MIB: u64 = 1024 * 1024;

/// Deterministic, non-repeating-per-part test data
pub fn patterned(len: u64) -> Vec<u8> {
    (0..len)
        .map(|i| ((i * 31 + i / 251) % 256) as u8)
        .collect()
}

/// Storage settings pointing nowhere; only the numeric knobs matter
pub fn storage_config(copy_concurrency: usize, multipart_threshold: u64) -> StorageConfig {
    StorageConfig {
        endpoint: "http://127.0.0.1:9000".to_string(),
        region: "us-east-1".to_string(),
        access_key_id: "test-key".to_string(),
        secret_access_key: "test-secret".to_string(),
        bucket: "backups".to_string(),
        prefix: "prod/db".to_string(),
        force_path_style: true,
        part_size: MIN_PART_SIZE,
        copy_concurrency,
        multipart_threshold,
    }
}

/// Writes fixed bytes to the target, like a successful dump
pub struct FixedDumpProducer {
    data: Vec<u8>,
    stderr: Vec<String>,
    pub calls: AtomicUsize,
}

impl FixedDumpProducer {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            stderr: Vec::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_stderr(mut self, lines: &[&str]) -> Self {
        self.stderr = lines.iter().map(|line| line.to_string()).collect();
        self
    }
}

#[async_trait]
impl DumpProducer for FixedDumpProducer {
    async fn produce(
        &self,
        target: &Path,
        sink: &dyn DumpLogSink,
        cancel: &CancellationToken,
    ) -> Result<DumpArtifact, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        for line in &self.stderr {
            sink.record(line);
        }
        tokio::fs::write(target, &self.data).await?;
        Ok(DumpArtifact {
            path: target.to_path_buf(),
            size: self.data.len() as u64,
        })
    }
}

/// Fails like a dump tool exiting non-zero
pub struct FailingDumpProducer;

#[async_trait]
impl DumpProducer for FailingDumpProducer {
    async fn produce(
        &self,
        _target: &Path,
        sink: &dyn DumpLogSink,
        _cancel: &CancellationToken,
    ) -> Result<DumpArtifact, AppError> {
        sink.record("pg_dump: error: connection to server failed");
        Err(AppError::DumpProducerFailed(
            "pg_dump exited with exit status: 1".to_string(),
        ))
    }
}

/// Keeps every diagnostic line it receives
#[derive(Default)]
pub struct CollectingSink {
    lines: Mutex<Vec<String>>,
}

impl CollectingSink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl DumpLogSink for CollectingSink {
    fn record(&self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }
}
