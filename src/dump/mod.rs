//! Dump producer
//!
//! Produces a logical database dump as a local file. The production
//! implementation runs `pg_dump`; tests substitute their own producers.

mod connection;
mod pg_dump;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;

pub use connection::ConnectionParams;
pub use pg_dump::PgDumpProducer;

/// A dump file on local disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpArtifact {
    pub path: PathBuf,
    pub size: u64,
}

/// Receives diagnostic output of the dump tool, one line at a time
pub trait DumpLogSink: Send + Sync {
    fn record(&self, line: &str);
}

/// Forwards each diagnostic line to tracing at warn level
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogSink;

impl DumpLogSink for TracingLogSink {
    fn record(&self, line: &str) {
        tracing::warn!(source = "pg_dump", "{}", line);
    }
}

/// Something that can write a database dump to a path
#[async_trait]
pub trait DumpProducer: Send + Sync {
    /// Write a dump to `target`
    ///
    /// # Errors
    /// Returns `DumpProducerFailed` if the dump could not be produced and
    /// `Cancelled` if `cancel` fired first
    async fn produce(
        &self,
        target: &Path,
        sink: &dyn DumpLogSink,
        cancel: &CancellationToken,
    ) -> Result<DumpArtifact, AppError>;
}
