//! pgdump-s3 - scheduled PostgreSQL backups to S3-compatible storage
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Scheduler (cron, UTC)                      │
//! │  - One run at a time                                        │
//! │  - Drains the running backup on shutdown                    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Backup Pipeline                          │
//! │  - pg_dump into a temporary directory                       │
//! │  - Upload to <prefix>/dump_<timestamp>                      │
//! │  - Replicate to <prefix>/latest                             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                Chunked Replication Engine                    │
//! │  - Server-side UploadPartCopy in byte ranges                │
//! │  - Complete in part order, abort on any failure             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Object Store (S3 API)                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `scheduler`: Cron trigger and shutdown draining
//! - `pipeline`: Dump, upload and replicate, key naming
//! - `replication`: Chunked server-side copy
//! - `dump`: pg_dump process and connection string parsing
//! - `storage`: Object store trait, S3 and in-memory implementations
//! - `server`: Health and metrics endpoint
//! - `config`: Configuration management
//! - `error`: Error types

pub mod config;
pub mod dump;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod replication;
pub mod scheduler;
pub mod server;
pub mod storage;

use std::sync::Arc;

pub use error::{AppError, Result};

/// Build the production pipeline: S3 store and `pg_dump` producer
pub fn build_pipeline(config: &config::AppConfig) -> Result<pipeline::BackupPipeline> {
    let store: Arc<dyn storage::ObjectStore> =
        Arc::new(storage::S3ObjectStore::new(&config.storage)?);
    let producer: Arc<dyn dump::DumpProducer> =
        Arc::new(dump::PgDumpProducer::from_config(config)?);
    pipeline::BackupPipeline::from_config(config, store, producer)
}
