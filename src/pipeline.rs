//! Backup pipeline
//!
//! One run: dump the database into a fresh temporary directory, upload the
//! artifact under a timestamped key, then replicate it server-side to the
//! stable `latest` key. Any failure ends the run; the temporary directory
//! is removed either way.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, BackupConfig, StorageConfig};
use crate::dump::{DumpLogSink, DumpProducer, TracingLogSink};
use crate::error::AppError;
use crate::metrics::{
    BACKUP_BYTES_UPLOADED, BACKUP_STAGE_DURATION_SECONDS, BACKUPS_TOTAL,
    LAST_SUCCESS_TIMESTAMP_SECONDS,
};
use crate::replication::{ChunkedReplicator, ReplicationReport};
use crate::scheduler::ScheduledJob;
use crate::storage::{ObjectStore, UploadStrategy, upload_file};

/// Object key naming for backups
#[derive(Debug, Clone)]
pub struct KeyLayout {
    prefix: String,
    extension: String,
    offset: FixedOffset,
}

impl KeyLayout {
    /// # Errors
    /// Returns `Config` if `offset_hours` is not a valid UTC offset
    pub fn new(prefix: &str, extension: &str, offset_hours: i32) -> Result<Self, AppError> {
        let offset = offset_hours
            .checked_mul(3600)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                AppError::Config(format!("invalid timestamp offset: {} hours", offset_hours))
            })?;

        Ok(Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            extension: extension.to_string(),
            offset,
        })
    }

    pub fn from_config(storage: &StorageConfig, backup: &BackupConfig) -> Result<Self, AppError> {
        Self::new(
            &storage.prefix,
            &backup.object_extension,
            backup.timestamp_offset_hours,
        )
    }

    /// `<prefix>/dump_<RFC 3339 timestamp><extension>`
    pub fn backup_key(&self, now: DateTime<Utc>) -> String {
        let timestamp = now
            .with_timezone(&self.offset)
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        self.join(&format!("dump_{}{}", timestamp, self.extension))
    }

    /// `<prefix>/latest<extension>`
    pub fn latest_key(&self) -> String {
        self.join(&format!("latest{}", self.extension))
    }

    /// File name of the dump inside the run's temporary directory
    pub fn artifact_name(&self) -> String {
        format!("dump{}", self.extension)
    }

    fn join(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }
}

/// Result of a successful run
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub backup_key: String,
    pub latest_key: String,
    pub size: u64,
    pub upload: UploadStrategy,
    pub replication: ReplicationReport,
}

/// Dump → upload → replicate
pub struct BackupPipeline {
    store: Arc<dyn ObjectStore>,
    producer: Arc<dyn DumpProducer>,
    sink: Arc<dyn DumpLogSink>,
    replicator: ChunkedReplicator,
    layout: KeyLayout,
    work_dir: Option<PathBuf>,
    part_size: u64,
    multipart_threshold: u64,
}

impl BackupPipeline {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        producer: Arc<dyn DumpProducer>,
        layout: KeyLayout,
        storage: &StorageConfig,
    ) -> Result<Self, AppError> {
        let replicator = ChunkedReplicator::from_config(store.clone(), storage)?;

        Ok(Self {
            store,
            producer,
            sink: Arc::new(TracingLogSink),
            replicator,
            layout,
            work_dir: None,
            part_size: storage.part_size,
            multipart_threshold: storage.multipart_threshold,
        })
    }

    pub fn from_config(
        config: &AppConfig,
        store: Arc<dyn ObjectStore>,
        producer: Arc<dyn DumpProducer>,
    ) -> Result<Self, AppError> {
        let layout = KeyLayout::from_config(&config.storage, &config.backup)?;
        Ok(Self::new(store, producer, layout, &config.storage)?
            .with_work_dir(config.dump.work_dir.clone()))
    }

    /// Parent directory for per-run temporary directories (default: system temp)
    pub fn with_work_dir(mut self, work_dir: Option<PathBuf>) -> Self {
        self.work_dir = work_dir;
        self
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn DumpLogSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    /// Perform one backup
    ///
    /// # Steps
    /// 1. Dump the database into a temporary directory
    /// 2. Upload the artifact under a timestamped key
    /// 3. Replicate the timestamped object to `latest`
    ///
    /// `latest` only changes if every step succeeds.
    pub async fn backup_now(&self, cancel: &CancellationToken) -> Result<BackupOutcome, AppError> {
        let result = self.run_stages(Utc::now(), cancel).await;

        match &result {
            Ok(outcome) => {
                BACKUPS_TOTAL.with_label_values(&["success"]).inc();
                LAST_SUCCESS_TIMESTAMP_SECONDS.set(Utc::now().timestamp());
                tracing::info!(
                    backup_key = %outcome.backup_key,
                    latest_key = %outcome.latest_key,
                    size = outcome.size,
                    parts = outcome.replication.parts,
                    "Backup completed successfully"
                );
            }
            Err(AppError::Cancelled) => {
                BACKUPS_TOTAL.with_label_values(&["cancelled"]).inc();
            }
            Err(_) => {
                BACKUPS_TOTAL.with_label_values(&["failure"]).inc();
            }
        }

        result
    }

    async fn run_stages(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<BackupOutcome, AppError> {
        let backup_key = self.layout.backup_key(now);
        let latest_key = self.layout.latest_key();

        tracing::info!(backup_key = %backup_key, "Starting database backup...");

        // Removed on drop, whichever way the run ends
        let mut builder = tempfile::Builder::new();
        builder.prefix("pgdump-s3-");
        let temp_dir = match &self.work_dir {
            Some(dir) => builder.tempdir_in(dir)?,
            None => builder.tempdir()?,
        };
        let target = temp_dir.path().join(self.layout.artifact_name());

        // 1. Dump
        let started = Instant::now();
        let artifact = self
            .producer
            .produce(&target, self.sink.as_ref(), cancel)
            .await?;
        observe_stage("dump", started);
        tracing::debug!(path = %artifact.path.display(), size = artifact.size, "Dump written");

        // 2. Upload
        let started = Instant::now();
        let upload = upload_file(
            self.store.as_ref(),
            &backup_key,
            &artifact.path,
            self.part_size,
            self.multipart_threshold,
            cancel,
        )
        .await?;
        observe_stage("upload", started);
        BACKUP_BYTES_UPLOADED.inc_by(artifact.size);
        tracing::info!(key = %backup_key, size = artifact.size, ?upload, "Backup uploaded");

        // 3. Replicate
        let started = Instant::now();
        let replication = self
            .replicator
            .replicate(&backup_key, &latest_key, cancel)
            .await?;
        observe_stage("replicate", started);

        Ok(BackupOutcome {
            backup_key,
            latest_key,
            size: artifact.size,
            upload,
            replication,
        })
    }
}

fn observe_stage(stage: &str, started: Instant) {
    BACKUP_STAGE_DURATION_SECONDS
        .with_label_values(&[stage])
        .observe(started.elapsed().as_secs_f64());
}

#[async_trait]
impl ScheduledJob for BackupPipeline {
    fn name(&self) -> &str {
        "backup"
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), AppError> {
        self.backup_now(&cancel).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 21, 7, 30).unwrap()
    }

    #[test]
    fn keys_in_utc() {
        let layout = KeyLayout::new("prod/db/", ".backup", 0).unwrap();
        assert_eq!(
            layout.backup_key(now()),
            "prod/db/dump_2024-05-01T21:07:30Z.backup"
        );
        assert_eq!(layout.latest_key(), "prod/db/latest.backup");
    }

    #[test]
    fn offset_is_rendered_in_the_key() {
        let layout = KeyLayout::new("prod", ".backup", 3).unwrap();
        assert_eq!(
            layout.backup_key(now()),
            "prod/dump_2024-05-02T00:07:30+03:00.backup"
        );
    }

    #[test]
    fn every_trailing_slash_is_trimmed() {
        let layout = KeyLayout::new("backups///", ".sql", 0).unwrap();
        assert_eq!(layout.latest_key(), "backups/latest.sql");
        assert_eq!(layout.artifact_name(), "dump.sql");
    }

    #[test]
    fn empty_prefix_has_no_leading_slash() {
        let layout = KeyLayout::new("/", "", 0).unwrap();
        assert_eq!(layout.latest_key(), "latest");
    }

    #[test]
    fn out_of_range_offset_is_rejected() {
        assert!(matches!(
            KeyLayout::new("prod", ".backup", 48),
            Err(AppError::Config(_))
        ));
    }
}
