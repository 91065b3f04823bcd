//! Chunked server-side replication
//!
//! Copies an object to another key in the same store without moving its
//! bytes through this process. The source is split into ranges of
//! `part_size` bytes, each copied into a multipart session on the
//! destination with `UploadPartCopy`, and the session is completed with
//! the parts in ascending order. The destination only changes when the
//! session completes; any failure before that aborts the session and
//! leaves the previous destination object untouched.
//!
//! An empty source is copied with a single `CopyObject`, since stores
//! reject multipart completion with zero parts. A missing source is an
//! error.

mod plan;
mod session;

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::config::StorageConfig;
use crate::error::{AppError, StoreError};
use crate::storage::{CompletedPart, ObjectStore};

pub use plan::{
    MAX_PART_SIZE, MAX_PARTS, MIN_PART_SIZE, PartIter, PartPlan, PlannedPart,
    effective_part_size,
};
pub use session::CopyState;

use session::CopySession;

/// How the destination was produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyStrategy {
    /// Single `CopyObject` request (empty source)
    WholeObject,
    /// Multipart session assembled from range copies
    Multipart { upload_id: String },
}

/// Result of a successful replication
#[derive(Debug, Clone)]
pub struct ReplicationReport {
    pub source: String,
    pub destination: String,
    pub object_size: u64,
    pub part_size: u64,
    pub parts: u32,
    pub strategy: CopyStrategy,
}

/// Server-side chunked copy between two keys of one store
pub struct ChunkedReplicator {
    store: Arc<dyn ObjectStore>,
    part_size: u64,
    concurrency: usize,
}

impl ChunkedReplicator {
    /// Create a replicator
    ///
    /// # Errors
    /// Returns `Config` if `part_size` is outside the range stores accept
    /// or `concurrency` is zero
    pub fn new(
        store: Arc<dyn ObjectStore>,
        part_size: u64,
        concurrency: usize,
    ) -> Result<Self, AppError> {
        if !(MIN_PART_SIZE..=MAX_PART_SIZE).contains(&part_size) {
            return Err(AppError::Config(format!(
                "part size {} is outside the allowed range {}..={}",
                part_size, MIN_PART_SIZE, MAX_PART_SIZE
            )));
        }
        if concurrency == 0 {
            return Err(AppError::Config(
                "copy concurrency must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            store,
            part_size,
            concurrency,
        })
    }

    pub fn from_config(
        store: Arc<dyn ObjectStore>,
        config: &StorageConfig,
    ) -> Result<Self, AppError> {
        Self::new(store, config.part_size, config.copy_concurrency)
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// Copy `source` to `destination`
    ///
    /// # Errors
    /// - `ObjectNotFound` if `source` does not exist
    /// - `SessionInitiationFailed` if the store refuses a session
    /// - `PartCopyFailed` naming the first part that failed
    /// - `CompletionFailed` if the store rejects the assembly
    /// - `Cancelled` if `cancel` fires before completion
    pub async fn replicate(
        &self,
        source: &str,
        destination: &str,
        cancel: &CancellationToken,
    ) -> Result<ReplicationReport, AppError> {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        tracing::info!(source = %source, destination = %destination, "Replicating object");

        let head = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            result = self.store.head_object(source) => result,
        };
        let object_size = match head {
            Ok(size) => size,
            Err(StoreError::NotFound { .. }) => {
                return Err(AppError::ObjectNotFound {
                    key: source.to_string(),
                });
            }
            Err(error) => return Err(AppError::Storage(error.to_string())),
        };

        if object_size == 0 {
            return self.copy_whole_object(source, destination).await;
        }

        let part_size = effective_part_size(object_size, self.part_size);
        if part_size != self.part_size {
            tracing::info!(
                object_size,
                configured = self.part_size,
                part_size,
                "Part size widened to stay within the part limit"
            );
        }
        let plan = PartPlan::new(object_size, part_size);

        let mut session = CopySession::new(destination);
        let upload_id = self
            .store
            .create_multipart_upload(destination)
            .await
            .map_err(|e| AppError::SessionInitiationFailed {
                key: destination.to_string(),
                message: e.to_string(),
            })?;
        session.open(upload_id.clone());

        tracing::debug!(
            upload_id = %upload_id,
            object_size,
            part_size,
            parts = plan.part_count(),
            "Copy session opened"
        );

        let copied = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AppError::Cancelled),
            result = self.copy_parts(source, &upload_id, destination, &plan, &mut session) => result,
        };

        let outcome = match copied {
            Ok(()) => self.complete(&mut session, &upload_id, &plan, cancel).await,
            Err(error) => Err(error),
        };

        if let Err(error) = outcome {
            tracing::warn!(
                destination = %destination,
                upload_id = %upload_id,
                state = ?session.state(),
                parts_copied = session.part_count(),
                error = %error,
                "Replication failed; aborting copy session"
            );
            self.abort(&mut session).await;
            return Err(error);
        }

        tracing::info!(
            source = %source,
            destination = %destination,
            object_size,
            parts = plan.part_count(),
            "Replication completed"
        );

        Ok(ReplicationReport {
            source: source.to_string(),
            destination: destination.to_string(),
            object_size,
            part_size,
            parts: plan.part_count(),
            strategy: CopyStrategy::Multipart { upload_id },
        })
    }

    async fn copy_whole_object(
        &self,
        source: &str,
        destination: &str,
    ) -> Result<ReplicationReport, AppError> {
        self.store
            .copy_object(source, destination)
            .await
            .map_err(|e| AppError::CompletionFailed {
                key: destination.to_string(),
                message: e.to_string(),
            })?;

        tracing::info!(
            source = %source,
            destination = %destination,
            "Empty object copied in a single request"
        );

        Ok(ReplicationReport {
            source: source.to_string(),
            destination: destination.to_string(),
            object_size: 0,
            part_size: self.part_size,
            parts: 0,
            strategy: CopyStrategy::WholeObject,
        })
    }

    async fn copy_parts(
        &self,
        source: &str,
        upload_id: &str,
        destination: &str,
        plan: &PartPlan,
        session: &mut CopySession,
    ) -> Result<(), AppError> {
        let store = self.store.as_ref();

        let mut in_flight = stream::iter(plan.parts())
            .map(|part| async move {
                let etag = store
                    .upload_part_copy(destination, source, upload_id, part.part_number, part.range)
                    .await
                    .map_err(|e| AppError::PartCopyFailed {
                        part_number: part.part_number,
                        message: e.to_string(),
                    })?;

                tracing::debug!(
                    part_number = part.part_number,
                    range = %part.range,
                    "Part copied"
                );

                Ok::<_, AppError>(CompletedPart {
                    part_number: part.part_number,
                    etag,
                })
            })
            .buffer_unordered(self.concurrency);

        // The first failure drops every copy still in flight
        while let Some(result) = in_flight.next().await {
            session.record(result?);
            crate::metrics::COPY_PARTS_TOTAL.inc();
        }

        Ok(())
    }

    async fn complete(
        &self,
        session: &mut CopySession,
        upload_id: &str,
        plan: &PartPlan,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        let destination = session.destination().to_string();
        let parts = session.completion_list();
        debug_assert_eq!(parts.len(), plan.part_count() as usize);
        debug_assert!(
            parts
                .iter()
                .enumerate()
                .all(|(index, part)| part.part_number == index as u32 + 1)
        );

        self.store
            .complete_multipart_upload(&destination, upload_id, parts)
            .await
            .map_err(|e| AppError::CompletionFailed {
                key: destination.clone(),
                message: e.to_string(),
            })?;

        session.mark_completed();
        Ok(())
    }

    async fn abort(&self, session: &mut CopySession) {
        let Some(upload_id) = session.upload_id().map(str::to_string) else {
            return;
        };

        match self
            .store
            .abort_multipart_upload(session.destination(), &upload_id)
            .await
        {
            Ok(()) => {
                crate::metrics::COPY_SESSIONS_ABORTED_TOTAL.inc();
                tracing::info!(upload_id = %upload_id, "Copy session aborted");
            }
            Err(error) => {
                tracing::warn!(
                    upload_id = %upload_id,
                    error = %error,
                    "Failed to abort copy session; the store may keep orphaned parts"
                );
            }
        }
        session.mark_aborted();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ByteRange, MockObjectStore};
    use std::sync::Mutex;

    const MIB: u64 = 1024 * 1024;

    fn replicator(mock: MockObjectStore, concurrency: usize) -> ChunkedReplicator {
        ChunkedReplicator::new(Arc::new(mock), MIN_PART_SIZE, concurrency).unwrap()
    }

    #[test]
    fn new_rejects_undersized_parts() {
        let result = ChunkedReplicator::new(Arc::new(MockObjectStore::new()), MIN_PART_SIZE - 1, 4);
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn new_rejects_zero_concurrency() {
        let result = ChunkedReplicator::new(Arc::new(MockObjectStore::new()), MIN_PART_SIZE, 0);
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[tokio::test]
    async fn missing_source_is_object_not_found() {
        let mut mock = MockObjectStore::new();
        mock.expect_head_object().times(1).returning(|key| {
            Err(StoreError::NotFound {
                key: key.to_string(),
            })
        });
        mock.expect_create_multipart_upload().never();

        let error = replicator(mock, 4)
            .replicate("prod/dump", "prod/latest", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(error, AppError::ObjectNotFound { key } if key == "prod/dump"));
    }

    #[tokio::test]
    async fn empty_source_uses_whole_object_copy() {
        let mut mock = MockObjectStore::new();
        mock.expect_head_object().times(1).returning(|_| Ok(0));
        mock.expect_copy_object()
            .withf(|source, destination| source == "prod/dump" && destination == "prod/latest")
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_create_multipart_upload().never();
        mock.expect_complete_multipart_upload().never();

        let report = replicator(mock, 4)
            .replicate("prod/dump", "prod/latest", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.strategy, CopyStrategy::WholeObject);
        assert_eq!(report.parts, 0);
    }

    #[tokio::test]
    async fn rejected_session_is_not_aborted() {
        let mut mock = MockObjectStore::new();
        mock.expect_head_object().returning(|_| Ok(12 * MIB));
        mock.expect_create_multipart_upload()
            .times(1)
            .returning(|_| Err(StoreError::request("CreateMultipartUpload", "AccessDenied")));
        mock.expect_upload_part_copy().never();
        mock.expect_abort_multipart_upload().never();

        let error = replicator(mock, 4)
            .replicate("prod/dump", "prod/latest", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(error, AppError::SessionInitiationFailed { .. }));
    }

    #[tokio::test]
    async fn completion_receives_parts_in_ascending_order() {
        let ranges = Arc::new(Mutex::new(Vec::new()));
        let recorded = ranges.clone();

        let mut mock = MockObjectStore::new();
        mock.expect_head_object().returning(|_| Ok(12 * MIB));
        mock.expect_create_multipart_upload()
            .returning(|_| Ok("upload-1".to_string()));
        mock.expect_upload_part_copy()
            .times(3)
            .returning(move |_, _, _, part_number, range| {
                recorded.lock().unwrap().push((part_number, range));
                Ok(format!("etag-{}", part_number))
            });
        mock.expect_complete_multipart_upload()
            .withf(|key, upload_id, parts| {
                key == "prod/latest"
                    && upload_id == "upload-1"
                    && parts
                        == [
                            CompletedPart {
                                part_number: 1,
                                etag: "etag-1".to_string(),
                            },
                            CompletedPart {
                                part_number: 2,
                                etag: "etag-2".to_string(),
                            },
                            CompletedPart {
                                part_number: 3,
                                etag: "etag-3".to_string(),
                            },
                        ]
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        mock.expect_abort_multipart_upload().never();

        let report = replicator(mock, 3)
            .replicate("prod/dump", "prod/latest", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.parts, 3);
        let mut ranges = ranges.lock().unwrap().clone();
        ranges.sort_by_key(|(part_number, _)| *part_number);
        assert_eq!(
            ranges,
            vec![
                (1, ByteRange::new(0, 5_242_879)),
                (2, ByteRange::new(5_242_880, 10_485_759)),
                (3, ByteRange::new(10_485_760, 12_582_911)),
            ]
        );
    }

    #[tokio::test]
    async fn failed_part_aborts_without_completing() {
        let mut mock = MockObjectStore::new();
        mock.expect_head_object().returning(|_| Ok(12 * MIB));
        mock.expect_create_multipart_upload()
            .returning(|_| Ok("upload-1".to_string()));
        mock.expect_upload_part_copy()
            .returning(|_, _, _, part_number, _| {
                if part_number == 2 {
                    Err(StoreError::request("UploadPartCopy", "InternalError"))
                } else {
                    Ok(format!("etag-{}", part_number))
                }
            });
        mock.expect_complete_multipart_upload().never();
        mock.expect_abort_multipart_upload()
            .withf(|key, upload_id| key == "prod/latest" && upload_id == "upload-1")
            .times(1)
            .returning(|_, _| Ok(()));

        let error = replicator(mock, 1)
            .replicate("prod/dump", "prod/latest", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(error, AppError::PartCopyFailed { part_number: 2, .. }));
    }

    #[tokio::test]
    async fn rejected_completion_is_aborted() {
        let mut mock = MockObjectStore::new();
        mock.expect_head_object().returning(|_| Ok(MIB));
        mock.expect_create_multipart_upload()
            .returning(|_| Ok("upload-1".to_string()));
        mock.expect_upload_part_copy()
            .times(1)
            .returning(|_, _, _, _, _| Ok("etag-1".to_string()));
        mock.expect_complete_multipart_upload()
            .times(1)
            .returning(|_, _, _| Err(StoreError::request("CompleteMultipartUpload", "InvalidPart")));
        mock.expect_abort_multipart_upload()
            .times(1)
            .returning(|_, _| Ok(()));

        let error = replicator(mock, 4)
            .replicate("prod/dump", "prod/latest", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(error, AppError::CompletionFailed { .. }));
    }

    #[tokio::test]
    async fn failed_abort_keeps_original_error() {
        let mut mock = MockObjectStore::new();
        mock.expect_head_object().returning(|_| Ok(MIB));
        mock.expect_create_multipart_upload()
            .returning(|_| Ok("upload-1".to_string()));
        mock.expect_upload_part_copy()
            .returning(|_, _, _, _, _| Err(StoreError::request("UploadPartCopy", "SlowDown")));
        mock.expect_abort_multipart_upload()
            .times(1)
            .returning(|_, _| Err(StoreError::request("AbortMultipartUpload", "timeout")));

        let error = replicator(mock, 4)
            .replicate("prod/dump", "prod/latest", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(error, AppError::PartCopyFailed { part_number: 1, .. }));
    }

    #[tokio::test]
    async fn cancelled_before_start_touches_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        // No expectations: any store call panics
        let error = replicator(MockObjectStore::new(), 4)
            .replicate("prod/dump", "prod/latest", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(error, AppError::Cancelled));
    }
}
