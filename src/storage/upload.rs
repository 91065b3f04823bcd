//! Local file upload
//!
//! Small artifacts go up in one `PutObject`. Anything above the multipart
//! threshold is streamed from disk one part at a time, so the upload is
//! not bounded by the store's single-request size limit.

use std::path::Path;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use super::{CompletedPart, ObjectStore};
use crate::error::{AppError, StoreError};
use crate::replication::effective_part_size;

/// How an artifact was sent to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStrategy {
    SingleRequest,
    Multipart { parts: u32 },
}

/// Upload a local file to `key`
///
/// # Arguments
/// * `part_size` - Bytes per part when uploading in parts
/// * `multipart_threshold` - Files larger than this are uploaded in parts
///
/// # Errors
/// Every failure is reported as `UploadFailed`, except cancellation
/// which is reported as `Cancelled`. A failed multipart upload is aborted.
pub async fn upload_file(
    store: &dyn ObjectStore,
    key: &str,
    path: &Path,
    part_size: u64,
    multipart_threshold: u64,
    cancel: &CancellationToken,
) -> Result<UploadStrategy, AppError> {
    let upload_failed = |message: String| AppError::UploadFailed {
        key: key.to_string(),
        message,
    };

    let size = tokio::fs::metadata(path)
        .await
        .map_err(|e| upload_failed(format!("cannot stat {}: {}", path.display(), e)))?
        .len();

    if size <= multipart_threshold {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            result = store.put_object(key, path) => {
                result.map_err(|e| upload_failed(e.to_string()))?;
            }
        }
        tracing::debug!(key = %key, size, "Uploaded in a single request");
        return Ok(UploadStrategy::SingleRequest);
    }

    let upload_id = store
        .create_multipart_upload(key)
        .await
        .map_err(|e| upload_failed(e.to_string()))?;

    let part_size = effective_part_size(size, part_size);
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AppError::Cancelled),
        result = upload_parts(store, key, &upload_id, path, part_size) => {
            result.map_err(|e| upload_failed(e.to_string()))
        }
    };

    let parts = match result {
        Ok(parts) => parts,
        Err(error) => {
            if let Err(abort_error) = store.abort_multipart_upload(key, &upload_id).await {
                tracing::warn!(
                    key = %key,
                    upload_id = %upload_id,
                    error = %abort_error,
                    "Failed to abort multipart upload"
                );
            }
            return Err(error);
        }
    };

    if let Err(error) = store.complete_multipart_upload(key, &upload_id, &parts).await {
        if let Err(abort_error) = store.abort_multipart_upload(key, &upload_id).await {
            tracing::warn!(
                key = %key,
                upload_id = %upload_id,
                error = %abort_error,
                "Failed to abort multipart upload"
            );
        }
        return Err(upload_failed(error.to_string()));
    }

    let parts = parts.len() as u32;
    tracing::debug!(key = %key, size, parts, "Uploaded in parts");
    Ok(UploadStrategy::Multipart { parts })
}

async fn upload_parts(
    store: &dyn ObjectStore,
    key: &str,
    upload_id: &str,
    path: &Path,
    part_size: u64,
) -> Result<Vec<CompletedPart>, StoreError> {
    let io_error = |e: std::io::Error| StoreError::request("UploadPart", e.to_string());

    let mut file = tokio::fs::File::open(path).await.map_err(io_error)?;
    let mut parts = Vec::new();
    let mut part_number = 1_u32;

    loop {
        let mut buffer = Vec::with_capacity(part_size as usize);
        (&mut file)
            .take(part_size)
            .read_to_end(&mut buffer)
            .await
            .map_err(io_error)?;
        if buffer.is_empty() {
            break;
        }

        let etag = store
            .upload_part(key, upload_id, part_number, Bytes::from(buffer))
            .await?;
        parts.push(CompletedPart { part_number, etag });
        part_number += 1;
    }

    Ok(parts)
}
