//! In-memory object store
//!
//! Behaves like an S3 bucket for the operations in `ObjectStore`,
//! including the multipart rules a real store enforces: parts must be
//! listed in ascending order with matching ETags, every part but the last
//! must meet the minimum part size, and an object only becomes visible when
//! its session completes. Every call is journaled, and individual
//! operations can be made to fail, so tests can assert exactly what was
//! sent to the store.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use super::{ByteRange, CompletedPart, ObjectStore};
use crate::error::StoreError;
use crate::replication::MIN_PART_SIZE;

/// One request received by a `MemoryObjectStore`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    HeadObject {
        key: String,
    },
    PutObject {
        key: String,
    },
    CopyObject {
        source: String,
        destination: String,
    },
    CreateMultipartUpload {
        key: String,
    },
    UploadPart {
        key: String,
        part_number: u32,
        len: u64,
    },
    UploadPartCopy {
        destination: String,
        source: String,
        part_number: u32,
        range: ByteRange,
    },
    CompleteMultipartUpload {
        key: String,
        part_numbers: Vec<u32>,
    },
    AbortMultipartUpload {
        key: String,
        upload_id: String,
    },
}

#[derive(Default)]
struct Failures {
    put: bool,
    copy_object: bool,
    create_multipart: bool,
    upload_part: Option<u32>,
    upload_part_copy: Option<u32>,
    complete: bool,
}

struct Session {
    key: String,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Default)]
struct MemoryState {
    objects: HashMap<String, Bytes>,
    sessions: HashMap<String, Session>,
    next_upload_id: u64,
    calls: Vec<StoreCall>,
    failures: Failures,
}

/// In-memory storage for tests. Thread-safe via Mutex.
pub struct MemoryObjectStore {
    state: Mutex<MemoryState>,
    min_part_size: u64,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            min_part_size: MIN_PART_SIZE,
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an object directly, bypassing the journal
    pub fn insert(&self, key: &str, data: impl Into<Bytes>) {
        self.state().objects.insert(key.to_string(), data.into());
    }

    /// Current contents of a visible object
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.state().objects.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state().objects.contains_key(key)
    }

    /// Keys of every visible object, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state().objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Multipart sessions neither completed nor aborted
    pub fn open_sessions(&self) -> usize {
        self.state().sessions.len()
    }

    /// Every request received so far, in arrival order
    pub fn calls(&self) -> Vec<StoreCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn fail_put(&self) {
        self.state().failures.put = true;
    }

    pub fn fail_copy_object(&self) {
        self.state().failures.copy_object = true;
    }

    pub fn fail_create_multipart_upload(&self) {
        self.state().failures.create_multipart = true;
    }

    /// Fail the upload of the given part number
    pub fn fail_upload_part(&self, part_number: u32) {
        self.state().failures.upload_part = Some(part_number);
    }

    /// Fail the range copy of the given part number
    pub fn fail_upload_part_copy(&self, part_number: u32) {
        self.state().failures.upload_part_copy = Some(part_number);
    }

    pub fn fail_complete_multipart_upload(&self) {
        self.state().failures.complete = true;
    }

    fn next_upload_id(state: &mut MemoryState) -> String {
        state.next_upload_id += 1;
        format!("upload-{}", state.next_upload_id)
    }

    fn session<'a>(
        state: &'a mut MemoryState,
        operation: &'static str,
        key: &str,
        upload_id: &str,
    ) -> Result<&'a mut Session, StoreError> {
        let session = state
            .sessions
            .get_mut(upload_id)
            .ok_or_else(|| StoreError::request(operation, format!("NoSuchUpload: {}", upload_id)))?;
        if session.key != key {
            return Err(StoreError::request(
                operation,
                format!("upload {} belongs to {}, not {}", upload_id, session.key, key),
            ));
        }
        Ok(session)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn head_object(&self, key: &str) -> Result<u64, StoreError> {
        let mut state = self.state();
        state.calls.push(StoreCall::HeadObject {
            key: key.to_string(),
        });
        state
            .objects
            .get(key)
            .map(|data| data.len() as u64)
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }

    async fn put_object(&self, key: &str, path: &Path) -> Result<(), StoreError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| StoreError::request("PutObject", e.to_string()))?;

        let mut state = self.state();
        state.calls.push(StoreCall::PutObject {
            key: key.to_string(),
        });
        if state.failures.put {
            return Err(StoreError::request("PutObject", "injected failure"));
        }
        state.objects.insert(key.to_string(), Bytes::from(data));
        Ok(())
    }

    async fn copy_object(
        &self,
        source_key: &str,
        destination_key: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        state.calls.push(StoreCall::CopyObject {
            source: source_key.to_string(),
            destination: destination_key.to_string(),
        });
        if state.failures.copy_object {
            return Err(StoreError::request("CopyObject", "injected failure"));
        }
        let data = state
            .objects
            .get(source_key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                key: source_key.to_string(),
            })?;
        state.objects.insert(destination_key.to_string(), data);
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String, StoreError> {
        let mut state = self.state();
        state.calls.push(StoreCall::CreateMultipartUpload {
            key: key.to_string(),
        });
        if state.failures.create_multipart {
            return Err(StoreError::request("CreateMultipartUpload", "injected failure"));
        }
        let upload_id = Self::next_upload_id(&mut state);
        state.sessions.insert(
            upload_id.clone(),
            Session {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String, StoreError> {
        let mut state = self.state();
        state.calls.push(StoreCall::UploadPart {
            key: key.to_string(),
            part_number,
            len: body.len() as u64,
        });
        if state.failures.upload_part == Some(part_number) {
            return Err(StoreError::request("UploadPart", "injected failure"));
        }
        let session = Self::session(&mut state, "UploadPart", key, upload_id)?;
        let etag = format!("\"{}-{}\"", upload_id, part_number);
        session.parts.insert(part_number, (etag.clone(), body));
        Ok(etag)
    }

    async fn upload_part_copy(
        &self,
        destination_key: &str,
        source_key: &str,
        upload_id: &str,
        part_number: u32,
        range: ByteRange,
    ) -> Result<String, StoreError> {
        let mut state = self.state();
        state.calls.push(StoreCall::UploadPartCopy {
            destination: destination_key.to_string(),
            source: source_key.to_string(),
            part_number,
            range,
        });
        if state.failures.upload_part_copy == Some(part_number) {
            return Err(StoreError::request("UploadPartCopy", "injected failure"));
        }

        let source = state
            .objects
            .get(source_key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                key: source_key.to_string(),
            })?;
        if range.first > range.last || range.last >= source.len() as u64 {
            return Err(StoreError::request(
                "UploadPartCopy",
                format!("InvalidRange: {} for object of {} bytes", range, source.len()),
            ));
        }
        let data = source.slice(range.first as usize..=range.last as usize);

        let session = Self::session(&mut state, "UploadPartCopy", destination_key, upload_id)?;
        let etag = format!("\"{}-{}\"", upload_id, part_number);
        session.parts.insert(part_number, (etag.clone(), data));
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StoreError> {
        const OPERATION: &str = "CompleteMultipartUpload";

        let min_part_size = self.min_part_size;
        let mut state = self.state();
        state.calls.push(StoreCall::CompleteMultipartUpload {
            key: key.to_string(),
            part_numbers: parts.iter().map(|part| part.part_number).collect(),
        });
        if state.failures.complete {
            return Err(StoreError::request(OPERATION, "injected failure"));
        }
        if parts.is_empty() {
            return Err(StoreError::request(OPERATION, "MalformedXML: no parts"));
        }
        if parts
            .windows(2)
            .any(|pair| pair[0].part_number >= pair[1].part_number)
        {
            return Err(StoreError::request(OPERATION, "InvalidPartOrder"));
        }

        let session = Self::session(&mut state, OPERATION, key, upload_id)?;
        let mut assembled = BytesMut::new();
        for (index, part) in parts.iter().enumerate() {
            let (etag, data) = session.parts.get(&part.part_number).ok_or_else(|| {
                StoreError::request(OPERATION, format!("InvalidPart: {}", part.part_number))
            })?;
            if *etag != part.etag {
                return Err(StoreError::request(
                    OPERATION,
                    format!("InvalidPart: ETag mismatch for part {}", part.part_number),
                ));
            }
            let is_last = index + 1 == parts.len();
            if !is_last && (data.len() as u64) < min_part_size {
                return Err(StoreError::request(
                    OPERATION,
                    format!("EntityTooSmall: part {}", part.part_number),
                ));
            }
            assembled.extend_from_slice(data);
        }

        state.sessions.remove(upload_id);
        state.objects.insert(key.to_string(), assembled.freeze());
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StoreError> {
        let mut state = self.state();
        state.calls.push(StoreCall::AbortMultipartUpload {
            key: key.to_string(),
            upload_id: upload_id.to_string(),
        });
        Self::session(&mut state, "AbortMultipartUpload", key, upload_id)?;
        state.sessions.remove(upload_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(part_number: u32, upload_id: &str) -> CompletedPart {
        CompletedPart {
            part_number,
            etag: format!("\"{}-{}\"", upload_id, part_number),
        }
    }

    #[tokio::test]
    async fn head_reports_missing_keys() {
        let store = MemoryObjectStore::new();
        let error = store.head_object("missing").await.unwrap_err();
        assert_eq!(
            error,
            StoreError::NotFound {
                key: "missing".to_string()
            }
        );
    }

    #[tokio::test]
    async fn object_is_invisible_until_completion() {
        let store = MemoryObjectStore::new();
        store.insert("source", vec![7_u8; 10]);

        let upload_id = store.create_multipart_upload("dest").await.unwrap();
        store
            .upload_part_copy("dest", "source", &upload_id, 1, ByteRange::new(0, 9))
            .await
            .unwrap();
        assert!(!store.contains("dest"));

        store
            .complete_multipart_upload("dest", &upload_id, &[part(1, &upload_id)])
            .await
            .unwrap();
        assert_eq!(store.get("dest").unwrap().as_ref(), &[7_u8; 10]);
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn complete_rejects_unsorted_parts() {
        let store = MemoryObjectStore::new();
        let upload_id = store.create_multipart_upload("dest").await.unwrap();

        let error = store
            .complete_multipart_upload("dest", &upload_id, &[part(2, &upload_id), part(1, &upload_id)])
            .await
            .unwrap_err();
        assert!(error.to_string().contains("InvalidPartOrder"));
        assert_eq!(store.open_sessions(), 1);
    }

    #[tokio::test]
    async fn complete_rejects_small_leading_parts() {
        let store = MemoryObjectStore::new();
        store.insert("source", vec![1_u8; 20]);
        let upload_id = store.create_multipart_upload("dest").await.unwrap();
        for (part_number, range) in [(1, ByteRange::new(0, 9)), (2, ByteRange::new(10, 19))] {
            store
                .upload_part_copy("dest", "source", &upload_id, part_number, range)
                .await
                .unwrap();
        }

        let error = store
            .complete_multipart_upload("dest", &upload_id, &[part(1, &upload_id), part(2, &upload_id)])
            .await
            .unwrap_err();
        assert!(error.to_string().contains("EntityTooSmall"));
    }

    #[tokio::test]
    async fn range_past_end_is_rejected() {
        let store = MemoryObjectStore::new();
        store.insert("source", vec![1_u8; 10]);
        let upload_id = store.create_multipart_upload("dest").await.unwrap();

        let error = store
            .upload_part_copy("dest", "source", &upload_id, 1, ByteRange::new(0, 10))
            .await
            .unwrap_err();
        assert!(error.to_string().contains("InvalidRange"));
    }

    #[tokio::test]
    async fn abort_discards_session() {
        let store = MemoryObjectStore::new();
        let upload_id = store.create_multipart_upload("dest").await.unwrap();
        store.abort_multipart_upload("dest", &upload_id).await.unwrap();

        assert_eq!(store.open_sessions(), 0);
        assert!(store.abort_multipart_upload("dest", &upload_id).await.is_err());
    }
}
