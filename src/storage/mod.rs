//! Object storage module
//!
//! Handles:
//! - The `ObjectStore` capability consumed by the pipeline and the
//!   replication engine
//! - S3-compatible storage (`S3ObjectStore`)
//! - An in-process store for tests and dry runs (`MemoryObjectStore`)
//! - File uploads that switch to multipart above a size threshold

mod memory;
mod s3;
mod upload;

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StoreError;

pub use memory::{MemoryObjectStore, StoreCall};
pub use s3::S3ObjectStore;
pub use upload::{UploadStrategy, upload_file};

/// Inclusive byte range within an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub first: u64,
    pub last: u64,
}

impl ByteRange {
    pub fn new(first: u64, last: u64) -> Self {
        debug_assert!(first <= last, "empty byte range");
        Self { first, last }
    }

    /// Number of bytes covered
    pub fn len(&self) -> u64 {
        self.last - self.first + 1
    }

    /// Value for the HTTP `Range`/`x-amz-copy-source-range` header
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.first, self.last)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.first, self.last)
    }
}

/// A part accepted by the store, as submitted on completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Operations the backup needs from an object store
///
/// Keys are full object keys within a single bucket. Multipart sessions
/// are identified by the `upload_id` returned from
/// `create_multipart_upload` and must be completed or aborted.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Size of an existing object in bytes
    ///
    /// Returns `StoreError::NotFound` if the key does not exist.
    async fn head_object(&self, key: &str) -> Result<u64, StoreError>;

    /// Upload a local file as a single object
    async fn put_object(&self, key: &str, path: &Path) -> Result<(), StoreError>;

    /// Copy a whole object server-side in one request
    async fn copy_object(&self, source_key: &str, destination_key: &str)
    -> Result<(), StoreError>;

    /// Open a multipart session on `key`, returning its upload ID
    async fn create_multipart_upload(&self, key: &str) -> Result<String, StoreError>;

    /// Upload one part of a multipart session, returning its ETag
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String, StoreError>;

    /// Copy a byte range of `source_key` into a part of a multipart session
    /// on `destination_key`, returning the part ETag
    async fn upload_part_copy(
        &self,
        destination_key: &str,
        source_key: &str,
        upload_id: &str,
        part_number: u32,
        range: ByteRange,
    ) -> Result<String, StoreError>;

    /// Assemble the parts, ascending by part number, into the object
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StoreError>;

    /// Discard a multipart session and any parts already stored
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StoreError>;
}

pub(crate) fn build_s3_http_client() -> aws_sdk_s3::config::SharedHttpClient {
    use aws_smithy_runtime::client::http::hyper_014::HyperClientBuilder;

    let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();

    HyperClientBuilder::new().build(https_connector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_range_is_inclusive() {
        let range = ByteRange::new(5_242_880, 10_485_759);
        assert_eq!(range.len(), 5_242_880);
        assert_eq!(range.header_value(), "bytes=5242880-10485759");
        assert_eq!(range.to_string(), "[5242880,10485759]");
    }

    #[test]
    fn single_byte_range() {
        let range = ByteRange::new(0, 0);
        assert_eq!(range.len(), 1);
        assert_eq!(range.header_value(), "bytes=0-0");
    }
}
