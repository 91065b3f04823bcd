//! S3-compatible object store
//!
//! Talks to AWS S3, MinIO, R2, and other stores speaking the S3 API.
//! All operations target a single bucket.

use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;

use super::{ByteRange, CompletedPart, ObjectStore};
use crate::config::StorageConfig;
use crate::error::{AppError, StoreError};

/// Object store backed by an S3-compatible service
pub struct S3ObjectStore {
    /// S3-compatible client
    client: S3Client,
    /// Bucket holding every backup object
    bucket: String,
}

impl S3ObjectStore {
    /// Create a new store client
    ///
    /// # Arguments
    /// * `config` - Endpoint, credentials, and bucket
    ///
    /// # Errors
    /// Returns error if the endpoint is not a valid URL
    pub fn new(config: &StorageConfig) -> Result<Self, AppError> {
        use aws_sdk_s3::config::BehaviorVersion;
        use aws_sdk_s3::config::{Credentials, Region};

        url::Url::parse(&config.endpoint)
            .map_err(|e| AppError::Config(format!("storage.endpoint is invalid: {}", e)))?;

        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "pgdump-s3-static",
        );

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .http_client(super::build_s3_http_client())
            .region(Region::new(config.region.clone()))
            .endpoint_url(&config.endpoint)
            .credentials_provider(credentials)
            .force_path_style(config.force_path_style)
            .build();

        Ok(Self {
            client: S3Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
        })
    }

    /// Bucket this store writes to
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn copy_source(&self, key: &str) -> String {
        format!("{}/{}", self.bucket, encode_key(key))
    }
}

/// URL-encode a key for `x-amz-copy-source`, keeping `/` separators
fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn request_error<E>(operation: &'static str, error: E) -> StoreError
where
    E: std::error::Error,
{
    StoreError::request(operation, DisplayErrorContext(error).to_string())
}

fn part_number_i32(operation: &'static str, part_number: u32) -> Result<i32, StoreError> {
    i32::try_from(part_number).map_err(|_| {
        StoreError::request(operation, format!("part number {} out of range", part_number))
    })
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn head_object(&self, key: &str) -> Result<u64, StoreError> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(error) => {
                // Some S3-compatible stores answer HEAD misses with a bare 404
                let not_found = error
                    .as_service_error()
                    .is_some_and(|service_error| service_error.is_not_found())
                    || error
                        .raw_response()
                        .is_some_and(|response| response.status().as_u16() == 404);
                if not_found {
                    return Err(StoreError::NotFound {
                        key: key.to_string(),
                    });
                }
                return Err(request_error("HeadObject", error));
            }
        };

        let length = output
            .content_length()
            .ok_or_else(|| StoreError::request("HeadObject", "response has no content length"))?;
        u64::try_from(length).map_err(|_| {
            StoreError::request("HeadObject", format!("invalid content length {}", length))
        })
    }

    async fn put_object(&self, key: &str, path: &Path) -> Result<(), StoreError> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| request_error("PutObject", e))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|e| request_error("PutObject", e))?;

        Ok(())
    }

    async fn copy_object(
        &self,
        source_key: &str,
        destination_key: &str,
    ) -> Result<(), StoreError> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(destination_key)
            .copy_source(self.copy_source(source_key))
            .send()
            .await
            .map_err(|e| request_error("CopyObject", e))?;

        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String, StoreError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|e| request_error("CreateMultipartUpload", e))?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| StoreError::request("CreateMultipartUpload", "response has no upload ID"))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String, StoreError> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number_i32("UploadPart", part_number)?)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| request_error("UploadPart", e))?;

        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| StoreError::request("UploadPart", "response has no ETag"))
    }

    async fn upload_part_copy(
        &self,
        destination_key: &str,
        source_key: &str,
        upload_id: &str,
        part_number: u32,
        range: ByteRange,
    ) -> Result<String, StoreError> {
        let output = self
            .client
            .upload_part_copy()
            .bucket(&self.bucket)
            .key(destination_key)
            .upload_id(upload_id)
            .part_number(part_number_i32("UploadPartCopy", part_number)?)
            .copy_source(self.copy_source(source_key))
            .copy_source_range(range.header_value())
            .send()
            .await
            .map_err(|e| request_error("UploadPartCopy", e))?;

        output
            .copy_part_result()
            .and_then(|result| result.e_tag())
            .map(str::to_string)
            .ok_or_else(|| StoreError::request("UploadPartCopy", "response has no ETag"))
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StoreError> {
        use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};

        let parts = parts
            .iter()
            .map(|part| {
                Ok(S3CompletedPart::builder()
                    .part_number(part_number_i32("CompleteMultipartUpload", part.part_number)?)
                    .e_tag(&part.etag)
                    .build())
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let multipart = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(multipart)
            .send()
            .await
            .map_err(|e| request_error("CompleteMultipartUpload", e))?;

        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StoreError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| request_error("AbortMultipartUpload", e))?;

        Ok(())
    }
}
