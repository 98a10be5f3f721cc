//! Abstractions over S3-compatible storage used for the FinRAG fact tables.

mod memory;

pub use memory::{MemoryBucketStore, Operation};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::Bytes;
use std::fmt;
use std::ops::Range;
use thiserror::Error;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const LIST_PAGE_SIZE: usize = 1000;
/// Bodies above this size are uploaded in parts; a single PUT is capped at 5 GB.
const MULTIPART_THRESHOLD: usize = 64 * 1024 * 1024;
const MULTIPART_PART_SIZE: usize = 32 * 1024 * 1024;

#[derive(Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub force_path_style: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: "us-east-1".to_string(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            force_path_style: false,
        }
    }
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id.as_ref().map(|_| "<redacted>"))
            .field("secret_access_key", &self.secret_access_key.as_ref().map(|_| "<redacted>"))
            .field("force_path_style", &self.force_path_style)
            .finish()
    }
}

impl S3Config {
    /// Builds a config for `bucket` from the standard AWS variables of the current
    /// process environment. Callers load any secrets file before calling this.
    pub fn from_env(bucket: impl Into<String>) -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|value| !value.is_empty());

        Self {
            bucket: bucket.into(),
            region: var("AWS_DEFAULT_REGION")
                .or_else(|| var("AWS_REGION"))
                .unwrap_or_else(|| "us-east-1".to_string()),
            endpoint: var("AWS_ENDPOINT_URL"),
            access_key_id: var("AWS_ACCESS_KEY_ID"),
            secret_access_key: var("AWS_SECRET_ACCESS_KEY"),
            session_token: var("AWS_SESSION_TOKEN"),
            force_path_style: var("S3_FORCE_PATH_STYLE")
                .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Error)]
pub enum BucketError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("sdk error: {0}")]
    Sdk(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
}

impl BucketError {
    fn from_sdk(err: impl fmt::Display) -> Self {
        Self::Sdk(err.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Metadata returned by `head_object` and listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size_bytes: u64,
}

impl ObjectMeta {
    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / BYTES_PER_MB
    }
}

#[async_trait]
pub trait BucketStore: Send + Sync {
    fn bucket(&self) -> &str;

    /// Returns `Ok(None)` when the key does not exist.
    async fn head_object(&self, key: &str) -> Result<Option<ObjectMeta>, BucketError>;
    async fn get_object(&self, key: &str) -> Result<Bytes, BucketError>;
    async fn put_object(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), BucketError>;
    async fn copy_object(&self, source_key: &str, destination_key: &str)
        -> Result<(), BucketError>;
    async fn delete_object(&self, key: &str) -> Result<(), BucketError>;
    /// Lists every object under `prefix`, following continuation tokens.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<ObjectMeta>, BucketError>;
    /// Lists at most `limit` objects under `prefix`, in key order, without paging
    /// further than needed.
    async fn list_prefix_limited(
        &self,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<ObjectMeta>, BucketError>;
    /// Single-page listing used as a permission probe.
    async fn probe_prefix(&self, prefix: &str) -> Result<(), BucketError>;
}

#[derive(Clone)]
pub struct S3BucketStore {
    client: Client,
    bucket: String,
}

impl S3BucketStore {
    pub async fn new(config: S3Config) -> Result<Self, BucketError> {
        if config.bucket.is_empty() {
            return Err(BucketError::Configuration(
                "bucket name cannot be empty".into(),
            ));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            let credentials = Credentials::new(
                access_key,
                secret_key,
                config.session_token.clone(),
                None,
                "static",
            );
            loader = loader.credentials_provider(SharedCredentialsProvider::new(credentials));
        }

        let shared_config = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared_config);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        let client = Client::from_conf(builder.build());
        Ok(Self {
            client,
            bucket: config.bucket,
        })
    }

    /// The object only becomes visible once every part is uploaded; a failed upload is
    /// aborted so no parts linger.
    async fn put_multipart(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), BucketError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|err| map_sdk_error(err, key))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| BucketError::Sdk(format!("no upload id returned for '{key}'")))?
            .to_string();

        match self.upload_parts(key, &upload_id, &bytes).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|err| map_sdk_error(err, key))?;
                Ok(())
            }
            Err(err) => {
                let _ = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await;
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        bytes: &Bytes,
    ) -> Result<Vec<CompletedPart>, BucketError> {
        let mut parts = Vec::new();
        for (idx, range) in part_ranges(bytes.len(), MULTIPART_PART_SIZE)
            .into_iter()
            .enumerate()
        {
            let part_number = idx as i32 + 1;
            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(bytes.slice(range)))
                .send()
                .await
                .map_err(|err| map_sdk_error(err, key))?;
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
        }
        Ok(parts)
    }

    async fn list(
        &self,
        prefix: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ObjectMeta>, BucketError> {
        let mut objects = Vec::new();
        let mut continuation_token = None;
        if limit == Some(0) {
            return Ok(objects);
        }

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(max_keys) = page_size(limit, objects.len()) {
                request = request.max_keys(max_keys);
            }
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|err| map_sdk_error(err, prefix))?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    objects.push(ObjectMeta {
                        key: key.to_string(),
                        size_bytes: object.size().unwrap_or(0).max(0) as u64,
                    });
                }
            }

            if limit.is_some_and(|limit| objects.len() >= limit) {
                break;
            }
            match response.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        if let Some(limit) = limit {
            objects.truncate(limit);
        }
        Ok(objects)
    }
}

#[async_trait]
impl BucketStore for S3BucketStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectMeta>, BucketError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(ObjectMeta {
                key: key.to_string(),
                size_bytes: output.content_length().unwrap_or(0).max(0) as u64,
            })),
            Err(err) => match map_sdk_error(err, key) {
                BucketError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn get_object(&self, key: &str) -> Result<Bytes, BucketError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| map_sdk_error(err, key))?;

        let data = output.body.collect().await.map_err(BucketError::from_sdk)?;
        Ok(data.into_bytes())
    }

    async fn put_object(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), BucketError> {
        if bytes.len() > MULTIPART_THRESHOLD {
            return self.put_multipart(key, bytes, content_type).await;
        }

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|err| map_sdk_error(err, key))?;
        Ok(())
    }

    async fn copy_object(
        &self,
        source_key: &str,
        destination_key: &str,
    ) -> Result<(), BucketError> {
        let copy_source = format!("{}/{}", self.bucket, encode_copy_source(source_key));
        self.client
            .copy_object()
            .copy_source(copy_source)
            .bucket(&self.bucket)
            .key(destination_key)
            .send()
            .await
            .map_err(|err| map_sdk_error(err, source_key))?;
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<(), BucketError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| map_sdk_error(err, key))?;
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<ObjectMeta>, BucketError> {
        self.list(prefix, None).await
    }

    async fn list_prefix_limited(
        &self,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<ObjectMeta>, BucketError> {
        self.list(prefix, Some(limit)).await
    }

    async fn probe_prefix(&self, prefix: &str) -> Result<(), BucketError> {
        self.client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .max_keys(1)
            .send()
            .await
            .map_err(|err| map_sdk_error(err, prefix))?;
        Ok(())
    }
}

fn map_sdk_error<E: fmt::Debug>(err: SdkError<E>, key: &str) -> BucketError {
    match &err {
        SdkError::ServiceError(service_err) => match service_err.raw().status().as_u16() {
            404 => BucketError::NotFound(key.to_string()),
            401 | 403 => BucketError::AccessDenied(key.to_string()),
            status => BucketError::Sdk(format!("S3 error for '{key}' (HTTP {status}): {err:?}")),
        },
        _ => BucketError::Sdk(format!("S3 request for '{key}' failed: {err:?}")),
    }
}

/// Consecutive byte ranges of at most `part_size` covering `len` bytes.
fn part_ranges(len: usize, part_size: usize) -> Vec<Range<usize>> {
    (0..len)
        .step_by(part_size.max(1))
        .map(|start| start..(start + part_size).min(len))
        .collect()
}

/// Keys to request in the next listing page; `None` leaves the server default.
fn page_size(limit: Option<usize>, collected: usize) -> Option<i32> {
    limit.map(|limit| limit.saturating_sub(collected).min(LIST_PAGE_SIZE) as i32)
}

/// Percent-encodes a key for the `x-amz-copy-source` header, keeping `/` separators.
fn encode_copy_source(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                encoded.push(byte as char)
            }
            other => encoded.push_str(&format!("%{other:02X}")),
        }
    }
    encoded
}
