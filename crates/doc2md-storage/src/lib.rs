// doc2md-storage - Object-store gateway
//
// All blob I/O goes through this crate:
// - Download source documents by (bucket, key) with size verification
// - Upload single artifacts or whole result trees with ASCII-safe metadata
// - Presign download URLs
// - Derive deterministic output keys and parse object URLs (keys module)
//
// Backends are reached through OpenDAL. Production configures two S3
// directions (source documents and converted artifacts may live on different
// endpoints); embedders and tests can pin a single Operator instead.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use opendal::{services, Operator};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use doc2md_config::{S3Settings, StorageConfig};
use doc2md_core::TaskType;

pub mod keys;

pub use keys::{
    content_type_for, derive_output_key, derive_output_prefix, format_s3_url, parse_url,
    OutputKeySource,
};

/// Unified error type for gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("object not found: s3://{bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("size mismatch for {what}: expected {expected}, got {actual}")]
    SizeMismatch {
        what: String,
        expected: u64,
        actual: u64,
    },

    #[error("local file is empty: {0}")]
    EmptyFile(String),

    #[error("local path error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<opendal::Error> for GatewayError {
    fn from(err: opendal::Error) -> Self {
        GatewayError::Backend(err.to_string())
    }
}

/// Result of a verified download.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub size: u64,
    pub content_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Result of a verified single-file upload.
#[derive(Debug, Clone)]
pub struct UploadResult {
    pub s3_url: String,
    pub http_url: Option<String>,
    pub size: u64,
}

/// One successfully uploaded file of a directory tree.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub relative_path: String,
    pub key: String,
    pub s3_url: String,
    pub size: u64,
}

/// One file of a directory tree that failed to upload.
#[derive(Debug, Clone)]
pub struct FailedFile {
    pub relative_path: String,
    pub key: String,
    pub error: String,
}

/// Result of a directory upload. `uploaded` is ordered lexically by relative
/// path, which makes `s3_urls` deterministic.
#[derive(Debug, Clone, Default)]
pub struct DirectoryUploadResult {
    pub uploaded: Vec<UploadedFile>,
    pub failed: Vec<FailedFile>,
    pub total_size: u64,
}

impl DirectoryUploadResult {
    pub fn success(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Direction {
    Download,
    Upload,
}

enum OperatorSource {
    /// Per-direction S3 settings; operators are built per bucket and cached.
    S3 {
        download: S3Settings,
        upload: S3Settings,
        cache: Mutex<HashMap<(Direction, String), Operator>>,
    },
    /// One operator serves every bucket. Used by tests and fs-backed
    /// deployments.
    Pinned(Operator),
}

pub struct ObjectStoreGateway {
    source: OperatorSource,
    upload_bucket: String,
}

impl ObjectStoreGateway {
    pub fn new(storage: &StorageConfig) -> Self {
        info!(
            "Object-store gateway: download endpoint {:?}, upload endpoint {:?}, upload bucket {}",
            storage.download.endpoint, storage.upload.endpoint, storage.upload.bucket
        );
        Self {
            upload_bucket: storage.upload.bucket.clone(),
            source: OperatorSource::S3 {
                download: storage.download.clone(),
                upload: storage.upload.clone(),
                cache: Mutex::new(HashMap::new()),
            },
        }
    }

    /// Pin every bucket to one pre-built operator.
    pub fn with_operator(operator: Operator, upload_bucket: impl Into<String>) -> Self {
        Self {
            source: OperatorSource::Pinned(operator),
            upload_bucket: upload_bucket.into(),
        }
    }

    /// Default bucket converted artifacts are uploaded to.
    pub fn upload_bucket(&self) -> &str {
        &self.upload_bucket
    }

    fn operator(&self, direction: Direction, bucket: &str) -> Result<Operator, GatewayError> {
        match &self.source {
            OperatorSource::Pinned(op) => Ok(op.clone()),
            OperatorSource::S3 {
                download,
                upload,
                cache,
            } => {
                let cache_key = (direction, bucket.to_string());
                if let Some(op) = cache.lock().get(&cache_key) {
                    return Ok(op.clone());
                }

                let settings = match direction {
                    Direction::Download => download,
                    Direction::Upload => upload,
                };
                let mut builder = services::S3::default()
                    .bucket(bucket)
                    .region(&settings.region);
                if let Some(endpoint) = &settings.endpoint {
                    builder = builder.endpoint(endpoint);
                }
                if let Some(access_key_id) = &settings.access_key_id {
                    builder = builder.access_key_id(access_key_id);
                }
                if let Some(secret) = &settings.secret_access_key {
                    builder = builder.secret_access_key(secret);
                }

                let op = Operator::new(builder)?.finish();
                cache.lock().insert(cache_key, op.clone());
                Ok(op)
            }
        }
    }

    fn settings_for(&self, direction: Direction) -> Option<&S3Settings> {
        match &self.source {
            OperatorSource::Pinned(_) => None,
            OperatorSource::S3 {
                download, upload, ..
            } => Some(match direction {
                Direction::Download => download,
                Direction::Upload => upload,
            }),
        }
    }

    /// Public HTTP form of an uploaded object, when the endpoint is known.
    fn http_url_for(&self, bucket: &str, key: &str) -> Option<String> {
        let settings = self.settings_for(Direction::Upload)?;
        match &settings.endpoint {
            Some(endpoint) => Some(format!("{}/{}/{}", endpoint.trim_end_matches('/'), bucket, key)),
            None if settings.region == "us-east-1" => {
                Some(format!("https://{}.s3.amazonaws.com/{}", bucket, key))
            }
            None => Some(format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                bucket, settings.region, key
            )),
        }
    }

    /// Download an object to a local path, verifying the byte count against
    /// the object's metadata.
    pub async fn download(
        &self,
        bucket: &str,
        key: &str,
        local_path: &Path,
    ) -> Result<DownloadResult, GatewayError> {
        let op = self.operator(Direction::Download, bucket)?;

        let meta = op.stat(key).await.map_err(|e| {
            if e.kind() == opendal::ErrorKind::NotFound {
                GatewayError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
            } else {
                e.into()
            }
        })?;
        let expected = meta.content_length();

        debug!("Downloading s3://{}/{} ({} bytes)", bucket, key, expected);

        let buffer = op.read(key).await?;
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local_path, buffer.to_bytes()).await?;

        let written = tokio::fs::metadata(local_path).await?.len();
        if written != expected {
            return Err(GatewayError::SizeMismatch {
                what: format!("s3://{}/{}", bucket, key),
                expected,
                actual: written,
            });
        }

        Ok(DownloadResult {
            size: written,
            content_type: meta.content_type().map(str::to_string),
            last_modified: meta.last_modified(),
        })
    }

    /// Read an object fully into memory (download proxy path).
    pub async fn read(&self, bucket: &str, key: &str) -> Result<Vec<u8>, GatewayError> {
        let op = self.operator(Direction::Download, bucket)?;
        let buffer = op.read(key).await.map_err(|e| {
            if e.kind() == opendal::ErrorKind::NotFound {
                GatewayError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
            } else {
                e.into()
            }
        })?;
        Ok(buffer.to_vec())
    }

    /// Upload one file, with Content-Type from the extension table and
    /// optional ASCII-safe user metadata. The uploaded size is verified
    /// post-hoc via a stat call.
    pub async fn upload_file(
        &self,
        local_path: &Path,
        bucket: &str,
        key: &str,
        metadata: &[(String, String)],
    ) -> Result<UploadResult, GatewayError> {
        let data = tokio::fs::read(local_path).await?;
        if data.is_empty() {
            return Err(GatewayError::EmptyFile(local_path.display().to_string()));
        }
        let size = data.len() as u64;
        let content_type = content_type_for(local_path);

        debug!(
            "Uploading {} -> s3://{}/{} ({} bytes, {})",
            local_path.display(),
            bucket,
            key,
            size,
            content_type
        );

        let op = self.operator(Direction::Upload, bucket)?;
        // Not every backend takes content types or user metadata (fs and the
        // in-memory test service do not); skip the options the backend lacks.
        let capability = op.info().full_capability();
        let mut write = op.write_with(key, data);
        if capability.write_with_content_type {
            write = write.content_type(content_type);
        }
        if !metadata.is_empty() && capability.write_with_user_metadata {
            write = write.user_metadata(metadata.iter().cloned());
        }
        write.await?;

        let uploaded = op.stat(key).await?.content_length();
        if uploaded != size {
            return Err(GatewayError::SizeMismatch {
                what: format!("s3://{}/{}", bucket, key),
                expected: size,
                actual: uploaded,
            });
        }

        Ok(UploadResult {
            s3_url: format_s3_url(bucket, key),
            http_url: self.http_url_for(bucket, key),
            size,
        })
    }

    /// Upload a directory tree under a key prefix. Each file carries the
    /// shared metadata plus its base64-encoded relative path. Files are
    /// uploaded in lexical order of their relative path.
    pub async fn upload_directory(
        &self,
        local_dir: &Path,
        bucket: &str,
        key_prefix: &str,
        metadata: &[(String, String)],
    ) -> Result<DirectoryUploadResult, GatewayError> {
        let files = collect_files(local_dir).await?;
        let prefix = key_prefix.trim_end_matches('/');

        let mut result = DirectoryUploadResult::default();
        for relative in files {
            let local_path = local_dir.join(&relative);
            let relative_str = relative
                .to_str()
                .map(|s| s.replace('\\', "/"))
                .unwrap_or_else(|| relative.to_string_lossy().into_owned());
            let key = format!("{}/{}", prefix, relative_str);

            let mut file_metadata = metadata.to_vec();
            file_metadata.push((
                "relative-path-base64".to_string(),
                BASE64.encode(relative_str.as_bytes()),
            ));
            file_metadata.push((
                "file-type".to_string(),
                local_path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.to_ascii_lowercase())
                    .unwrap_or_default(),
            ));
            file_metadata.push(("upload-batch".to_string(), "directory-upload".to_string()));

            match self
                .upload_file(&local_path, bucket, &key, &file_metadata)
                .await
            {
                Ok(uploaded) => {
                    result.total_size += uploaded.size;
                    result.uploaded.push(UploadedFile {
                        relative_path: relative_str,
                        key,
                        s3_url: uploaded.s3_url,
                        size: uploaded.size,
                    });
                }
                Err(e) => {
                    warn!("Failed to upload {}: {}", relative_str, e);
                    result.failed.push(FailedFile {
                        relative_path: relative_str,
                        key,
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(result)
    }

    /// Presigned download URL, or None when the backend cannot presign.
    pub async fn presign(&self, bucket: &str, key: &str, ttl: Duration) -> Option<String> {
        let op = self.operator(Direction::Download, bucket).ok()?;
        match op.presign_read(key, ttl).await {
            Ok(req) => Some(req.uri().to_string()),
            Err(e) => {
                warn!("Failed to presign s3://{}/{}: {}", bucket, key, e);
                None
            }
        }
    }
}

/// Recursively collect file paths under a directory, relative to it, sorted
/// lexically for deterministic upload order.
async fn collect_files(root: &Path) -> Result<Vec<PathBuf>, GatewayError> {
    if !tokio::fs::try_exists(root).await? {
        return Err(GatewayError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("directory not found: {}", root.display()),
        )));
    }

    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() {
                if let Ok(relative) = path.strip_prefix(root) {
                    files.push(relative.to_path_buf());
                }
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Standard metadata set for a converted artifact. Non-ASCII values (original
/// filename and folder) are carried only in base64 and hex form because S3
/// metadata must be ASCII.
pub fn conversion_metadata(
    task_id: i64,
    task_type: TaskType,
    original_filename: Option<&str>,
    original_folder: Option<&str>,
    original_bucket: Option<&str>,
) -> Vec<(String, String)> {
    let filename = original_filename.unwrap_or("");
    let folder = original_folder.unwrap_or("");

    vec![
        ("task-id".to_string(), task_id.to_string()),
        ("upload-time".to_string(), Utc::now().to_rfc3339()),
        (
            "conversion-type".to_string(),
            task_type.as_str().to_string(),
        ),
        (
            "original-bucket".to_string(),
            original_bucket.unwrap_or("").to_string(),
        ),
        (
            "original-filename-base64".to_string(),
            BASE64.encode(filename.as_bytes()),
        ),
        (
            "original-filename-utf8".to_string(),
            hex::encode(filename.as_bytes()),
        ),
        (
            "original-folder-base64".to_string(),
            BASE64.encode(folder.as_bytes()),
        ),
        (
            "original-folder-utf8".to_string(),
            hex::encode(folder.as_bytes()),
        ),
    ]
}
