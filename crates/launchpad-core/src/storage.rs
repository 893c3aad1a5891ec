//! Artifact storage using object_store.
//!
//! Archives are stored as whole objects under a flat `bucket/object` scheme.
//! Supports S3-compatible, local filesystem and in-memory backends.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, Attributes, ObjectStore, PutOptions, PutPayload};
use secrecy::SecretString;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::deserialize_secret;
use crate::error::{PipelineError, PipelineResult};
use crate::types::ArtifactKey;

/// Content type recorded on uploaded archives.
pub const ZIP_CONTENT_TYPE: &str = "application/zip";

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// S3-compatible object store.
    #[default]
    S3,
    /// Directory on the local filesystem, one subdirectory per bucket.
    Local,
    /// Process-local memory, lost on restart.
    Memory,
}

/// Configuration for artifact storage.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend to use.
    #[serde(default)]
    pub backend: StorageBackend,
    /// Bucket that archives are written to.
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Endpoint for S3-compatible stores.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Region for S3-compatible stores.
    #[serde(default)]
    pub region: Option<String>,
    /// Access key id.
    #[serde(default)]
    pub access_key_id: Option<String>,
    /// Secret access key.
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub secret_access_key: Option<SecretString>,
    /// Permit plain HTTP endpoints.
    #[serde(default)]
    pub allow_http: bool,
    /// Root directory for the local backend.
    #[serde(default = "default_local_root")]
    pub root: PathBuf,
    /// Deadline for a single upload.
    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,
    /// Deadline for a single download.
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

fn default_bucket() -> String {
    "zenith123".to_owned()
}

fn default_local_root() -> PathBuf {
    PathBuf::from("./artifacts")
}

const fn default_upload_timeout_secs() -> u64 {
    600
}

const fn default_download_timeout_secs() -> u64 {
    300
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            bucket: default_bucket(),
            endpoint: None,
            region: None,
            access_key_id: None,
            secret_access_key: None,
            allow_http: false,
            root: default_local_root(),
            upload_timeout_secs: default_upload_timeout_secs(),
            download_timeout_secs: default_download_timeout_secs(),
        }
    }
}

impl StorageConfig {
    /// In-memory storage, for tests and local experiments.
    #[must_use]
    pub fn memory(bucket: impl Into<String>) -> Self {
        Self {
            backend: StorageBackend::Memory,
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    /// Upload deadline.
    #[must_use]
    pub const fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    /// Download deadline.
    #[must_use]
    pub const fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

/// Store and retrieve archives by key.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Whether an object exists. A missing object is `Ok(false)`.
    async fn exists(&self, key: &ArtifactKey) -> PipelineResult<bool>;

    /// Upload a local file, replacing any existing object.
    async fn put(&self, key: &ArtifactKey, source: &Path, content_type: &str)
        -> PipelineResult<u64>;

    /// Download an object to a local file, creating parent directories.
    async fn get(&self, key: &ArtifactKey, dest: &Path) -> PipelineResult<u64>;
}

/// Artifact store backed by `object_store`.
pub struct ObjectArtifactStore {
    config: StorageConfig,
    buckets: DashMap<String, Arc<dyn ObjectStore>>,
}

impl std::fmt::Debug for ObjectArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectArtifactStore")
            .field("backend", &self.config.backend)
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

impl ObjectArtifactStore {
    /// Create a store from configuration. Backends are created lazily per bucket.
    #[must_use]
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    /// Use a pre-built object store for one bucket.
    #[must_use]
    pub fn with_bucket_store(self, bucket: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        self.buckets.insert(bucket.into(), store);
        self
    }

    /// List object names in a bucket.
    pub async fn list(&self, bucket: &str) -> PipelineResult<Vec<String>> {
        let store = self.store_for(bucket)?;
        let mut names = Vec::new();
        let mut stream = store.list(None);
        while let Some(result) = stream.next().await {
            let meta = result.map_err(|e| PipelineError::transfer(bucket, e))?;
            names.push(meta.location.to_string());
        }
        names.sort();
        Ok(names)
    }

    fn store_for(&self, bucket: &str) -> PipelineResult<Arc<dyn ObjectStore>> {
        if let Some(store) = self.buckets.get(bucket) {
            return Ok(Arc::clone(store.value()));
        }
        let created = create_object_store(&self.config, bucket)?;
        let store = self
            .buckets
            .entry(bucket.to_owned())
            .or_insert(created)
            .value()
            .clone();
        Ok(store)
    }
}

#[async_trait]
impl ArtifactStore for ObjectArtifactStore {
    async fn exists(&self, key: &ArtifactKey) -> PipelineResult<bool> {
        let store = self.store_for(&key.bucket)?;
        let path = ObjectPath::from(key.object.as_str());

        match store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(PipelineError::transfer(&key.object, e)),
        }
    }

    async fn put(
        &self,
        key: &ArtifactKey,
        source: &Path,
        content_type: &str,
    ) -> PipelineResult<u64> {
        let store = self.store_for(&key.bucket)?;
        let path = ObjectPath::from(key.object.as_str());
        let limit = self.config.upload_timeout();

        let data = tokio::fs::read(source).await?;
        let size = data.len() as u64;
        // The local backend rejects object attributes.
        let mut attributes = Attributes::new();
        if self.config.backend != StorageBackend::Local {
            attributes.insert(Attribute::ContentType, content_type.to_owned().into());
        }
        let options = PutOptions {
            attributes,
            ..PutOptions::default()
        };
        let payload = PutPayload::from(Bytes::from(data));

        debug!(bucket = %key.bucket, object = %key.object, size, "uploading");
        let start = Instant::now();
        tokio::time::timeout(limit, store.put_opts(&path, payload, options))
            .await
            .map_err(|_| PipelineError::TransferTimeout {
                object: key.object.clone(),
                limit,
            })?
            .map_err(|e| PipelineError::transfer(&key.object, e))?;

        info!(
            bucket = %key.bucket,
            object = %key.object,
            size,
            duration_secs = start.elapsed().as_secs_f32(),
            "artifact uploaded"
        );
        Ok(size)
    }

    async fn get(&self, key: &ArtifactKey, dest: &Path) -> PipelineResult<u64> {
        let store = self.store_for(&key.bucket)?;
        let path = ObjectPath::from(key.object.as_str());
        let limit = self.config.download_timeout();

        let start = Instant::now();
        let data = tokio::time::timeout(limit, async {
            let result = store.get(&path).await?;
            result.bytes().await
        })
        .await
        .map_err(|_| PipelineError::TransferTimeout {
            object: key.object.clone(),
            limit,
        })?
        .map_err(|e| match e {
            object_store::Error::NotFound { .. } => PipelineError::NotFound {
                bucket: key.bucket.clone(),
                object: key.object.clone(),
            },
            other => PipelineError::transfer(&key.object, other),
        })?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &data).await?;

        let size = data.len() as u64;
        info!(
            bucket = %key.bucket,
            object = %key.object,
            size,
            duration_secs = start.elapsed().as_secs_f32(),
            "artifact downloaded"
        );
        Ok(size)
    }
}

/// Create an object store for one bucket from configuration.
fn create_object_store(
    config: &StorageConfig,
    bucket: &str,
) -> PipelineResult<Arc<dyn ObjectStore>> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(object_store::memory::InMemory::new())),
        StorageBackend::Local => {
            let root = config.root.join(bucket);
            std::fs::create_dir_all(&root)?;
            let store = object_store::local::LocalFileSystem::new_with_prefix(&root)
                .map_err(|e| PipelineError::Config(format!("failed to create local store: {e}")))?;
            Ok(Arc::new(store))
        }
        #[cfg(feature = "aws")]
        StorageBackend::S3 => {
            use object_store::aws::AmazonS3Builder;
            use secrecy::ExposeSecret;

            let mut builder = AmazonS3Builder::new()
                .with_bucket_name(bucket)
                .with_allow_http(config.allow_http);

            if let Some(region) = &config.region {
                builder = builder.with_region(region);
            }
            if let Some(endpoint) = &config.endpoint {
                builder = builder.with_endpoint(endpoint);
            }
            if let Some(key_id) = &config.access_key_id {
                builder = builder.with_access_key_id(key_id);
            }
            if let Some(secret) = &config.secret_access_key {
                builder = builder.with_secret_access_key(secret.expose_secret());
            }

            let store = builder
                .build()
                .map_err(|e| PipelineError::Config(format!("failed to create S3 store: {e}")))?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "aws"))]
        StorageBackend::S3 => Err(PipelineError::Config(
            "s3 backend requires the aws feature".to_owned(),
        )),
    }
}
