//! Durable object storage for recordings
//!
//! Thin wrapper over `object_store` with local, S3 and in-memory backends.
//! Keys are tenant-namespaced by the callers; the wrapper only applies the
//! configured prefix.

use crate::config::StorageConfig;
use crate::errors::{AppError, Result};
use axum::http::Method;
use bytes::Bytes;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::signer::Signer;
use object_store::ObjectStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Storage key for the delivered recording of a call
pub fn recording_key(tenant_id: Uuid, cdr_id: Uuid, extension: &str) -> String {
    format!("tenants/{}/recordings/{}.{}", tenant_id, cdr_id, extension)
}

/// Storage key where a raw PBX recording may have been mirrored earlier
pub fn pbx_mirror_key(tenant_id: Uuid, dir: &str, filename: &str) -> String {
    let dir = dir.trim_matches('/');
    if dir.is_empty() {
        format!("tenants/{}/pbx/{}", tenant_id, filename)
    } else {
        format!("tenants/{}/pbx/{}/{}", tenant_id, dir, filename)
    }
}

/// Object store handle shared by the pipeline and the query API
#[derive(Clone)]
pub struct BlobStore {
    inner: Arc<dyn ObjectStore>,
    signer: Option<Arc<AmazonS3>>,
    prefix: String,
    local_root: Option<PathBuf>,
    signed_url_ttl: Duration,
}

impl BlobStore {
    /// Build the configured backend
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let ttl = Duration::from_secs(config.signed_url_ttl_secs);

        match config.backend.as_str() {
            "local" => {
                let root = PathBuf::from(&config.local_path);
                std::fs::create_dir_all(&root)?;
                let store = LocalFileSystem::new_with_prefix(&root).map_err(storage_error)?;
                info!(path = %root.display(), "Using local object storage");

                Ok(Self {
                    inner: Arc::new(store),
                    signer: None,
                    prefix: config.prefix.clone().unwrap_or_default(),
                    local_root: Some(root),
                    signed_url_ttl: ttl,
                })
            }
            "s3" => {
                let bucket = config.bucket.as_deref().ok_or_else(|| AppError::Configuration {
                    message: "storage.bucket is required for the s3 backend".into(),
                })?;

                let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
                if let Some(region) = config.region.as_deref() {
                    builder = builder.with_region(region);
                }
                if let Some(endpoint) = config.endpoint.as_deref().filter(|e| !e.is_empty()) {
                    builder = builder.with_endpoint(endpoint).with_allow_http(true);
                }
                if let (Some(key), Some(secret)) =
                    (config.access_key.as_deref(), config.secret_key.as_deref())
                {
                    builder = builder
                        .with_access_key_id(key)
                        .with_secret_access_key(secret);
                }

                let s3 = Arc::new(builder.build().map_err(storage_error)?);
                info!(bucket, "Using S3 object storage");

                Ok(Self {
                    inner: s3.clone(),
                    signer: Some(s3),
                    prefix: config.prefix.clone().unwrap_or_default(),
                    local_root: None,
                    signed_url_ttl: ttl,
                })
            }
            "memory" => Ok(Self::in_memory()),
            other => Err(AppError::Configuration {
                message: format!("Unknown storage backend: {}", other),
            }),
        }
    }

    /// Volatile store for tests and local runs
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(InMemory::new()),
            signer: None,
            prefix: String::new(),
            local_root: None,
            signed_url_ttl: Duration::from_secs(3600),
        }
    }

    fn object_path(&self, key: &str) -> ObjectPath {
        let key = key.trim_start_matches('/');
        if self.prefix.is_empty() {
            ObjectPath::from(key)
        } else {
            ObjectPath::from(format!("{}/{}", self.prefix.trim_end_matches('/'), key))
        }
    }

    pub async fn put(&self, key: &str, bytes: Bytes) -> Result<()> {
        let size = bytes.len();
        self.inner
            .put(&self.object_path(key), bytes.into())
            .await
            .map_err(|e| map_store_error(key, e))?;

        debug!(key, size, "Stored object");
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Bytes> {
        let result = self
            .inner
            .get(&self.object_path(key))
            .await
            .map_err(|e| map_store_error(key, e))?;

        result.bytes().await.map_err(|e| map_store_error(key, e))
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self.inner.head(&self.object_path(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(map_store_error(key, e)),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        match self.inner.delete(&self.object_path(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(map_store_error(key, e)),
        }
    }

    /// Time-limited GET URL, when the backend can sign one
    pub async fn signed_url(&self, key: &str) -> Result<Option<String>> {
        match &self.signer {
            Some(signer) => {
                let url = signer
                    .signed_url(Method::GET, &self.object_path(key), self.signed_url_ttl)
                    .await
                    .map_err(|e| map_store_error(key, e))?;
                Ok(Some(url.to_string()))
            }
            None => Ok(None),
        }
    }

    /// Filesystem location of a key for the local backend
    pub fn local_path(&self, key: &str) -> Option<PathBuf> {
        self.local_root
            .as_ref()
            .map(|root| root.join(self.object_path(key).as_ref()))
    }
}

fn map_store_error(key: &str, e: object_store::Error) -> AppError {
    match e {
        object_store::Error::NotFound { .. } => AppError::StorageNotFound {
            path: key.to_string(),
        },
        other => storage_error(other),
    }
}

fn storage_error(e: object_store::Error) -> AppError {
    AppError::Storage {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureKind;

    #[test]
    fn test_recording_keys_are_tenant_scoped() {
        let tenant = Uuid::nil();
        let cdr = Uuid::nil();

        assert_eq!(
            recording_key(tenant, cdr, "mp3"),
            format!("tenants/{}/recordings/{}.mp3", tenant, cdr)
        );
        assert_eq!(
            pbx_mirror_key(tenant, "2026-02/", "rec.wav"),
            format!("tenants/{}/pbx/2026-02/rec.wav", tenant)
        );
        assert_eq!(
            pbx_mirror_key(tenant, "", "rec.wav"),
            format!("tenants/{}/pbx/rec.wav", tenant)
        );
    }

    #[tokio::test]
    async fn test_in_memory_roundtrip() {
        let store = BlobStore::in_memory();
        let key = "tenants/a/recordings/b.mp3";

        assert!(!store.exists(key).await.unwrap());
        store.put(key, Bytes::from_static(b"ID3")).await.unwrap();
        assert!(store.exists(key).await.unwrap());
        assert_eq!(store.get(key).await.unwrap().as_ref(), b"ID3");
        assert!(store.signed_url(key).await.unwrap().is_none());

        store.delete(key).await.unwrap();
        assert!(!store.exists(key).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_object_is_permanent() {
        let store = BlobStore::in_memory();
        let err = store.get("nope").await.unwrap_err();

        assert!(matches!(err, AppError::StorageNotFound { .. }));
        assert_eq!(err.failure_kind(), FailureKind::Permanent);
    }

    #[tokio::test]
    async fn test_local_backend_with_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            backend: "local".into(),
            local_path: dir.path().to_string_lossy().into_owned(),
            prefix: Some("callscope".into()),
            ..Default::default()
        };

        let store = BlobStore::new(&config).unwrap();
        store.put("tenants/t/x.wav", Bytes::from_static(b"RIFF")).await.unwrap();

        let path = store.local_path("tenants/t/x.wav").unwrap();
        assert!(path.ends_with("callscope/tenants/t/x.wav"));
        assert!(path.exists());
    }
}
