use std::path::Path;
use std::sync::Arc;

use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use object_store::local::LocalFileSystem;
use object_store::ObjectStore;
use tracing::info;

use vault_core::config::AwsConfig;

use crate::error::StorageError;

/// Unified storage backend wrapping object_store.
pub enum StorageBackend {
    Local(LocalBackend),
    S3(S3Backend),
}

impl StorageBackend {
    /// S3 when a bucket is configured, otherwise a local directory tree.
    pub fn from_config(config: &vault_core::Config) -> Result<Self, StorageError> {
        if config.aws.is_configured() {
            Ok(StorageBackend::S3(S3Backend::new(&config.aws)?))
        } else {
            std::fs::create_dir_all(&config.storage.data_dir)?;
            Ok(StorageBackend::Local(LocalBackend::new(&config.storage.data_dir)?))
        }
    }

    /// Get an Arc-wrapped ObjectStore.
    pub fn store_arc(&self) -> Arc<dyn ObjectStore> {
        match self {
            StorageBackend::Local(b) => b.store.clone(),
            StorageBackend::S3(b) => b.store.clone(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, StorageBackend::S3(_))
    }

    /// Key prefix every archive object lives under (e.g. "production").
    pub fn prefix(&self) -> &str {
        match self {
            StorageBackend::Local(_) => "",
            StorageBackend::S3(b) => &b.prefix,
        }
    }
}

/// Local filesystem backend.
pub struct LocalBackend {
    pub store: Arc<dyn ObjectStore>,
}

impl LocalBackend {
    pub fn new(data_dir: &Path) -> Result<Self, StorageError> {
        let canonical = std::fs::canonicalize(data_dir).unwrap_or_else(|_| data_dir.to_path_buf());
        let store = LocalFileSystem::new_with_prefix(&canonical)
            .map_err(|e| StorageError::Other(format!("local filesystem error: {e}")))?;
        info!("Storage: local backend at {}", canonical.display());
        Ok(Self {
            store: Arc::new(store),
        })
    }
}

/// S3 backend.
pub struct S3Backend {
    pub store: Arc<dyn ObjectStore>,
    pub prefix: String,
}

impl S3Backend {
    pub fn new(aws: &AwsConfig) -> Result<Self, StorageError> {
        let bucket = aws
            .s3_bucket
            .as_deref()
            .ok_or_else(|| StorageError::NotConfigured("S3_BUCKET not set".into()))?;

        // Lease acquisition needs create-if-absent semantics (If-None-Match).
        let mut builder = AmazonS3Builder::new()
            .with_region(&aws.region)
            .with_conditional_put(S3ConditionalPut::ETagMatch);

        if let Some(ref key) = aws.access_key_id {
            builder = builder.with_access_key_id(key);
        }
        if let Some(ref secret) = aws.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }
        if let Some(ref token) = aws.session_token {
            builder = builder.with_token(token);
        }

        match aws.endpoint_url.as_deref() {
            Some(endpoint) if !endpoint.is_empty() => {
                // Ensure endpoint has a scheme; object_store requires absolute URLs
                let endpoint_url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                    endpoint.to_string()
                } else {
                    format!("https://{}", endpoint)
                };
                builder = builder
                    .with_bucket_name(bucket)
                    .with_endpoint(&endpoint_url)
                    .with_allow_http(endpoint_url.starts_with("http://"));
            }
            _ => {
                // Standard AWS S3: use with_url for proper endpoint resolution
                builder = builder.with_url(format!("s3://{}", bucket));
            }
        }

        let store = builder.build()?;

        let prefix = aws
            .s3_prefix
            .as_deref()
            .unwrap_or("")
            .trim_matches('/')
            .to_string();

        info!(
            "Storage: S3 backend s3://{}/{} (region: {})",
            bucket, prefix, aws.region
        );

        Ok(Self {
            store: Arc::new(store),
            prefix,
        })
    }
}

/// Join an optional key prefix with a relative key.
pub fn object_key(prefix: &str, relative: &str) -> object_store::path::Path {
    if prefix.is_empty() {
        object_store::path::Path::from(relative)
    } else {
        object_store::path::Path::from(format!("{}/{}", prefix, relative))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_backend_creates() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(tmp.path()).unwrap();
        assert!(!StorageBackend::Local(backend).is_remote());
    }

    #[test]
    fn object_key_with_and_without_prefix() {
        assert_eq!(
            object_key("", "edgar/data/1001/index.json").as_ref(),
            "edgar/data/1001/index.json"
        );
        assert_eq!(
            object_key("prod", "edgar/data/1001/index.json").as_ref(),
            "prod/edgar/data/1001/index.json"
        );
    }
}
