//! OpenDAL-backed provider for filesystem and S3-compatible remotes.
//!
//! One provider instance wraps one OpenDAL `Operator` rooted at the
//! configured location. Capacity is part of the provider configuration
//! (local directories and most S3 gateways report no quota of their own);
//! `usage()` still counts the stored bytes live on every call.

use std::path::Path;

use opendal::Operator;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use cloudfs_core::{CloudfsError, CloudfsResult};

use crate::{
    Capabilities, DownloadReceipt, Provider, ProviderHealth, ProgressFn, UploadReceipt, Usage,
    VerifyReport,
};

#[derive(Debug, Clone)]
pub struct OpendalProviderConfig {
    pub id: String,
    /// "fs" or "s3".
    pub kind: String,
    pub display_name: String,
    /// Filesystem root for `fs`, bucket root prefix for `s3`.
    pub root: String,
    /// S3 only.
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub bucket: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Advertised capacity in bytes. `None` means unbounded.
    pub capacity_bytes: Option<i64>,
    pub requires_encryption: bool,
}

pub struct OpendalProvider {
    config: OpendalProviderConfig,
    op: Operator,
}

fn map_opendal(provider: &str, e: opendal::Error) -> CloudfsError {
    if e.kind() == opendal::ErrorKind::NotFound {
        CloudfsError::not_found(e.to_string())
    } else {
        CloudfsError::remote(provider, e.to_string())
    }
}

impl OpendalProvider {
    pub fn new(config: OpendalProviderConfig) -> CloudfsResult<Self> {
        let op = match config.kind.as_str() {
            "fs" => {
                let builder = opendal::services::Fs::default().root(&config.root);
                Operator::new(builder)
                    .map_err(|e| map_opendal(&config.id, e))?
                    .layer(opendal::layers::RetryLayer::new().with_max_times(3).with_jitter())
                    .finish()
            }
            "s3" => {
                let bucket = config
                    .bucket
                    .as_deref()
                    .ok_or_else(|| CloudfsError::invalid("s3 provider needs a bucket"))?;
                let mut builder = opendal::services::S3::default()
                    .bucket(bucket)
                    .root(&config.root);
                if let Some(endpoint) = &config.endpoint {
                    builder = builder.endpoint(endpoint);
                }
                if let Some(region) = &config.region {
                    builder = builder.region(region);
                }
                if let Some(key) = &config.access_key_id {
                    builder = builder.access_key_id(key);
                }
                if let Some(secret) = &config.secret_access_key {
                    builder = builder.secret_access_key(secret);
                }
                Operator::new(builder)
                    .map_err(|e| map_opendal(&config.id, e))?
                    .layer(opendal::layers::RetryLayer::new().with_max_times(3).with_jitter())
                    .finish()
            }
            other => {
                return Err(CloudfsError::Unsupported(format!(
                    "provider kind {other:?}"
                )))
            }
        };
        Ok(Self { config, op })
    }

    fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    async fn stored_bytes(&self) -> CloudfsResult<i64> {
        let entries = self
            .op
            .list_with("")
            .recursive(true)
            .await
            .map_err(|e| map_opendal(&self.config.id, e))?;
        let mut total: i64 = 0;
        for entry in entries {
            let meta = entry.metadata();
            if meta.is_file() {
                total += meta.content_length() as i64;
            }
        }
        Ok(total)
    }
}

#[async_trait::async_trait]
impl Provider for OpendalProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn kind(&self) -> &str {
        &self.config.kind
    }

    fn display_name(&self) -> &str {
        &self.config.display_name
    }

    async fn init(&self) -> CloudfsResult<()> {
        self.op
            .check()
            .await
            .map_err(|e| map_opendal(&self.config.id, e))
    }

    async fn capabilities(&self) -> CloudfsResult<Capabilities> {
        Ok(Capabilities {
            max_chunk_size: 5 * 1024 * 1024 * 1024,
            supports_versioning: false,
            supports_resume: false,
            concurrent_uploads: 1,
            requires_encryption: self.config.requires_encryption,
            supports_direct_upload: true,
        })
    }

    async fn usage(&self) -> CloudfsResult<Usage> {
        let used = self.stored_bytes().await?;
        let total = self.config.capacity_bytes.unwrap_or(i64::MAX);
        Ok(Usage {
            total_bytes: total,
            used_bytes: used,
            available_bytes: (total - used).max(0),
        })
    }

    async fn upload(
        &self,
        local: &Path,
        remote: &str,
        progress: Option<&ProgressFn>,
    ) -> CloudfsResult<UploadReceipt> {
        if let Some(cb) = progress {
            cb(0.0);
        }
        let bytes = tokio::fs::read(local).await?;
        let size = bytes.len() as i64;
        let hash = Self::sha256_hex(&bytes);
        self.op
            .write(remote, bytes)
            .await
            .map_err(|e| map_opendal(&self.config.id, e))?;
        if let Some(cb) = progress {
            cb(1.0);
        }
        tracing::debug!(provider = %self.config.id, remote, size, "uploaded");
        Ok(UploadReceipt {
            remote_path: remote.to_string(),
            content_hash: Some(hash),
            uploaded_at: OffsetDateTime::now_utc(),
            size,
        })
    }

    async fn download(
        &self,
        remote: &str,
        local: &Path,
        progress: Option<&ProgressFn>,
    ) -> CloudfsResult<DownloadReceipt> {
        if let Some(cb) = progress {
            cb(0.0);
        }
        let buffer = self
            .op
            .read(remote)
            .await
            .map_err(|e| map_opendal(&self.config.id, e))?;
        let bytes = buffer.to_bytes();
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local, &bytes).await?;
        if let Some(cb) = progress {
            cb(1.0);
        }
        tracing::debug!(provider = %self.config.id, remote, size = bytes.len(), "downloaded");
        Ok(DownloadReceipt {
            local_path: local.to_path_buf(),
            content_hash: Some(Self::sha256_hex(&bytes)),
            downloaded_at: OffsetDateTime::now_utc(),
            size: bytes.len() as i64,
        })
    }

    async fn delete(&self, remote: &str) -> CloudfsResult<()> {
        self.op
            .delete(remote)
            .await
            .map_err(|e| map_opendal(&self.config.id, e))?;
        tracing::debug!(provider = %self.config.id, remote, "deleted remote object");
        Ok(())
    }

    async fn verify(&self, remote: &str) -> CloudfsResult<VerifyReport> {
        match self.op.stat(remote).await {
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(VerifyReport {
                is_valid: false,
                content_hash: None,
                message: Some("remote object missing".into()),
            }),
            Err(e) => Err(map_opendal(&self.config.id, e)),
            Ok(_) => {
                let buffer = self
                    .op
                    .read(remote)
                    .await
                    .map_err(|e| map_opendal(&self.config.id, e))?;
                Ok(VerifyReport {
                    is_valid: true,
                    content_hash: Some(Self::sha256_hex(&buffer.to_bytes())),
                    message: None,
                })
            }
        }
    }

    async fn check_health(&self) -> ProviderHealth {
        match self.op.check().await {
            Ok(()) => ProviderHealth::Healthy,
            Err(e) => {
                tracing::warn!(provider = %self.config.id, "health check failed: {e}");
                ProviderHealth::Unavailable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs_provider(root: &Path) -> OpendalProvider {
        OpendalProvider::new(OpendalProviderConfig {
            id: "local".into(),
            kind: "fs".into(),
            display_name: "Local disk".into(),
            root: root.to_string_lossy().into_owned(),
            endpoint: None,
            region: None,
            bucket: None,
            access_key_id: None,
            secret_access_key: None,
            capacity_bytes: Some(1024 * 1024),
            requires_encryption: false,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn upload_download_roundtrip() {
        let remote_dir = tempfile::tempdir().unwrap();
        let work_dir = tempfile::tempdir().unwrap();
        let provider = fs_provider(remote_dir.path());
        provider.init().await.unwrap();

        let src = work_dir.path().join("src.txt");
        std::fs::write(&src, b"hello world").unwrap();

        let receipt = provider.upload(&src, "a/b/src.txt", None).await.unwrap();
        assert_eq!(receipt.size, 11);
        let hash = receipt.content_hash.unwrap();

        let dst = work_dir.path().join("dst.txt");
        let receipt = provider.download("a/b/src.txt", &dst, None).await.unwrap();
        assert_eq!(receipt.content_hash.as_deref(), Some(hash.as_str()));
        assert_eq!(std::fs::read(&dst).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn usage_counts_live_bytes() {
        let remote_dir = tempfile::tempdir().unwrap();
        let work_dir = tempfile::tempdir().unwrap();
        let provider = fs_provider(remote_dir.path());

        let before = provider.usage().await.unwrap();
        assert_eq!(before.used_bytes, 0);

        let src = work_dir.path().join("f");
        std::fs::write(&src, vec![0u8; 100]).unwrap();
        provider.upload(&src, "f", None).await.unwrap();

        let after = provider.usage().await.unwrap();
        assert_eq!(after.used_bytes, 100);
        assert_eq!(after.available_bytes, before.available_bytes - 100);
    }

    #[tokio::test]
    async fn verify_reports_missing_object() {
        let remote_dir = tempfile::tempdir().unwrap();
        let provider = fs_provider(remote_dir.path());
        let report = provider.verify("nope").await.unwrap();
        assert!(!report.is_valid);
    }

    #[tokio::test]
    async fn delete_then_verify_gone() {
        let remote_dir = tempfile::tempdir().unwrap();
        let work_dir = tempfile::tempdir().unwrap();
        let provider = fs_provider(remote_dir.path());

        let src = work_dir.path().join("g");
        std::fs::write(&src, b"data").unwrap();
        provider.upload(&src, "g", None).await.unwrap();

        provider.delete("g").await.unwrap();
        assert!(!provider.verify("g").await.unwrap().is_valid);
    }
}
