//! In-memory provider for tests.
//!
//! Objects live in a `HashMap` behind a [`tokio::sync::RwLock`], so all
//! trait methods work on `&self` without touching disk or network. Failure
//! injection flags simulate misbehaving remotes: refused deletes, corrupted
//! downloads, degraded health.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tokio::sync::RwLock;

use cloudfs_core::{CloudfsError, CloudfsResult};

use crate::{
    Capabilities, DownloadReceipt, Provider, ProviderHealth, ProgressFn, UploadReceipt, Usage,
    VerifyReport,
};

pub struct MockProvider {
    id: String,
    objects: RwLock<HashMap<String, Vec<u8>>>,
    capacity_bytes: i64,
    requires_encryption: bool,
    fail_deletes: AtomicBool,
    corrupt_downloads: AtomicBool,
    degraded: AtomicBool,
}

impl MockProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            objects: RwLock::new(HashMap::new()),
            capacity_bytes: i64::MAX,
            requires_encryption: false,
            fail_deletes: AtomicBool::new(false),
            corrupt_downloads: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn with_capacity(mut self, bytes: i64) -> Self {
        self.capacity_bytes = bytes;
        self
    }

    pub fn with_required_encryption(mut self) -> Self {
        self.requires_encryption = true;
        self
    }

    /// Make every subsequent `delete` fail with a remote error.
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `download` return flipped bytes.
    pub fn corrupt_downloads(&self, corrupt: bool) {
        self.corrupt_downloads.store(corrupt, Ordering::SeqCst);
    }

    pub fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::SeqCst);
    }

    pub async fn object_count(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn contains(&self, remote: &str) -> bool {
        self.objects.read().await.contains_key(remote)
    }

    fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }
}

#[async_trait::async_trait]
impl Provider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "mock"
    }

    fn display_name(&self) -> &str {
        &self.id
    }

    async fn init(&self) -> CloudfsResult<()> {
        Ok(())
    }

    async fn capabilities(&self) -> CloudfsResult<Capabilities> {
        Ok(Capabilities {
            max_chunk_size: i64::MAX,
            supports_versioning: false,
            supports_resume: false,
            concurrent_uploads: 1,
            requires_encryption: self.requires_encryption,
            supports_direct_upload: true,
        })
    }

    async fn usage(&self) -> CloudfsResult<Usage> {
        let used: i64 = self
            .objects
            .read()
            .await
            .values()
            .map(|v| v.len() as i64)
            .sum();
        Ok(Usage {
            total_bytes: self.capacity_bytes,
            used_bytes: used,
            available_bytes: (self.capacity_bytes - used).max(0),
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
        self.objects
            .write()
            .await
            .insert(remote.to_string(), bytes);
        if let Some(cb) = progress {
            cb(1.0);
        }
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
        let mut bytes = self
            .objects
            .read()
            .await
            .get(remote)
            .cloned()
            .ok_or_else(|| CloudfsError::not_found(format!("remote object {remote}")))?;
        if self.corrupt_downloads.load(Ordering::SeqCst) {
            for b in &mut bytes {
                *b = !*b;
            }
        }
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local, &bytes).await?;
        if let Some(cb) = progress {
            cb(1.0);
        }
        Ok(DownloadReceipt {
            local_path: local.to_path_buf(),
            content_hash: Some(Self::sha256_hex(&bytes)),
            downloaded_at: OffsetDateTime::now_utc(),
            size: bytes.len() as i64,
        })
    }

    async fn delete(&self, remote: &str) -> CloudfsResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(CloudfsError::remote(&self.id, "delete refused"));
        }
        self.objects.write().await.remove(remote);
        Ok(())
    }

    async fn verify(&self, remote: &str) -> CloudfsResult<VerifyReport> {
        match self.objects.read().await.get(remote) {
            Some(bytes) => Ok(VerifyReport {
                is_valid: true,
                content_hash: Some(Self::sha256_hex(bytes)),
                message: None,
            }),
            None => Ok(VerifyReport {
                is_valid: false,
                content_hash: None,
                message: Some("remote object missing".into()),
            }),
        }
    }

    async fn check_health(&self) -> ProviderHealth {
        if self.degraded.load(Ordering::SeqCst) {
            ProviderHealth::Degraded
        } else {
            ProviderHealth::Healthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_and_failure_injection() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MockProvider::new("m1");

        let src = dir.path().join("f");
        std::fs::write(&src, b"payload").unwrap();
        provider.upload(&src, "f", None).await.unwrap();
        assert!(provider.contains("f").await);

        provider.fail_deletes(true);
        assert!(provider.delete("f").await.is_err());
        assert!(provider.verify("f").await.unwrap().is_valid);

        provider.fail_deletes(false);
        provider.delete("f").await.unwrap();
        assert!(!provider.verify("f").await.unwrap().is_valid);
    }

    #[tokio::test]
    async fn corrupt_downloads_change_hash() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MockProvider::new("m2");

        let src = dir.path().join("f");
        std::fs::write(&src, b"payload").unwrap();
        let up = provider.upload(&src, "f", None).await.unwrap();

        provider.corrupt_downloads(true);
        let down = provider
            .download("f", &dir.path().join("g"), None)
            .await
            .unwrap();
        assert_ne!(up.content_hash, down.content_hash);
    }
}
