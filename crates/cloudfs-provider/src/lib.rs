//! The narrow waist between the core and storage backends.
//!
//! Providers are plugins: the core calls them only through [`Provider`] and
//! knows nothing about wire formats or SDKs. `usage()` is AUTHORITATIVE for
//! quota decisions and always queried live — the cached usage column in the
//! index is display-only. `delete()` is invoked only by the delete
//! coordinator. `check_health()` is observational.

pub mod fs;
#[cfg(feature = "mock")]
pub mod mock;
pub mod registry;

pub use fs::{OpendalProvider, OpendalProviderConfig};
pub use registry::ProviderRegistry;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use time::OffsetDateTime;

use cloudfs_core::CloudfsResult;

/// What a backend supports. Retrieved, never assumed.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub max_chunk_size: i64,
    pub supports_versioning: bool,
    pub supports_resume: bool,
    pub concurrent_uploads: u32,
    pub requires_encryption: bool,
    pub supports_direct_upload: bool,
}

/// Live usage figures. Authoritative for quota enforcement.
#[derive(Debug, Clone, Copy)]
pub struct Usage {
    pub total_bytes: i64,
    pub used_bytes: i64,
    pub available_bytes: i64,
}

#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub remote_path: String,
    /// SHA-256 of the uploaded bytes, when the backend can report one.
    pub content_hash: Option<String>,
    pub uploaded_at: OffsetDateTime,
    pub size: i64,
}

#[derive(Debug, Clone)]
pub struct DownloadReceipt {
    pub local_path: PathBuf,
    pub content_hash: Option<String>,
    pub downloaded_at: OffsetDateTime,
    pub size: i64,
}

#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub is_valid: bool,
    pub content_hash: Option<String>,
    pub message: Option<String>,
}

/// Observational only; never used for placement or quota decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderHealth {
    Healthy,
    Degraded,
    Unavailable,
}

impl ProviderHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderHealth::Healthy => "healthy",
            ProviderHealth::Degraded => "degraded",
            ProviderHealth::Unavailable => "unavailable",
        }
    }
}

/// Transfer progress callback, 0.0..=1.0.
pub type ProgressFn = Box<dyn Fn(f64) + Send + Sync>;

#[async_trait]
pub trait Provider: Send + Sync {
    /// Unique identifier for this provider instance.
    fn id(&self) -> &str;

    /// Backend type tag (fs, s3, ...).
    fn kind(&self) -> &str;

    fn display_name(&self) -> &str;

    /// Validate connectivity and prepare the backend for use.
    async fn init(&self) -> CloudfsResult<()>;

    async fn capabilities(&self) -> CloudfsResult<Capabilities>;

    /// Live usage query. Never served from a cache.
    async fn usage(&self) -> CloudfsResult<Usage>;

    async fn upload(
        &self,
        local: &Path,
        remote: &str,
        progress: Option<&ProgressFn>,
    ) -> CloudfsResult<UploadReceipt>;

    async fn download(
        &self,
        remote: &str,
        local: &Path,
        progress: Option<&ProgressFn>,
    ) -> CloudfsResult<DownloadReceipt>;

    /// Remove a remote object. Only the delete coordinator calls this.
    async fn delete(&self, remote: &str) -> CloudfsResult<()>;

    /// Integrity check of a remote object.
    async fn verify(&self, remote: &str) -> CloudfsResult<VerifyReport>;

    async fn check_health(&self) -> ProviderHealth;
}
