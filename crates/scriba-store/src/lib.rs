// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! scriba-store
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Local filesystem backend.
pub mod local;
/// In-memory backend for tests.
pub mod memory;
/// Remote object-store backend with local downgrade.
pub mod remote;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use scriba_config::ScribaConfig;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use remote::RemoteStore;

/// Errors produced by artifact-store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The key contains a path-escape or other forbidden component.
    #[error("invalid artifact key: {key}")]
    InvalidKey {
        /// The offending key.
        key: String,
    },

    /// The requested blob does not exist.
    #[error("artifact not found: {key}")]
    NotFound {
        /// Key that was requested.
        key: String,
    },

    /// Local filesystem failure.
    #[error("storage io failure")]
    Io(#[from] std::io::Error),

    /// Remote object-store failure.
    #[error("object store failure")]
    Remote(#[from] object_store::Error),
}

/// Metadata for one stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    /// Opaque path-like key.
    pub key: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: DateTime<Utc>,
}

/// Content-addressed blob store for audio inputs and transcript outputs.
///
/// Keys are opaque strings with path-like syntax; implementations reject
/// keys that escape their root. All operations are safe to call concurrently
/// from workers and request handlers.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Idempotently prepare both blob namespaces. Concurrent first callers
    /// perform one probe only.
    async fn ensure_buckets(&self) -> Result<(), StoreError>;

    /// Store an uploaded audio blob under `key`, returning the key.
    async fn upload_audio(&self, bytes: Bytes, key: &str) -> Result<String, StoreError>;

    /// Store transcript text under `key`, returning the key.
    async fn upload_transcript(&self, text: &str, key: &str) -> Result<String, StoreError>;

    /// Download an audio blob into `dest`.
    async fn download_audio(&self, key: &str, dest: &Path) -> Result<(), StoreError>;

    /// Fetch transcript text; `None` when the key does not exist.
    async fn download_transcript(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Delete an audio blob; missing keys are not an error.
    async fn delete_audio(&self, key: &str) -> Result<(), StoreError>;

    /// Delete a transcript blob; missing keys are not an error.
    async fn delete_transcript(&self, key: &str) -> Result<(), StoreError>;

    /// List transcript blobs, optionally under a key prefix.
    async fn list_transcripts(&self, prefix: Option<&str>) -> Result<Vec<BlobInfo>, StoreError>;

    /// Produce a time-limited read URL for `key`, or `None` when the blob
    /// does not exist. Local and in-memory backends return a functionally
    /// equivalent substitute (`file://`, `memory://`).
    async fn presigned_url(&self, key: &str, ttl: Duration)
    -> Result<Option<String>, StoreError>;
}

/// Rejects keys that could escape the storage root.
///
/// A key must be non-empty, relative, and free of `..` components.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if invalid {
        return Err(StoreError::InvalidKey { key: key.into() });
    }
    Ok(())
}

/// Build the artifact store selected by configuration.
///
/// An empty `blob_endpoint` selects the local filesystem backend rooted at
/// `storage_dir`; anything else selects the remote backend (which itself
/// downgrades to local when the endpoint is unreachable).
pub fn from_config(config: &ScribaConfig) -> Arc<dyn ArtifactStore> {
    let local = LocalStore::new(
        Path::new(&config.storage_dir),
        &config.blob_bucket_audio,
        &config.blob_bucket_transcripts,
    );
    if config.blob_endpoint.trim().is_empty() {
        return Arc::new(local);
    }
    match RemoteStore::new(config, local) {
        Ok(remote) => Arc::new(remote),
        Err(err) => {
            tracing::warn!(error = %err, "remote store configuration rejected, using local storage");
            Arc::new(LocalStore::new(
                Path::new(&config.storage_dir),
                &config.blob_bucket_audio,
                &config.blob_bucket_transcripts,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_validation_rejects_escapes() {
        assert!(validate_key("owner/clip.wav").is_ok());
        assert!(validate_key("a/b/c.txt").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/abs.wav").is_err());
        assert!(validate_key("../up.wav").is_err());
        assert!(validate_key("a/../b.wav").is_err());
        assert!(validate_key("a//b.wav").is_err());
        assert!(validate_key("a\\b.wav").is_err());
        assert!(validate_key("a/./b.wav").is_err());
    }

    #[test]
    fn from_config_selects_local_without_endpoint() {
        let config = ScribaConfig::default();
        // Default config has no endpoint; construction must not touch the network.
        let _store = from_config(&config);
    }
}
