// SPDX-License-Identifier: MIT OR Apache-2.0
//! Remote object-store backend (S3/MinIO) with transparent local downgrade.
//!
//! Presigned GET URLs come from the store's request signer. When the
//! endpoint is unreachable at probe time the process permanently switches to
//! the local filesystem backend; clients see the same contract and the
//! downgrade is logged exactly once.

use crate::{ArtifactStore, BlobInfo, LocalStore, StoreError, validate_key};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::ObjectStore;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;
use object_store::signer::Signer;
use scriba_config::ScribaConfig;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

/// S3-compatible [`ArtifactStore`] over two buckets, downgrading to
/// [`LocalStore`] for the process lifetime when the endpoint is down.
pub struct RemoteStore {
    audio: AmazonS3,
    transcripts: AmazonS3,
    fallback: LocalStore,
    downgraded: AtomicBool,
    ensured: Mutex<bool>,
}

impl RemoteStore {
    /// Build the two bucket clients from configuration.
    pub fn new(config: &ScribaConfig, fallback: LocalStore) -> Result<Self, StoreError> {
        let build = |bucket: &str| -> Result<AmazonS3, StoreError> {
            let builder = AmazonS3Builder::new()
                .with_endpoint(&config.blob_endpoint)
                .with_region(&config.blob_region)
                .with_access_key_id(&config.blob_access_key)
                .with_secret_access_key(&config.blob_secret_key)
                .with_bucket_name(bucket)
                .with_allow_http(config.blob_endpoint.starts_with("http://"));
            Ok(builder.build()?)
        };
        Ok(Self {
            audio: build(&config.blob_bucket_audio)?,
            transcripts: build(&config.blob_bucket_transcripts)?,
            fallback,
            downgraded: AtomicBool::new(false),
            ensured: Mutex::new(false),
        })
    }

    fn is_downgraded(&self) -> bool {
        self.downgraded.load(Ordering::Acquire)
    }

    fn downgrade(&self, reason: &dyn std::fmt::Display) {
        if !self.downgraded.swap(true, Ordering::AcqRel) {
            warn!(%reason, "object store unreachable, downgrading to local storage for this process");
        }
    }
}

fn object_path(key: &str) -> Result<ObjectPath, StoreError> {
    validate_key(key)?;
    Ok(ObjectPath::from(key))
}

#[async_trait]
impl ArtifactStore for RemoteStore {
    async fn ensure_buckets(&self) -> Result<(), StoreError> {
        if self.is_downgraded() {
            return self.fallback.ensure_buckets().await;
        }
        let mut ensured = self.ensured.lock().await;
        if *ensured {
            return Ok(());
        }
        for store in [&self.audio, &self.transcripts] {
            if let Err(err) = store.list_with_delimiter(None).await {
                self.downgrade(&err);
                return self.fallback.ensure_buckets().await;
            }
        }
        *ensured = true;
        Ok(())
    }

    async fn upload_audio(&self, bytes: Bytes, key: &str) -> Result<String, StoreError> {
        if self.is_downgraded() {
            return self.fallback.upload_audio(bytes, key).await;
        }
        let path = object_path(key)?;
        self.audio.put(&path, bytes.into()).await?;
        Ok(key.to_string())
    }

    async fn upload_transcript(&self, text: &str, key: &str) -> Result<String, StoreError> {
        if self.is_downgraded() {
            return self.fallback.upload_transcript(text, key).await;
        }
        let path = object_path(key)?;
        self.transcripts
            .put(&path, Bytes::from(text.to_string()).into())
            .await?;
        Ok(key.to_string())
    }

    async fn download_audio(&self, key: &str, dest: &Path) -> Result<(), StoreError> {
        if self.is_downgraded() {
            return self.fallback.download_audio(key, dest).await;
        }
        let path = object_path(key)?;
        let result = match self.audio.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(StoreError::NotFound { key: key.into() });
            }
            Err(err) => return Err(err.into()),
        };
        let bytes = result.bytes().await?;
        crate::local::write_atomic(dest, &bytes).await
    }

    async fn download_transcript(&self, key: &str) -> Result<Option<String>, StoreError> {
        if self.is_downgraded() {
            return self.fallback.download_transcript(key).await;
        }
        let path = object_path(key)?;
        match self.transcripts.get(&path).await {
            Ok(result) => {
                let bytes = result.bytes().await?;
                Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_audio(&self, key: &str) -> Result<(), StoreError> {
        if self.is_downgraded() {
            return self.fallback.delete_audio(key).await;
        }
        let path = object_path(key)?;
        match self.audio.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_transcript(&self, key: &str) -> Result<(), StoreError> {
        if self.is_downgraded() {
            return self.fallback.delete_transcript(key).await;
        }
        let path = object_path(key)?;
        match self.transcripts.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_transcripts(&self, prefix: Option<&str>) -> Result<Vec<BlobInfo>, StoreError> {
        if self.is_downgraded() {
            return self.fallback.list_transcripts(prefix).await;
        }
        let prefix_path = match prefix {
            Some(p) => Some(object_path(p.trim_end_matches('/'))?),
            None => None,
        };
        let mut out: Vec<BlobInfo> = self
            .transcripts
            .list(prefix_path.as_ref())
            .map_ok(|meta| BlobInfo {
                key: meta.location.to_string(),
                size: meta.size,
                modified: meta.last_modified,
            })
            .try_collect()
            .await?;
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn presigned_url(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<String>, StoreError> {
        if self.is_downgraded() {
            return self.fallback.presigned_url(key, ttl).await;
        }
        let path = object_path(key)?;
        match self.transcripts.head(&path).await {
            Ok(_) => {
                let url = self
                    .transcripts
                    .signed_url(http::Method::GET, &path, ttl)
                    .await?;
                return Ok(Some(url.to_string()));
            }
            Err(object_store::Error::NotFound { .. }) => {}
            Err(err) => return Err(err.into()),
        }
        match self.audio.head(&path).await {
            Ok(_) => {
                let url = self.audio.signed_url(http::Method::GET, &path, ttl).await?;
                Ok(Some(url.to_string()))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config(root: &Path) -> ScribaConfig {
        let mut config = ScribaConfig::default();
        config.blob_endpoint = "http://127.0.0.1:1".into();
        config.blob_access_key = "test".into();
        config.blob_secret_key = "test".into();
        config.storage_dir = root.display().to_string();
        config
    }

    #[tokio::test]
    async fn unreachable_endpoint_downgrades_to_local_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = unreachable_config(dir.path());
        let fallback = LocalStore::new(dir.path(), "audio", "transcripts");
        let store = RemoteStore::new(&config, fallback).unwrap();

        store.ensure_buckets().await.unwrap();
        assert!(store.is_downgraded());

        // Post-downgrade operations land on the local filesystem.
        store
            .upload_transcript("hola", "u1/a.txt")
            .await
            .unwrap();
        assert_eq!(
            store.download_transcript("u1/a.txt").await.unwrap(),
            Some("hola".into())
        );
        let url = store
            .presigned_url("u1/a.txt", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert!(url.starts_with("file://"));
    }

    #[tokio::test]
    async fn key_validation_applies_before_network() {
        let dir = tempfile::tempdir().unwrap();
        let config = unreachable_config(dir.path());
        let fallback = LocalStore::new(dir.path(), "audio", "transcripts");
        let store = RemoteStore::new(&config, fallback).unwrap();
        let err = store
            .upload_audio(Bytes::from_static(b"x"), "../oops.wav")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey { .. }));
    }
}
