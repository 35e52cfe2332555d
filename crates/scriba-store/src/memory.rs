// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory backend for tests: a process-local mapping from key to bytes.

use crate::{ArtifactStore, BlobInfo, StoreError, validate_key};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Default)]
struct Namespaces {
    audio: BTreeMap<String, (Bytes, DateTime<Utc>)>,
    transcripts: BTreeMap<String, (Bytes, DateTime<Utc>)>,
}

/// Map-backed [`ArtifactStore`] with no persistence.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Namespaces>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn ensure_buckets(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upload_audio(&self, bytes: Bytes, key: &str) -> Result<String, StoreError> {
        validate_key(key)?;
        self.inner
            .write()
            .await
            .audio
            .insert(key.to_string(), (bytes, Utc::now()));
        Ok(key.to_string())
    }

    async fn upload_transcript(&self, text: &str, key: &str) -> Result<String, StoreError> {
        validate_key(key)?;
        self.inner
            .write()
            .await
            .transcripts
            .insert(key.to_string(), (Bytes::from(text.to_string()), Utc::now()));
        Ok(key.to_string())
    }

    async fn download_audio(&self, key: &str, dest: &Path) -> Result<(), StoreError> {
        validate_key(key)?;
        let bytes = self
            .inner
            .read()
            .await
            .audio
            .get(key)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| StoreError::NotFound { key: key.into() })?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(())
    }

    async fn download_transcript(&self, key: &str) -> Result<Option<String>, StoreError> {
        validate_key(key)?;
        Ok(self
            .inner
            .read()
            .await
            .transcripts
            .get(key)
            .map(|(bytes, _)| String::from_utf8_lossy(bytes).into_owned()))
    }

    async fn delete_audio(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        self.inner.write().await.audio.remove(key);
        Ok(())
    }

    async fn delete_transcript(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        self.inner.write().await.transcripts.remove(key);
        Ok(())
    }

    async fn list_transcripts(&self, prefix: Option<&str>) -> Result<Vec<BlobInfo>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .transcripts
            .iter()
            .filter(|(key, _)| prefix.is_none_or(|p| key.starts_with(p)))
            .map(|(key, (bytes, modified))| BlobInfo {
                key: key.clone(),
                size: bytes.len() as u64,
                modified: *modified,
            })
            .collect())
    }

    async fn presigned_url(
        &self,
        key: &str,
        _ttl: Duration,
    ) -> Result<Option<String>, StoreError> {
        validate_key(key)?;
        let inner = self.inner.read().await;
        if inner.transcripts.contains_key(key) {
            return Ok(Some(format!("memory://transcripts/{key}")));
        }
        if inner.audio.contains_key(key) {
            return Ok(Some(format!("memory://audio/{key}")));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_and_listing() {
        let store = MemoryStore::new();
        store.ensure_buckets().await.unwrap();
        store
            .upload_transcript("uno", "u1/a.txt")
            .await
            .unwrap();
        store
            .upload_transcript("dos", "u2/b.txt")
            .await
            .unwrap();

        assert_eq!(
            store.download_transcript("u1/a.txt").await.unwrap(),
            Some("uno".into())
        );
        let listed = store.list_transcripts(Some("u2/")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "u2/b.txt");
        assert_eq!(listed[0].size, 3);
    }

    #[tokio::test]
    async fn audio_download_writes_file() {
        let store = MemoryStore::new();
        store
            .upload_audio(Bytes::from_static(b"pcm"), "u1/a.wav")
            .await
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.wav");
        store.download_audio("u1/a.wav", &dest).await.unwrap();
        assert_eq!(std::fs::read(dest).unwrap(), b"pcm");
    }

    #[tokio::test]
    async fn missing_audio_is_not_found() {
        let store = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        let err = store
            .download_audio("u1/ghost.wav", &dir.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn presigned_substitute_scheme() {
        let store = MemoryStore::new();
        store
            .upload_audio(Bytes::from_static(b"x"), "u1/a.wav")
            .await
            .unwrap();
        let url = store
            .presigned_url("u1/a.wav", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(url, "memory://audio/u1/a.wav");
    }
}
