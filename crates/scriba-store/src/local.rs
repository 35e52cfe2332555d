// SPDX-License-Identifier: MIT OR Apache-2.0
//! Local filesystem backend.
//!
//! Keys are mirrored into two root directories (audio and transcripts).
//! Writes go through a sibling temp file followed by an atomic rename, and
//! the "presigned" form is a `file://` URL.

use crate::{ArtifactStore, BlobInfo, StoreError, validate_key};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Filesystem-backed [`ArtifactStore`].
pub struct LocalStore {
    audio_root: PathBuf,
    transcripts_root: PathBuf,
    ensured: Mutex<bool>,
}

impl LocalStore {
    /// Create a store rooted at `root`, with one subdirectory per namespace.
    pub fn new(root: &Path, audio_dir: &str, transcripts_dir: &str) -> Self {
        Self {
            audio_root: root.join(audio_dir),
            transcripts_root: root.join(transcripts_dir),
            ensured: Mutex::new(false),
        }
    }

    fn audio_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.audio_root.join(key))
    }

    fn transcript_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.transcripts_root.join(key))
    }
}

/// Write `bytes` to `path` atomically: temp file in the same directory, then
/// rename over the destination.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().ok_or_else(|| StoreError::InvalidKey {
        key: path.display().to_string(),
    })?;
    fs::create_dir_all(parent).await?;
    let tmp = parent.join(format!(
        ".{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy()
    ));
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    drop(file);
    match fs::rename(&tmp, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&tmp).await;
            Err(err.into())
        }
    }
}

#[async_trait]
impl ArtifactStore for LocalStore {
    async fn ensure_buckets(&self) -> Result<(), StoreError> {
        let mut ensured = self.ensured.lock().await;
        if *ensured {
            return Ok(());
        }
        fs::create_dir_all(&self.audio_root).await?;
        fs::create_dir_all(&self.transcripts_root).await?;
        *ensured = true;
        Ok(())
    }

    async fn upload_audio(&self, bytes: Bytes, key: &str) -> Result<String, StoreError> {
        let path = self.audio_path(key)?;
        write_atomic(&path, &bytes).await?;
        Ok(key.to_string())
    }

    async fn upload_transcript(&self, text: &str, key: &str) -> Result<String, StoreError> {
        let path = self.transcript_path(key)?;
        write_atomic(&path, text.as_bytes()).await?;
        Ok(key.to_string())
    }

    async fn download_audio(&self, key: &str, dest: &Path) -> Result<(), StoreError> {
        let path = self.audio_path(key)?;
        match fs::copy(&path, dest).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound { key: key.into() })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn download_transcript(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.transcript_path(key)?;
        match fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_audio(&self, key: &str) -> Result<(), StoreError> {
        let path = self.audio_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_transcript(&self, key: &str) -> Result<(), StoreError> {
        let path = self.transcript_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_transcripts(&self, prefix: Option<&str>) -> Result<Vec<BlobInfo>, StoreError> {
        let mut out = Vec::new();
        let mut pending = vec![self.transcripts_root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    pending.push(path);
                    continue;
                }
                let key = path
                    .strip_prefix(&self.transcripts_root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/");
                if let Some(prefix) = prefix {
                    if !key.starts_with(prefix) {
                        continue;
                    }
                }
                let modified: DateTime<Utc> = meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                out.push(BlobInfo {
                    key,
                    size: meta.len(),
                    modified,
                });
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn presigned_url(
        &self,
        key: &str,
        _ttl: Duration,
    ) -> Result<Option<String>, StoreError> {
        let path = self.transcript_path(key)?;
        if fs::try_exists(&path).await? {
            return Ok(Some(format!("file://{}", path.display())));
        }
        let audio = self.audio_path(key)?;
        if fs::try_exists(&audio).await? {
            return Ok(Some(format!("file://{}", audio.display())));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(root: &Path) -> LocalStore {
        LocalStore::new(root, "audio", "transcripts")
    }

    #[tokio::test]
    async fn upload_download_roundtrip_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.ensure_buckets().await.unwrap();

        let payload = Bytes::from_static(b"\x00\x01riff-like-bytes\xff");
        store.upload_audio(payload.clone(), "u1/clip.wav").await.unwrap();

        let dest = dir.path().join("copy.wav");
        store.download_audio("u1/clip.wav", &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), payload.as_ref());
    }

    #[tokio::test]
    async fn transcript_roundtrip_and_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.ensure_buckets().await.unwrap();

        store
            .upload_transcript("hola mundo", "u1/clip.wav.txt")
            .await
            .unwrap();
        assert_eq!(
            store.download_transcript("u1/clip.wav.txt").await.unwrap(),
            Some("hola mundo".to_string())
        );
        assert_eq!(store.download_transcript("u1/other.txt").await.unwrap(), None);
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let err = store
            .upload_transcript("x", "../escape.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey { .. }));
    }

    #[tokio::test]
    async fn list_transcripts_filters_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.ensure_buckets().await.unwrap();
        store.upload_transcript("a", "u1/a.txt").await.unwrap();
        store.upload_transcript("b", "u1/b.txt").await.unwrap();
        store.upload_transcript("c", "u2/c.txt").await.unwrap();

        let all = store.list_transcripts(None).await.unwrap();
        assert_eq!(all.len(), 3);
        let filtered = store.list_transcripts(Some("u1/")).await.unwrap();
        assert_eq!(
            filtered.iter().map(|b| b.key.as_str()).collect::<Vec<_>>(),
            ["u1/a.txt", "u1/b.txt"]
        );
    }

    #[tokio::test]
    async fn presigned_url_is_file_scheme() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.ensure_buckets().await.unwrap();
        store.upload_transcript("x", "u1/a.txt").await.unwrap();

        let url = store
            .presigned_url("u1/a.txt", Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("u1/a.txt"));

        assert_eq!(
            store
                .presigned_url("u1/missing.txt", Duration::from_secs(600))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.ensure_buckets().await.unwrap();
        store.upload_audio(Bytes::from_static(b"x"), "u1/a.wav").await.unwrap();
        store.delete_audio("u1/a.wav").await.unwrap();
        store.delete_audio("u1/a.wav").await.unwrap();
    }
}
