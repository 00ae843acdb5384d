//! Attachment upload queue.
//!
//! Each queued file gets a local id and a preview handle. Preview handles are
//! resources owned by the queue entry: whoever removes an entry must hand its
//! handle back to the [`PreviewStore`].

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};

pub mod tus;

pub use tus::TusUploader;

/// A file picked by the user, read into memory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalFile {
    pub name: String,
    pub media_type: String,
    pub bytes: Bytes,
}

impl LocalFile {
    pub fn new(name: impl Into<String>, media_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            media_type: media_type.into(),
            bytes: bytes.into(),
        }
    }

    pub async fn read(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let media_type = media_type_for(path).to_string();
        Ok(Self::new(name, media_type, bytes))
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// SHA-256 of the content, hex encoded. Identifies the file for resume/dedup.
    pub fn content_hash(&self) -> String {
        hex::encode(Sha256::digest(&self.bytes))
    }
}

fn media_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UploadStatus {
    Uploading,
    Uploaded,
    Error,
}

/// Result of a finished upload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadedFile {
    pub id: String,
    pub url: String,
}

/// One entry of the upload queue
#[derive(Clone, Debug)]
pub struct FileEntry {
    pub id: String,
    pub file: LocalFile,
    pub preview: String,
    pub status: UploadStatus,
    pub uploaded: Option<UploadedFile>,
    pub error: Option<String>,
}

impl FileEntry {
    pub fn new(file: LocalFile, preview: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            file,
            preview,
            status: UploadStatus::Uploading,
            uploaded: None,
            error: None,
        }
    }

    pub fn mark_uploaded(&mut self, uploaded: UploadedFile) {
        self.status = UploadStatus::Uploaded;
        self.uploaded = Some(uploaded);
        self.error = None;
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.status = UploadStatus::Error;
        self.error = Some(message.into());
    }
}

/// An uploaded attachment ready to go out with a prompt
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub id: String,
    pub url: String,
    pub filename: String,
    pub media_type: String,
}

#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, file: &LocalFile) -> anyhow::Result<UploadedFile>;

    /// Abandon any partial upload of `file` and forget its resume state.
    async fn terminate(&self, file: &LocalFile) -> anyhow::Result<()>;
}

/// Uploader used when no upload endpoint is configured
pub struct DisabledUploader;

#[async_trait]
impl Uploader for DisabledUploader {
    async fn upload(&self, _file: &LocalFile) -> anyhow::Result<UploadedFile> {
        Err(anyhow::anyhow!("Uploads are not configured"))
    }

    async fn terminate(&self, _file: &LocalFile) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Creates and releases preview handles for queued files
pub trait PreviewStore: Send + Sync {
    fn create(&self, file: &LocalFile) -> String;
    fn revoke(&self, preview: &str);
}

/// Preview handles tracked in memory
#[derive(Default)]
pub struct MemoryPreviews {
    next: AtomicU64,
    live: Mutex<HashSet<String>>,
}

impl MemoryPreviews {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles created and not yet revoked
    pub fn live(&self) -> usize {
        self.live.lock().map(|live| live.len()).unwrap_or(0)
    }
}

impl PreviewStore for MemoryPreviews {
    fn create(&self, file: &LocalFile) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let handle = format!("preview:{}/{}", n, file.name);
        if let Ok(mut live) = self.live.lock() {
            live.insert(handle.clone());
        }
        handle
    }

    fn revoke(&self, preview: &str) {
        if let Ok(mut live) = self.live.lock() {
            live.remove(preview);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_sha256_hex() {
        let file = LocalFile::new("a.txt", "text/plain", &b"abc"[..]);
        assert_eq!(
            file.content_hash(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_media_type_from_extension() {
        assert_eq!(media_type_for(Path::new("x/cat.PNG")), "image/png");
        assert_eq!(media_type_for(Path::new("notes")), "application/octet-stream");
    }

    #[test]
    fn test_previews_are_tracked_until_revoked() {
        let previews = MemoryPreviews::new();
        let file = LocalFile::new("a.txt", "text/plain", &b"abc"[..]);
        let a = previews.create(&file);
        let b = previews.create(&file);
        assert_ne!(a, b);
        assert_eq!(previews.live(), 2);
        previews.revoke(&a);
        assert_eq!(previews.live(), 1);
    }

    #[test]
    fn test_entry_transitions() {
        let file = LocalFile::new("a.txt", "text/plain", &b"abc"[..]);
        let mut entry = FileEntry::new(file, "p".into());
        assert_eq!(entry.status, UploadStatus::Uploading);
        entry.mark_failed("boom");
        assert_eq!(entry.status, UploadStatus::Error);
        entry.mark_uploaded(UploadedFile {
            id: "f1".into(),
            url: "u".into(),
        });
        assert_eq!(entry.status, UploadStatus::Uploaded);
        assert!(entry.error.is_none());
    }
}
