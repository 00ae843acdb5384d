//! Resumable chunked uploads over the tus 1.0 protocol.
//!
//! Files are fingerprinted by content hash. The upload URL of every fingerprint
//! is remembered, so uploading identical bytes again resumes (or short-circuits)
//! the earlier upload instead of starting over.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::{Method, Response, StatusCode, Url};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::{LocalFile, UploadedFile, Uploader};
use crate::client::Client;

const TUS_VERSION: &str = "1.0.0";
pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

pub struct TusUploader {
    client: Client,
    endpoint: String,
    namespace: Option<String>,
    chunk_size: usize,
    retry_delays: Vec<Duration>,
    /// fingerprint -> upload URL
    uploads: Mutex<HashMap<String, String>>,
}

impl TusUploader {
    /// `client` supplies auth and the base used for retrieval URLs;
    /// `endpoint` is the absolute tus creation endpoint.
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            namespace: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry_delays: [0, 1000, 3000, 5000]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
            uploads: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    fn fingerprint(file: &LocalFile) -> String {
        BASE64.encode(file.content_hash())
    }

    fn metadata(&self, file: &LocalFile, fingerprint: &str) -> String {
        let mut pairs = vec![
            ("filename", file.name.as_str()),
            ("filetype", file.media_type.as_str()),
            ("fingerprint", fingerprint),
        ];
        if let Some(namespace) = &self.namespace {
            pairs.push(("namespace", namespace.as_str()));
        }
        pairs
            .into_iter()
            .map(|(key, value)| format!("{} {}", key, BASE64.encode(value)))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Last path segment of the upload URL
    fn upload_id(url: &str) -> Option<String> {
        let url = Url::parse(url).ok()?;
        url.path_segments()?
            .filter(|s| !s.is_empty())
            .next_back()
            .map(str::to_string)
    }

    fn offset_header(response: &Response) -> anyhow::Result<u64> {
        let value = response
            .headers()
            .get("Upload-Offset")
            .ok_or_else(|| anyhow::anyhow!("Missing Upload-Offset header"))?;
        Ok(value.to_str()?.parse()?)
    }

    #[instrument(level = "debug", skip(self, file, fingerprint), fields(file = %file.name))]
    async fn create(&self, file: &LocalFile, fingerprint: &str) -> anyhow::Result<String> {
        let response = self
            .client
            .request(Method::POST, &self.endpoint)
            .header("Tus-Resumable", TUS_VERSION)
            .header("Upload-Length", file.size().to_string())
            .header("Upload-Metadata", self.metadata(file, fingerprint))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Upload creation failed with status: {}",
                response.status()
            ));
        }
        let location = response
            .headers()
            .get(LOCATION)
            .ok_or_else(|| anyhow::anyhow!("Upload creation response has no Location"))?
            .to_str()?;
        let url = Url::parse(&self.endpoint)?.join(location)?;
        Ok(url.to_string())
    }

    /// Bytes the server already holds for `url`
    async fn offset(&self, url: &str) -> anyhow::Result<u64> {
        let response = self
            .client
            .request(Method::HEAD, url)
            .header("Tus-Resumable", TUS_VERSION)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!("Upload lookup failed with status: {}", response.status()));
        }
        Self::offset_header(&response)
    }

    async fn patch(&self, url: &str, offset: u64, chunk: bytes::Bytes) -> anyhow::Result<u64> {
        let response = self
            .client
            .request(Method::PATCH, url)
            .header("Tus-Resumable", TUS_VERSION)
            .header("Upload-Offset", offset.to_string())
            .header(CONTENT_TYPE, "application/offset+octet-stream")
            .body(chunk)
            .send()
            .await?;
        if response.status() != StatusCode::NO_CONTENT && !response.status().is_success() {
            return Err(anyhow::anyhow!("Chunk upload failed with status: {}", response.status()));
        }
        Self::offset_header(&response)
    }

    async fn patch_with_retry(&self, url: &str, offset: u64, chunk: bytes::Bytes) -> anyhow::Result<u64> {
        let mut last_error = None;
        for (attempt, delay) in self.retry_delays.iter().enumerate() {
            if !delay.is_zero() {
                tokio::time::sleep(*delay).await;
            }
            match self.patch(url, offset, chunk.clone()).await {
                Ok(next) => return Ok(next),
                Err(e) => {
                    warn!("Chunk at offset {} failed (attempt {}): {}", offset, attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => self.patch(url, offset, chunk).await,
        }
    }

    /// Reuse the recorded upload for this fingerprint when the server still knows it.
    async fn resume_point(&self, file: &LocalFile, fingerprint: &str) -> anyhow::Result<(String, u64)> {
        let previous = self.uploads.lock().await.get(fingerprint).cloned();
        if let Some(url) = previous {
            match self.offset(&url).await {
                Ok(offset) => {
                    info!("Resuming upload of {} at offset {}", file.name, offset);
                    return Ok((url, offset));
                }
                Err(e) => debug!("Previous upload of {} not resumable: {}", file.name, e),
            }
        }
        let url = self.create(file, fingerprint).await?;
        self.uploads
            .lock()
            .await
            .insert(fingerprint.to_string(), url.clone());
        Ok((url, 0))
    }
}

#[async_trait]
impl Uploader for TusUploader {
    async fn upload(&self, file: &LocalFile) -> anyhow::Result<UploadedFile> {
        let fingerprint = Self::fingerprint(file);
        let (url, mut offset) = self.resume_point(file, &fingerprint).await?;

        let total = file.size() as u64;
        while offset < total {
            let start = offset as usize;
            let end = (start + self.chunk_size).min(file.size());
            let next = self
                .patch_with_retry(&url, offset, file.bytes.slice(start..end))
                .await?;
            if next <= offset {
                return Err(anyhow::anyhow!("Upload made no progress at offset {}", offset));
            }
            debug!("Uploaded {}/{} bytes of {}", next, total, file.name);
            offset = next;
        }

        let id = Self::upload_id(&url)
            .ok_or_else(|| anyhow::anyhow!("Cannot derive upload id from {}", url))?;
        info!("Uploaded {} as {}", file.name, id);
        Ok(UploadedFile {
            url: self.client.url(&format!("/files/thumbnail/{}", id)),
            id,
        })
    }

    async fn terminate(&self, file: &LocalFile) -> anyhow::Result<()> {
        let fingerprint = Self::fingerprint(file);
        let Some(url) = self.uploads.lock().await.remove(&fingerprint) else {
            return Ok(());
        };
        let response = self
            .client
            .request(Method::DELETE, &url)
            .header("Tus-Resumable", TUS_VERSION)
            .send()
            .await?;
        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(anyhow::anyhow!("Upload termination failed with status: {}", response.status()));
        }
        Ok(())
    }
}
