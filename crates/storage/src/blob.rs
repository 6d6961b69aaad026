use std::{collections::HashSet, sync::Arc};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use shared::domain::AttachmentRef;
use url::Url;

use crate::BlobStore;

/// Placeholder used when no blob backend is configured; every delete fails.
pub struct MissingBlobStore;

#[async_trait]
impl BlobStore for MissingBlobStore {
    async fn delete_by_reference(&self, reference: &AttachmentRef) -> Result<()> {
        Err(anyhow!(
            "blob store is unavailable; cannot delete {}",
            reference.as_str()
        ))
    }
}

#[derive(Default)]
struct MemoryBlobState {
    deleted: Vec<AttachmentRef>,
    failing: HashSet<AttachmentRef>,
}

#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    inner: Arc<Mutex<MemoryBlobState>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, reference: AttachmentRef) {
        self.inner.lock().failing.insert(reference);
    }

    /// Every delete request received, including failed ones, in call order.
    pub fn delete_requests(&self) -> Vec<AttachmentRef> {
        self.inner.lock().deleted.clone()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn delete_by_reference(&self, reference: &AttachmentRef) -> Result<()> {
        let mut state = self.inner.lock();
        state.deleted.push(reference.clone());
        if state.failing.contains(reference) {
            return Err(anyhow!("injected blob delete failure for {}", reference.as_str()));
        }
        Ok(())
    }
}

/// Deletes blobs with `DELETE {base_url}/{reference}`. A 404 counts as already deleted.
pub struct HttpBlobStore {
    http: Client,
    base_url: Url,
}

impl HttpBlobStore {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut base_url =
            Url::parse(base_url).with_context(|| format!("invalid blob base url '{base_url}'"))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base_url,
        })
    }

    /// Resolves a reference to a URL under `base_url`. References come from stored message
    /// records, so absolute URLs and `.`/`..` segments are rejected rather than resolved.
    pub(crate) fn object_url(&self, reference: &AttachmentRef) -> Result<Url> {
        let raw = reference.as_str();
        if Url::parse(raw).is_ok() {
            bail!("blob reference '{raw}' is an absolute url");
        }
        let segments: Vec<&str> = raw
            .trim_start_matches('/')
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();
        if segments.is_empty() {
            bail!("blob reference '{raw}' is empty");
        }
        if let Some(segment) = segments
            .iter()
            .find(|segment| matches!(**segment, "." | "..") || segment.contains('\\'))
        {
            bail!("blob reference '{raw}' has a disallowed segment '{segment}'");
        }

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("blob base url '{}' cannot hold a path", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        if !url.as_str().starts_with(self.base_url.as_str()) {
            bail!("blob reference '{raw}' resolves outside {}", self.base_url);
        }
        Ok(url)
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn delete_by_reference(&self, reference: &AttachmentRef) -> Result<()> {
        let url = self.object_url(reference)?;
        let response = self.http.delete(url.clone()).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        response
            .error_for_status()
            .with_context(|| format!("blob delete failed for {url}"))?;
        Ok(())
    }
}
