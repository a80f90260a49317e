//! Retrieval of raw bytes from the remote content store.
//!
//! All fetches for a conversion batch are started together and jointly
//! awaited. Fetching is the only concurrent stage of the pipeline.

use std::{
    mem::size_of_val,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use base64::{
    alphabet::URL_SAFE,
    engine::general_purpose::{GeneralPurpose, NO_PAD},
    Engine,
};
use futures::{future::BoxFuture, stream, StreamExt};
use hashbrown::HashMap;
use url::Url;

use crate::{address::ContentMapping, hash::ContentHash};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Failed to download '{url}': {reason}")]
    Download { reason: String, url: Url },

    #[error("Server returned status {status} for '{url}'")]
    Status { status: u16, url: Url },

    #[error("Failed to extract data from data url '{url}'")]
    InvalidDataUrl { url: Url },

    #[error("Unsupported scheme '{}' in '{url}'", url.scheme())]
    UnsupportedScheme { url: Url },

    #[error("Failed to parse entity mapping response from '{url}': {reason}")]
    InvalidEntityList { reason: String, url: Url },
}

/// Remote content store.
///
/// A successful response with a zero-length body is valid content and must
/// not be conflated with failure.
pub trait RemoteStore: Send + Sync {
    /// Retrieves raw bytes for the URL.
    fn fetch<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<Vec<u8>, FetchError>>;

    /// Resolves pointers to the entity mappings they currently reference.
    fn active_entities<'a>(
        &'a self,
        ids: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<ContentMapping>, FetchError>>;
}

/// HTTP-backed remote store with retry.
///
/// `data:` URLs are decoded locally, same as local source handling in the
/// import store.
pub struct HttpStore {
    client: reqwest::Client,
    base: Url,
    retries: u32,
    backoff: Duration,
}

impl HttpStore {
    pub fn new(base: Url) -> Self {
        HttpStore {
            client: reqwest::Client::new(),
            base,
            retries: 3,
            backoff: Duration::from_millis(250),
        }
    }

    pub fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    async fn get_with_retries(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.get_once(url).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) if attempt <= self.retries => {
                    tracing::warn!(
                        "Fetch attempt {} for '{}' failed. {:#}. Retrying",
                        attempt,
                        url,
                        err
                    );
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn get_once(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| FetchError::Download {
                reason: err.to_string(),
                url: url.clone(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.clone(),
            });
        }

        // Zero-length bodies are valid content.
        let bytes = response.bytes().await.map_err(|err| FetchError::Download {
            reason: err.to_string(),
            url: url.clone(),
        })?;

        Ok(bytes.to_vec())
    }
}

impl RemoteStore for HttpStore {
    fn fetch<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<Vec<u8>, FetchError>> {
        Box::pin(async move {
            match url.scheme() {
                "http" | "https" => self.get_with_retries(url).await,
                "data" => decode_data_url(url),
                _ => Err(FetchError::UnsupportedScheme { url: url.clone() }),
            }
        })
    }

    fn active_entities<'a>(
        &'a self,
        ids: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<ContentMapping>, FetchError>> {
        Box::pin(async move {
            let url = self
                .base
                .join("entities/active")
                .map_err(|err| FetchError::InvalidEntityList {
                    reason: err.to_string(),
                    url: self.base.clone(),
                })?;

            let response = self
                .client
                .post(url.clone())
                .json(&serde_json::json!({ "ids": ids }))
                .send()
                .await
                .map_err(|err| FetchError::Download {
                    reason: err.to_string(),
                    url: url.clone(),
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status {
                    status: status.as_u16(),
                    url,
                });
            }

            let mappings: Vec<ContentMapping> =
                response
                    .json()
                    .await
                    .map_err(|err| FetchError::InvalidEntityList {
                        reason: err.to_string(),
                        url: url.clone(),
                    })?;

            // Re-normalize separators; the remote reports paths as dependents wrote them.
            Ok(mappings
                .into_iter()
                .map(|m| ContentMapping::new(m.hash, m.logical_path))
                .collect())
        })
    }
}

pub(crate) fn decode_data_url(url: &Url) -> Result<Vec<u8>, FetchError> {
    let data_start = url.as_str()[size_of_val("data:")..]
        .find(',')
        .ok_or_else(|| FetchError::InvalidDataUrl { url: url.clone() })?
        + 1
        + size_of_val("data:");
    let head = &url.as_str()[..data_start];
    let data_str = &url.as_str()[data_start..];

    if head.ends_with(";base64,") {
        GeneralPurpose::new(&URL_SAFE, NO_PAD)
            .decode(data_str)
            .map_err(|_| FetchError::InvalidDataUrl { url: url.clone() })
    } else {
        Ok(data_str.as_bytes().to_vec())
    }
}

/// In-memory blob table keyed by lower-cased hash.
///
/// Held only between fetch and staging. Blobs are taken out when staging
/// begins and the table is cleared at run end to bound memory.
#[derive(Default)]
pub struct FetchedBlobs {
    blobs: HashMap<String, Vec<u8>>,
}

impl FetchedBlobs {
    pub fn new() -> Self {
        FetchedBlobs::default()
    }

    pub fn insert(&mut self, hash: &ContentHash, bytes: Vec<u8>) {
        self.blobs.insert(hash.lower(), bytes);
    }

    pub fn take(&mut self, hash: &ContentHash) -> Option<Vec<u8>> {
        self.blobs.remove(&hash.lower())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.blobs.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn clear(&mut self) {
        self.blobs.clear();
    }
}

/// Fires all fetches together and awaits them jointly.
///
/// `cap` bounds in-flight fetches; 0 means unbounded. Items not yet started
/// when `cancel` is set are skipped; in-flight fetches run to completion.
pub async fn fetch_batch(
    store: &dyn RemoteStore,
    items: &[(ContentHash, Url)],
    cap: usize,
    cancel: &AtomicBool,
) -> Vec<(ContentHash, Result<Vec<u8>, FetchError>)> {
    let cap = if cap == 0 { items.len().max(1) } else { cap };

    stream::iter(items.iter().map(|(hash, url)| async move {
        if cancel.load(Ordering::Relaxed) {
            return None;
        }
        tracing::debug!("Fetching '{}' for {}", url, hash);
        let result = store.fetch(url).await;
        Some((hash.clone(), result))
    }))
    .buffer_unordered(cap)
    .filter_map(|item| async move { item })
    .collect()
    .await
}
