use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

use qn_core::{IngestError, Result};

use crate::http::{payload_sha256, HttpFetcher};

/// Stores downloaded images and returns a local reference. Strictly
/// best-effort: callers treat every error here as a skippable enrichment
/// failure, never as a reason to drop the listing.
#[async_trait::async_trait]
pub trait AssetStore: Send + Sync {
    async fn download(&self, url: &str) -> Result<String>;
}

/// Filesystem-backed store; files are content-addressed so re-downloading
/// the same image is a no-op.
pub struct FsAssetStore {
    dir: PathBuf,
    fetcher: Arc<HttpFetcher>,
}

impl FsAssetStore {
    pub fn new(dir: impl Into<PathBuf>, fetcher: Arc<HttpFetcher>) -> Self {
        Self {
            dir: dir.into(),
            fetcher,
        }
    }
}

#[async_trait::async_trait]
impl AssetStore for FsAssetStore {
    async fn download(&self, url: &str) -> Result<String> {
        let bytes = self.fetcher.get_bytes(url).await?;
        let name = format!("{}{}", payload_sha256(&bytes), extension_of(url));
        let path = self.dir.join(&name);
        if !path.exists() {
            tokio::fs::create_dir_all(&self.dir).await?;
            tokio::fs::write(&path, &bytes).await?;
        }
        Ok(name)
    }
}

fn extension_of(url: &str) -> &'static str {
    let path = url.split('?').next().unwrap_or(url);
    if path.ends_with(".png") {
        ".png"
    } else if path.ends_with(".gif") {
        ".gif"
    } else if path.ends_with(".webp") {
        ".webp"
    } else {
        ".jpg"
    }
}

/// Fetch an image if the listing has one, logging and swallowing failures.
pub async fn try_download(store: &dyn AssetStore, url: Option<&str>) -> Option<String> {
    let url = url?;
    match store.download(url).await {
        Ok(local_ref) => Some(local_ref),
        Err(e) => {
            warn!(url, error = %e, "asset download failed, continuing without image");
            None
        }
    }
}

/// Store that always fails, for exercising the strip-and-retry path.
pub struct FailingAssetStore;

#[async_trait::async_trait]
impl AssetStore for FailingAssetStore {
    async fn download(&self, url: &str) -> Result<String> {
        Err(IngestError::TransientFetch {
            message: format!("asset store unavailable for {url}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_extension_from_url() {
        assert_eq!(extension_of("https://x/poster.png?w=300"), ".png");
        assert_eq!(extension_of("https://x/poster"), ".jpg");
    }

    #[tokio::test]
    async fn try_download_swallows_failures() {
        let store = FailingAssetStore;
        assert_eq!(try_download(&store, Some("https://x/poster.png")).await, None);
        assert_eq!(try_download(&store, None).await, None);
    }
}
