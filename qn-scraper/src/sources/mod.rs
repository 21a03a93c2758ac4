pub mod normalize;
pub mod pubquizhtml;
pub mod quizfeed;

use std::sync::Arc;

use qn_core::domain::{RawDetail, RawListing};
use qn_core::Result;

use crate::config::SourceConfig;
use crate::http::HttpFetcher;

pub const QUIZFEED_SOURCE: &str = "quizfeed";
pub const PUBQUIZ_HTML_SOURCE: &str = "pubquiz-html";

/// Trait for source-specific extraction logic. Extractors only fetch and
/// reshape; validation and normalization happen in [`normalize`].
#[async_trait::async_trait]
pub trait Extractor: Send + Sync {
    /// Fetch the source's index feed and return one raw record per listing.
    async fn fetch_index(&self) -> Result<Vec<RawListing>>;

    /// Fetch and extract the detail payload for one listing.
    async fn fetch_detail(&self, url: &str) -> Result<RawDetail>;

    fn source_id(&self) -> &str;
}

/// Factory for extractors keyed by source id.
pub fn extractor_for_source(
    config: &SourceConfig,
    fetcher: Arc<HttpFetcher>,
) -> Option<Box<dyn Extractor>> {
    match config.id.as_str() {
        QUIZFEED_SOURCE => Some(Box::new(quizfeed::QuizFeedExtractor::new(
            config.clone(),
            fetcher,
        ))),
        PUBQUIZ_HTML_SOURCE => Some(Box::new(pubquizhtml::PubQuizHtmlExtractor::new(
            config.clone(),
            fetcher,
        ))),
        _ => None,
    }
}
