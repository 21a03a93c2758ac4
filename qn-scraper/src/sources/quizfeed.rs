//! Extractor for the QuizFeed directory, which serves JSON for both the
//! index feed and the per-listing detail endpoint.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, instrument};

use qn_core::domain::{RawDetail, RawListing};
use qn_core::{IngestError, Result};

use crate::config::SourceConfig;
use crate::http::{payload_sha256, HttpFetcher};
use crate::sources::Extractor;

pub struct QuizFeedExtractor {
    config: SourceConfig,
    fetcher: Arc<HttpFetcher>,
}

#[derive(Debug, Deserialize)]
struct FeedIndex {
    listings: Vec<FeedIndexEntry>,
}

#[derive(Debug, Deserialize)]
struct FeedIndexEntry {
    url: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FeedDetail {
    name: String,
    address: String,
    time: String,
    #[serde(default)]
    fee: Option<String>,
    #[serde(default)]
    frequency: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lng: Option<f64>,
    #[serde(default)]
    postcode: Option<String>,
    #[serde(default)]
    place_id: Option<String>,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    website: Option<String>,
    #[serde(default)]
    quizmaster: Option<FeedQuizmaster>,
    #[serde(default)]
    image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FeedQuizmaster {
    name: String,
    #[serde(default)]
    photo: Option<String>,
}

impl QuizFeedExtractor {
    pub fn new(config: SourceConfig, fetcher: Arc<HttpFetcher>) -> Self {
        Self { config, fetcher }
    }

    fn index_url(&self) -> String {
        format!("{}/api/listings", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait::async_trait]
impl Extractor for QuizFeedExtractor {
    fn source_id(&self) -> &str {
        &self.config.id
    }

    #[instrument(skip(self))]
    async fn fetch_index(&self) -> Result<Vec<RawListing>> {
        let body = self.fetcher.get_bytes(&self.index_url()).await?;
        let index: FeedIndex =
            serde_json::from_slice(&body).map_err(|e| IngestError::Validation {
                message: format!("quizfeed index is not valid json: {e}"),
            })?;
        let listings: Vec<RawListing> = index
            .listings
            .into_iter()
            .map(|entry| RawListing {
                source_id: self.config.id.clone(),
                url: entry.url,
                name: entry.name,
            })
            .collect();
        info!(count = listings.len(), "fetched quizfeed index");
        Ok(listings)
    }

    async fn fetch_detail(&self, url: &str) -> Result<RawDetail> {
        let body = self.fetcher.get_bytes(url).await?;
        let sha = payload_sha256(&body);
        let detail: FeedDetail =
            serde_json::from_slice(&body).map_err(|e| IngestError::Validation {
                message: format!("quizfeed detail at {url} is not valid json: {e}"),
            })?;
        Ok(RawDetail {
            url: url.to_string(),
            name: detail.name,
            address: detail.address,
            time_text: detail.time,
            fee_text: detail.fee,
            frequency_text: detail.frequency,
            description: detail.description,
            latitude: detail.lat,
            longitude: detail.lng,
            postcode: detail.postcode,
            place_id: detail.place_id,
            phone: detail.phone,
            website: detail.website,
            performer_name: detail.quizmaster.as_ref().map(|q| q.name.clone()),
            performer_image: detail.quizmaster.and_then(|q| q.photo),
            image_url: detail.image,
            payload_sha256: Some(sha),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_detail_payload() {
        let detail: FeedDetail = serde_json::from_str(
            r#"{
                "name": "The Railway (Back Room)",
                "address": "12 High St, SW6 4UL",
                "time": "Wednesday 20:00",
                "fee": "£2.50",
                "quizmaster": { "name": "Quiz Keith" }
            }"#,
        )
        .unwrap();
        assert_eq!(detail.name, "The Railway (Back Room)");
        assert_eq!(detail.quizmaster.unwrap().name, "Quiz Keith");
        assert!(detail.lat.is_none());
    }
}
