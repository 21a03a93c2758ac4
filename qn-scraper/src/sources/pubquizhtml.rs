//! Extractor for PubQuiz Directory, a server-rendered HTML site. The index
//! is a list of anchor cards; detail pages carry microdata-ish classed
//! elements plus optional data attributes for coordinates.

use std::sync::Arc;

use scraper::{Html, Selector};
use tracing::{info, instrument, warn};

use qn_core::domain::{RawDetail, RawListing};
use qn_core::{IngestError, Result};

use crate::config::SourceConfig;
use crate::http::{payload_sha256, HttpFetcher};
use crate::sources::Extractor;

pub struct PubQuizHtmlExtractor {
    config: SourceConfig,
    fetcher: Arc<HttpFetcher>,
}

impl PubQuizHtmlExtractor {
    pub fn new(config: SourceConfig, fetcher: Arc<HttpFetcher>) -> Self {
        Self { config, fetcher }
    }

    fn absolute_url(&self, href: &str) -> String {
        if href.starts_with("http://") || href.starts_with("https://") {
            href.to_string()
        } else {
            format!(
                "{}/{}",
                self.config.base_url.trim_end_matches('/'),
                href.trim_start_matches('/')
            )
        }
    }
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| IngestError::Fatal {
        message: format!("invalid selector {css:?}: {e}"),
    })
}

fn text_of(document: &Html, css: &str) -> Result<Option<String>> {
    let sel = selector(css)?;
    Ok(document.select(&sel).next().map(|el| {
        el.text().collect::<String>().trim().to_string()
    }))
}

#[async_trait::async_trait]
impl Extractor for PubQuizHtmlExtractor {
    fn source_id(&self) -> &str {
        &self.config.id
    }

    #[instrument(skip(self))]
    async fn fetch_index(&self) -> Result<Vec<RawListing>> {
        let index_url = format!("{}/quizzes", self.config.base_url.trim_end_matches('/'));
        let body = self.fetcher.get_text(&index_url).await?;
        let document = Html::parse_document(&body);
        let card_sel = selector("a.quiz-card")?;

        let mut listings = Vec::new();
        for card in document.select(&card_sel) {
            let Some(href) = card.value().attr("href") else {
                warn!("quiz card without href, skipping");
                continue;
            };
            let name = card
                .select(&selector(".venue-name")?)
                .next()
                .map(|el| el.text().collect::<String>().trim().to_string());
            listings.push(RawListing {
                source_id: self.config.id.clone(),
                url: self.absolute_url(href),
                name,
            });
        }
        info!(count = listings.len(), "fetched pubquiz html index");
        Ok(listings)
    }

    async fn fetch_detail(&self, url: &str) -> Result<RawDetail> {
        let body = self.fetcher.get_bytes(url).await?;
        let sha = payload_sha256(&body);
        let text = String::from_utf8_lossy(&body).to_string();
        let document = Html::parse_document(&text);

        let name = text_of(&document, "h1.venue-name")?
            .ok_or_else(|| IngestError::Validation {
                message: format!("detail page {url} has no venue name element"),
            })?;
        let address = text_of(&document, ".venue-address")?.unwrap_or_default();
        let time_text = text_of(&document, ".quiz-time")?
            .ok_or_else(|| IngestError::Validation {
                message: format!("detail page {url} has no quiz time element"),
            })?;

        let geo_sel = selector("[data-lat][data-lng]")?;
        let (latitude, longitude) = document
            .select(&geo_sel)
            .next()
            .map(|el| {
                let lat = el.value().attr("data-lat").and_then(|v| v.parse().ok());
                let lng = el.value().attr("data-lng").and_then(|v| v.parse().ok());
                (lat, lng)
            })
            .unwrap_or((None, None));

        let image_sel = selector("img.quiz-poster")?;
        let image_url = document
            .select(&image_sel)
            .next()
            .and_then(|el| el.value().attr("src"))
            .map(|src| self.absolute_url(src));

        Ok(RawDetail {
            url: url.to_string(),
            name,
            address,
            time_text,
            fee_text: text_of(&document, ".quiz-fee")?,
            frequency_text: text_of(&document, ".quiz-frequency")?,
            description: text_of(&document, ".quiz-description")?,
            latitude,
            longitude,
            postcode: None,
            place_id: None,
            phone: text_of(&document, ".venue-phone")?,
            website: document
                .select(&selector("a.venue-website")?)
                .next()
                .and_then(|el| el.value().attr("href"))
                .map(str::to_string),
            performer_name: text_of(&document, ".quizmaster-name")?,
            performer_image: None,
            image_url,
            payload_sha256: Some(sha),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> PubQuizHtmlExtractor {
        let limiter = crate::http::RateLimiter::new(crate::http::Limits::default());
        PubQuizHtmlExtractor::new(
            SourceConfig {
                id: "pubquiz-html".to_string(),
                name: "PubQuiz Directory".to_string(),
                base_url: "https://pubquiz.example".to_string(),
            },
            Arc::new(HttpFetcher::new("test", limiter).unwrap()),
        )
    }

    #[test]
    fn resolves_relative_urls() {
        let e = extractor();
        assert_eq!(
            e.absolute_url("/quiz/railway"),
            "https://pubquiz.example/quiz/railway"
        );
        assert_eq!(
            e.absolute_url("https://other.example/x"),
            "https://other.example/x"
        );
    }

    #[test]
    fn parses_detail_markup() {
        let html = r#"
            <html><body>
              <h1 class="venue-name">The Railway (Back Room)</h1>
              <p class="venue-address">12 High St, SW6 4UL</p>
              <span class="quiz-time">Wednesday 20:00</span>
              <span class="quiz-fee">£2.50</span>
              <div class="map" data-lat="51.47" data-lng="-0.19"></div>
            </body></html>
        "#;
        let document = Html::parse_document(html);
        assert_eq!(
            text_of(&document, "h1.venue-name").unwrap().as_deref(),
            Some("The Railway (Back Room)")
        );
        assert_eq!(
            text_of(&document, ".quiz-time").unwrap().as_deref(),
            Some("Wednesday 20:00")
        );
        assert_eq!(text_of(&document, ".missing").unwrap(), None);
    }
}
