use serde::Deserialize;
use tracing::debug;

use qn_core::{IngestError, Result};

use crate::http::HttpFetcher;

/// Structured geocoder response. The resolver only consumes this shape;
/// the HTTP call and provider format stay behind the trait.
#[derive(Debug, Clone, Deserialize)]
pub struct GeoResult {
    pub latitude: f64,
    pub longitude: f64,
    pub city: String,
    pub country: String,
    pub country_code: String,
    #[serde(default)]
    pub postcode: Option<String>,
    #[serde(default)]
    pub place_id: Option<String>,
}

#[async_trait::async_trait]
pub trait Geocoder: Send + Sync {
    async fn lookup_address(&self, address: &str) -> Result<GeoResult>;
    async fn lookup_coords(&self, latitude: f64, longitude: f64) -> Result<GeoResult>;
}

/// HTTP-backed geocoder. Expects a service that answers
/// `GET {base}/geocode?q=...` and `GET {base}/reverse?lat=...&lng=...`
/// with a `GeoResult` JSON body.
pub struct HttpGeocoder {
    base_url: String,
    fetcher: std::sync::Arc<HttpFetcher>,
}

impl HttpGeocoder {
    pub fn new(base_url: &str, fetcher: std::sync::Arc<HttpFetcher>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            fetcher,
        }
    }

    async fn fetch(&self, url: &str) -> Result<GeoResult> {
        let body = self.fetcher.get_bytes(url).await?;
        let result: GeoResult =
            serde_json::from_slice(&body).map_err(|e| IngestError::TransientFetch {
                message: format!("geocoder returned unexpected body: {e}"),
            })?;
        debug!(city = %result.city, "geocoder hit");
        Ok(result)
    }
}

#[async_trait::async_trait]
impl Geocoder for HttpGeocoder {
    async fn lookup_address(&self, address: &str) -> Result<GeoResult> {
        let mut encoded = String::with_capacity(address.len());
        for byte in address.bytes() {
            if byte.is_ascii_alphanumeric() {
                encoded.push(byte as char);
            } else {
                encoded.push_str(&format!("%{byte:02X}"));
            }
        }
        self.fetch(&format!("{}/geocode?q={encoded}", self.base_url))
            .await
    }

    async fn lookup_coords(&self, latitude: f64, longitude: f64) -> Result<GeoResult> {
        self.fetch(&format!(
            "{}/reverse?lat={latitude}&lng={longitude}",
            self.base_url
        ))
        .await
    }
}

/// Fixed-answer geocoder for tests and offline runs.
pub struct StaticGeocoder {
    pub result: GeoResult,
}

#[async_trait::async_trait]
impl Geocoder for StaticGeocoder {
    async fn lookup_address(&self, _address: &str) -> Result<GeoResult> {
        Ok(self.result.clone())
    }

    async fn lookup_coords(&self, _latitude: f64, _longitude: f64) -> Result<GeoResult> {
        Ok(self.result.clone())
    }
}
