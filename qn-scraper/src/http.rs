use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

use qn_core::{IngestError, Result};

#[derive(Clone, Debug, Default)]
pub struct Limits {
    pub requests_per_min: Option<u64>,
    pub concurrency: Option<u32>,
}

/// Process-local token bucket in front of outbound HTTP. This smooths
/// bursts within a single worker; the per-source hourly cap is enforced
/// separately by the scheduler so it holds across processes.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    limits: Limits,
    // token bucket modeled by the time of last refill and the current tokens
    rpm_tokens: Mutex<(f64, Instant)>,
    sem: Option<Semaphore>,
}

impl RateLimiter {
    pub fn new(limits: Limits) -> Self {
        let now = Instant::now();
        let rpm_capacity = limits.requests_per_min.unwrap_or(0) as f64;
        let sem = limits.concurrency.map(|c| Semaphore::new(c as usize));
        Self {
            inner: Arc::new(Inner {
                limits,
                rpm_tokens: Mutex::new((rpm_capacity, now)),
                sem,
            }),
        }
    }

    /// Acquire permission for one request. Awaits as needed.
    pub async fn acquire(&self) {
        let _permit = if let Some(sem) = &self.inner.sem {
            sem.acquire().await.ok()
        } else {
            None
        };

        if let Some(rpm) = self.inner.limits.requests_per_min {
            if rpm > 0 {
                self.consume_token(rpm as f64).await;
            }
        }
        // _permit dropped here, releasing concurrency
    }

    async fn consume_token(&self, capacity: f64) {
        // Refill continuously, wait until a token accumulates
        loop {
            let mut guard = self.inner.rpm_tokens.lock().await;
            let (ref mut tokens, ref mut last) = *guard;
            let now = Instant::now();
            let elapsed = now.duration_since(*last).as_secs_f64();
            let refill_rate = capacity / 60.0;
            *tokens = (*tokens + elapsed * refill_rate).min(capacity);
            *last = now;
            if *tokens >= 1.0 {
                *tokens -= 1.0;
                break;
            }
            let secs = (1.0 - *tokens) / refill_rate;
            drop(guard);
            tokio::time::sleep(Duration::from_secs_f64(secs.max(0.001))).await;
        }
    }
}

/// Shared HTTP fetcher. Network failures and 5xx responses come back as
/// transient errors so the job queue retries them; 4xx responses are
/// treated as fatal for the job.
pub struct HttpFetcher {
    client: reqwest::Client,
    limiter: RateLimiter,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, limiter: RateLimiter) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| IngestError::Fatal {
                message: format!("failed to build http client: {e}"),
            })?;
        Ok(Self { client, limiter })
    }

    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        self.limiter.acquire().await;
        debug!(url, "http get");
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| IngestError::TransientFetch {
                message: format!("request to {url} failed: {e}"),
            })?;
        let status = resp.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(IngestError::TransientFetch {
                message: format!("{url} returned {status}"),
            });
        }
        if !status.is_success() {
            return Err(IngestError::Fatal {
                message: format!("{url} returned {status}"),
            });
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| IngestError::TransientFetch {
                message: format!("reading body from {url} failed: {e}"),
            })?;
        Ok(bytes.to_vec())
    }

    pub async fn get_text(&self, url: &str) -> Result<String> {
        let bytes = self.get_bytes(url).await?;
        String::from_utf8(bytes).map_err(|e| IngestError::Validation {
            message: format!("{url} returned non-utf8 body: {e}"),
        })
    }
}

/// Content digest used for provenance metadata and change tracing.
pub fn payload_sha256(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_is_stable() {
        let a = payload_sha256(b"quiz night");
        let b = payload_sha256(b"quiz night");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, payload_sha256(b"quiz nights"));
    }

    #[tokio::test]
    async fn limiter_without_limits_is_passthrough() {
        let limiter = RateLimiter::new(Limits::default());
        let start = Instant::now();
        for _ in 0..50 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn limiter_spaces_out_requests() {
        // 600 rpm = one token per 100ms; bucket starts full so the first
        // burst is free, then requests wait for refill
        let limiter = RateLimiter::new(Limits {
            requests_per_min: Some(600),
            concurrency: None,
        });
        let start = Instant::now();
        for _ in 0..602 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(150));
    }
}
