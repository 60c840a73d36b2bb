//! HTTP transport for the crawl pipeline
//!
//! reqwest client with a governor rate limiter. Retry policy lives here:
//! 5xx / 429 / timeouts are reported retryable and the scheduler may
//! resubmit up to `max_retries` times, waiting out [`HttpTransport::backoff`]
//! (exponential, jittered) before each one. Other 4xx responses are terminal.

use std::num::NonZeroU32;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Client, StatusCode};

use crate::crawling::tasks::{FetchMethod, FetchTarget, Payload};
use crate::crawling::transport::{FetchError, Transport};
use crate::infrastructure::config::HttpConfig;

/// Rate-limited HTTP transport
pub struct HttpTransport {
    client: Client,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    config: HttpConfig,
}

impl HttpTransport {
    /// Create a new HTTP transport with the given configuration
    ///
    /// # Errors
    /// Fails on an invalid user agent, a zero rate limit or a client build error.
    pub fn new(config: HttpConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent).context("Invalid user agent")?,
        );

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .cookie_store(true)
            .redirect(if config.follow_redirects {
                reqwest::redirect::Policy::limited(10)
            } else {
                reqwest::redirect::Policy::none()
            })
            .build()
            .context("Failed to create HTTP client")?;

        let quota = Quota::per_second(
            NonZeroU32::new(config.max_requests_per_second)
                .context("Rate limit must be greater than 0")?,
        );

        Ok(Self {
            client,
            rate_limiter: RateLimiter::direct(quota),
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// Exponential backoff for the `attempt`-th resubmission, capped, with
    /// up to 50% random jitter
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = self
            .config
            .retry_base_delay_ms
            .saturating_mul(1_u64 << (attempt - 1).min(16));
        let capped = exp.min(self.config.retry_max_delay_ms);
        let jitter = fastrand::u64(0..=capped / 2);
        Duration::from_millis(capped.saturating_add(jitter).min(self.config.retry_max_delay_ms))
    }

    fn classify_status(status: StatusCode, uri: &str) -> FetchError {
        let reason = format!("HTTP {status} from {uri}");
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            FetchError::Retryable { reason }
        } else {
            FetchError::Terminal { reason }
        }
    }

    fn classify_transport_error(&self, error: &reqwest::Error) -> FetchError {
        if error.is_timeout() {
            FetchError::Timeout(Duration::from_secs(self.config.timeout_secs))
        } else if error.is_builder() || error.is_redirect() {
            FetchError::terminal(error.to_string())
        } else {
            FetchError::retryable(error.to_string())
        }
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn resolve(&self, target: &FetchTarget) -> Result<Payload, FetchError> {
        self.rate_limiter.until_ready().await;

        let mut request = match target.method {
            FetchMethod::Get => self.client.get(&target.uri),
            FetchMethod::Post => self.client.post(&target.uri),
        };
        for (name, value) in &target.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| FetchError::terminal(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| FetchError::terminal(format!("invalid header value: {e}")))?;
            request = request.header(name, value);
        }
        if let Some(body) = &target.body {
            request = request.body(body.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.classify_transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::classify_status(status, &target.uri));
        }

        let final_uri = response.url().to_string();
        let body = response
            .text()
            .await
            .map_err(|e| self.classify_transport_error(&e))?;

        tracing::debug!("Fetched {} ({status}, {} bytes)", final_uri, body.len());
        Ok(Payload::new(body, final_uri))
    }

    fn retry_budget(&self) -> u32 {
        self.config.max_retries
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        self.backoff(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawling::tasks::StageTag;
    use mockito::Server;

    fn transport() -> HttpTransport {
        HttpTransport::new(HttpConfig {
            max_requests_per_second: 100,
            retry_base_delay_ms: 10,
            retry_max_delay_ms: 40,
            ..HttpConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn get_returns_body_and_final_uri() {
        let mut server = Server::new_async().await;
        let m = server
            .mock("GET", "/api/products/A1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"A1"}"#)
            .expect(1)
            .create_async()
            .await;

        let uri = format!("{}/api/products/A1", server.url());
        let target = FetchTarget::get(StageTag::FetchDetail, uri.clone());
        let payload = transport().resolve(&target).await.unwrap();

        assert_eq!(&*payload.body, r#"{"id":"A1"}"#);
        assert_eq!(payload.final_uri, uri);
        m.assert_async().await;
    }

    #[tokio::test]
    async fn post_sends_payload_and_headers() {
        let mut server = Server::new_async().await;
        let m = server
            .mock("POST", "/graphql")
            .match_header("content-type", "application/json")
            .match_body(r#"{"query":"{ categories }"}"#)
            .with_status(200)
            .with_body(r#"{"data":{}}"#)
            .create_async()
            .await;

        let target = FetchTarget::post(
            StageTag::DiscoverCategories,
            format!("{}/graphql", server.url()),
            r#"{"query":"{ categories }"}"#,
        )
        .with_header("content-type", "application/json");

        assert!(transport().resolve(&target).await.is_ok());
        m.assert_async().await;
    }

    #[tokio::test]
    async fn server_errors_are_retryable() {
        let mut server = Server::new_async().await;
        server.mock("GET", "/busy").with_status(503).create_async().await;
        server.mock("GET", "/slow-down").with_status(429).create_async().await;

        for path in ["/busy", "/slow-down"] {
            let target = FetchTarget::get(StageTag::ListPage, format!("{}{path}", server.url()));
            let err = transport().resolve(&target).await.unwrap_err();
            assert!(err.is_retryable(), "{path} should be retryable: {err}");
        }
    }

    #[tokio::test]
    async fn client_errors_are_terminal() {
        let mut server = Server::new_async().await;
        server.mock("GET", "/gone").with_status(404).create_async().await;

        let target = FetchTarget::get(StageTag::FetchDetail, format!("{}/gone", server.url()));
        let err = transport().resolve(&target).await.unwrap_err();
        assert!(matches!(err, FetchError::Terminal { .. }));
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let transport = transport();
        assert_eq!(transport.backoff(0), Duration::ZERO);
        for attempt in 1..8 {
            let delay = transport.backoff(attempt);
            assert!(delay >= Duration::from_millis(10));
            assert!(delay <= Duration::from_millis(40));
        }
    }

    #[test]
    fn zero_rate_limit_is_rejected() {
        let config = HttpConfig {
            max_requests_per_second: 0,
            ..HttpConfig::default()
        };
        assert!(HttpTransport::new(config).is_err());
    }

    #[test]
    fn retry_budget_follows_config() {
        assert_eq!(transport().retry_budget(), HttpConfig::default().max_retries);
    }

    #[tokio::test]
    async fn resolve_does_not_sleep_for_retries() {
        let mut server = Server::new_async().await;
        server.mock("GET", "/again").with_status(200).with_body("ok").create_async().await;

        let slow = HttpTransport::new(HttpConfig {
            max_requests_per_second: 100,
            retry_base_delay_ms: 5_000,
            retry_max_delay_ms: 5_000,
            ..HttpConfig::default()
        })
        .unwrap();
        let target = FetchTarget::get(StageTag::FetchDetail, format!("{}/again", server.url())).retried();

        let started = std::time::Instant::now();
        slow.resolve(&target).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(slow.retry_delay(1), Duration::from_secs(5));
    }
}
