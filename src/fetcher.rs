use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, RETRY_AFTER};
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::config::FetchConfig;
use crate::errors::{FetchError, FetchErrorKind};

const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Raw page content returned by a fetcher.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub content: String,
    pub latency_ms: u64,
}

/// Anything that can turn a URL into page content. One implementation per
/// target kind; tests plug in canned pages.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

/// HTTP fetcher with bounded retries and exponential backoff with jitter.
pub struct HttpFetcher {
    client: reqwest::Client,
    config: FetchConfig,
}

enum Attempt {
    Done(FetchedPage),
    /// Worth another try, optionally after a server-provided delay.
    Transient(FetchError, Option<Duration>),
    Fatal(FetchError),
}

impl HttpFetcher {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));

        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .default_headers(headers);
        builder = match config.proxy.as_deref() {
            Some(proxy) => builder.proxy(reqwest::Proxy::all(proxy)?),
            None => builder.no_proxy(),
        };

        Ok(HttpFetcher {
            client: builder.build()?,
            config,
        })
    }

    async fn attempt(&self, url: &str) -> Attempt {
        let start = Instant::now();
        let response = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => return classify_transport_error(url, e),
        };

        let status = response.status();
        if status.is_success() {
            let final_url = response.url().to_string();
            return match response.text().await {
                Ok(content) => Attempt::Done(FetchedPage {
                    url: url.to_string(),
                    final_url,
                    status: status.as_u16(),
                    content,
                    latency_ms: start.elapsed().as_millis() as u64,
                }),
                Err(e) => classify_transport_error(url, e),
            };
        }

        let code = status.as_u16();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(|secs| Duration::from_secs(secs).min(MAX_RETRY_AFTER));
            return Attempt::Transient(
                error(FetchErrorKind::RateLimited, url, Some(code), "rate limited"),
                retry_after,
            );
        }
        if status.is_server_error() {
            return Attempt::Transient(
                error(FetchErrorKind::Unknown, url, Some(code), "server error"),
                None,
            );
        }
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Attempt::Fatal(error(FetchErrorKind::NotFound, url, Some(code), "not found"));
        }
        Attempt::Fatal(error(
            FetchErrorKind::Unknown,
            url,
            Some(code),
            status.canonical_reason().unwrap_or("client error"),
        ))
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let max = self.config.max_retries.max(1);
        let mut attempt = 1;
        loop {
            match self.attempt(url).await {
                Attempt::Done(page) => {
                    debug!("Fetched {} ({} bytes, {}ms)", url, page.content.len(), page.latency_ms);
                    return Ok(page);
                }
                Attempt::Fatal(mut e) => {
                    e.attempts = attempt;
                    return Err(e);
                }
                Attempt::Transient(mut e, retry_after) => {
                    e.attempts = attempt;
                    if attempt >= max {
                        return Err(e);
                    }
                    let mut wait = backoff_delay(self.config.backoff_base_secs, attempt);
                    if let Some(ra) = retry_after {
                        wait = wait.max(ra);
                    }
                    warn!(
                        "{} on {} (attempt {}/{}), backing off {:.1}s",
                        e.kind,
                        url,
                        attempt,
                        max,
                        wait.as_secs_f64()
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// `base * 2^(attempt-1)` plus uniform jitter of up to the same amount.
pub fn backoff_delay(base_secs: f64, attempt: u32) -> Duration {
    let exp = base_secs.max(0.0) * 2f64.powi(attempt.saturating_sub(1) as i32);
    let jitter = if exp > 0.0 {
        rand::thread_rng().gen_range(0.0..exp)
    } else {
        0.0
    };
    Duration::from_secs_f64(exp + jitter)
}

fn classify_transport_error(url: &str, e: reqwest::Error) -> Attempt {
    if e.is_timeout() {
        return Attempt::Transient(
            error(FetchErrorKind::Timeout, url, None, &e.to_string()),
            None,
        );
    }
    if e.is_builder() || e.is_redirect() {
        return Attempt::Fatal(error(FetchErrorKind::Unknown, url, None, &e.to_string()));
    }
    Attempt::Transient(
        error(FetchErrorKind::Unknown, url, e.status().map(|s| s.as_u16()), &e.to_string()),
        None,
    )
}

fn error(kind: FetchErrorKind, url: &str, status: Option<u16>, message: &str) -> FetchError {
    FetchError {
        kind,
        url: url.to_string(),
        status,
        attempts: 0,
        message: message.to_string(),
    }
}
