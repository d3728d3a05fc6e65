//! Shared HTTP client with scoped session acquisition.
//!
//! Adapters never hold a `reqwest::Client` of their own. They take an [`HttpSession`]
//! for the duration of one fetch; the session owns a connection slot that is given
//! back when it drops, whether the fetch succeeded, failed, timed out or was cancelled.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use evcat_core::SourceError;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_sessions: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: Some("evcat-bot/0.1".to_string()),
            max_sessions: 16,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    sessions: Arc<Semaphore>,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            sessions: Arc::new(Semaphore::new(config.max_sessions.max(1))),
        })
    }

    /// Wait for a free connection slot.
    pub async fn session(&self) -> Result<HttpSession, SourceError> {
        let permit = Arc::clone(&self.sessions)
            .acquire_owned()
            .await
            .map_err(|_| SourceError::network("http client is shut down"))?;
        Ok(HttpSession {
            client: self.client.clone(),
            _permit: permit,
        })
    }

    pub fn available_sessions(&self) -> usize {
        self.sessions.available_permits()
    }
}

#[derive(Debug)]
pub struct HttpSession {
    client: reqwest::Client,
    _permit: OwnedSemaphorePermit,
}

impl HttpSession {
    pub async fn get_text(&self, url: &str) -> Result<String, SourceError> {
        debug!(url, "http get");
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| classify_reqwest_error(&err))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(resp.headers(), Utc::now());
            return Err(classify_status(status, retry_after, url));
        }

        resp.text().await.map_err(|err| classify_reqwest_error(&err))
    }
}

/// Map a non-success status onto the source failure taxonomy.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, url: &str) -> SourceError {
    let message = format!("http status {} for {url}", status.as_u16());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SourceError::auth(message),
        StatusCode::TOO_MANY_REQUESTS => SourceError::rate_limited(message, retry_after),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => SourceError::timeout(message),
        s if s.is_server_error() => SourceError::network(message),
        // Remaining 4xx: the request itself is wrong for this source.
        _ => SourceError::parse(message),
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> SourceError {
    if err.is_timeout() {
        SourceError::timeout(err.to_string())
    } else if err.is_decode() {
        SourceError::parse(err.to_string())
    } else {
        SourceError::network(err.to_string())
    }
}

/// `Retry-After` as delta-seconds or an HTTP date.
pub fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    (at - now).to_std().ok()
}
