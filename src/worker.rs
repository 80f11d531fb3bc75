use std::time::Duration;

use async_trait::async_trait;

use crate::error::FailureReason;

/// Longest response body kept in delivery history.
const MAX_SUMMARY_CHARS: usize = 512;

/// A fully prepared webhook POST.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// Exact bytes that were signed.
    pub body: Vec<u8>,
    pub timeout: Duration,
}

impl OutboundRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Whatever the receiver answered, regardless of status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

/// Sends prepared requests. Implementations report any HTTP answer as `Ok`;
/// only failures to obtain an answer are `Err`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, request: OutboundRequest) -> Result<TransportResponse, FailureReason>;
}

/// reqwest-backed transport.
#[cfg(feature = "http")]
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpTransport {
    /// Build a client that never follows redirects.
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, request: OutboundRequest) -> Result<TransportResponse, FailureReason> {
        let OutboundRequest { url, headers, body, timeout } = request;

        let mut builder = self.client.post(&url).timeout(timeout);
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        match builder.body(body).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                Ok(TransportResponse { status, body })
            }
            Err(err) if err.is_timeout() => Err(FailureReason::Timeout(timeout)),
            Err(err) if err.is_connect() => Err(FailureReason::Network(format!("connection failed: {err}"))),
            Err(err) => Err(FailureReason::Network(err.to_string())),
        }
    }
}

/// Perform one attempt under a hard timeout.
///
/// Returns the response summary on a 2xx answer.
pub async fn deliver(transport: &dyn Transport, request: OutboundRequest) -> Result<String, FailureReason> {
    let timeout = request.timeout;
    match tokio::time::timeout(timeout, transport.post(request)).await {
        Err(_) => Err(FailureReason::Timeout(timeout)),
        Ok(Err(reason)) => Err(reason),
        Ok(Ok(response)) if (200..300).contains(&response.status) => Ok(summarize(&response)),
        Ok(Ok(response)) => Err(FailureReason::HttpStatus {
            status: response.status,
            body: truncate(&response.body),
        }),
    }
}

fn summarize(response: &TransportResponse) -> String {
    let body = truncate(&response.body);
    if body.is_empty() {
        format!("HTTP {}", response.status)
    } else {
        format!("HTTP {}: {}", response.status, body)
    }
}

fn truncate(body: &str) -> String {
    body.trim().chars().take(MAX_SUMMARY_CHARS).collect()
}

/// Exponential backoff before the retry that follows `failed_attempts`
/// failures: `base`, `2 * base`, `4 * base`, ...
pub fn retry_delay(base_ms: u64, failed_attempts: u32) -> Duration {
    let exponent = failed_attempts.saturating_sub(1).min(32);
    let factor = 2u64.saturating_pow(exponent);
    Duration::from_millis(base_ms.max(1).saturating_mul(factor))
}
