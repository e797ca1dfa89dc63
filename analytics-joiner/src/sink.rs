use std::time;

use async_trait::async_trait;
use futures::StreamExt;
use http::StatusCode;
use reqwest::{header, Client, Url};
use tracing::debug;

use crate::error::SinkError;
use crate::event::MergedRecord;

const USER_AGENT: &str = "analytics-joiner";
const MAX_RESPONSE_BODY: usize = 1024;

/// Downstream consumer of merged records.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    /// Make one delivery attempt. Retrying is the caller's concern.
    async fn send(&self, record: &MergedRecord) -> Result<(), SinkError>;
}

pub fn build_http_client(request_timeout: time::Duration) -> reqwest::Result<Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    reqwest::Client::builder()
        .default_headers(headers)
        .user_agent(USER_AGENT)
        .timeout(request_timeout)
        .build()
}

/// `POST`s each merged record as JSON to the analytics endpoint.
pub struct HttpSink {
    client: Client,
    endpoint: Url,
}

impl HttpSink {
    pub fn new(endpoint: Url, request_timeout: time::Duration) -> reqwest::Result<Self> {
        Ok(Self {
            client: build_http_client(request_timeout)?,
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl AnalyticsSink for HttpSink {
    async fn send(&self, record: &MergedRecord) -> Result<(), SinkError> {
        let body = serde_json::to_vec(record)
            .map_err(|error| SinkError::permanent(format!("failed to serialize record: {error}")))?;

        let response = self
            .client
            .post(self.endpoint.clone())
            .body(body)
            .send()
            .await
            .map_err(|error| {
                if error.is_builder() {
                    SinkError::permanent(format!("invalid request: {error}"))
                } else {
                    SinkError::transient(format!("request failed: {error}"))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(id = %record.id, status = %status, "analytics sink accepted record");
            return Ok(());
        }

        let retry_after = parse_retry_after_header(response.headers());
        let body = first_n_bytes_of_response(response, MAX_RESPONSE_BODY).await;
        let message = format!("analytics sink responded {status}: {body}");

        if is_retryable_status(status) {
            Err(SinkError::Transient {
                message,
                retry_after,
            })
        } else {
            Err(SinkError::Permanent { message })
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Read at most `n` bytes of the body, dropping the rest of the stream unread.
async fn first_n_bytes_of_response(response: reqwest::Response, n: usize) -> String {
    let mut body = response.bytes_stream();
    let mut buffer = Vec::with_capacity(n);

    while let Some(chunk) = body.next().await {
        let Ok(chunk) = chunk else {
            break;
        };
        let remaining = n - buffer.len();
        buffer.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
        if buffer.len() >= n {
            break;
        }
    }

    String::from_utf8_lossy(&buffer).into_owned()
}

/// Attempt to parse a Duration from a Retry-After header, returning None if not possible.
/// Retry-After header can specify a date in RFC2822 or a number of seconds; we try to parse both.
fn parse_retry_after_header(header_map: &header::HeaderMap) -> Option<time::Duration> {
    let retry_after = header_map.get(header::RETRY_AFTER)?.to_str().ok()?;

    if let Ok(u) = retry_after.parse::<u64>() {
        return Some(time::Duration::from_secs(u));
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let duration =
            chrono::DateTime::<chrono::offset::Utc>::from(dt) - chrono::offset::Utc::now();

        // This can only fail when negative, in which case we return None.
        return duration.to_std().ok();
    }

    None
}
