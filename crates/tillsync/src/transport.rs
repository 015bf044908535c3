//! HTTP transport collaborator.
//!
//! The engine only needs `request(method, url, params) -> {data, headers}`.
//! Pagination metadata arrives via response headers (`Link`, total count,
//! total pages) which [`ResponseHeaders`] parses into a `next_page` cursor.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, TillSyncError};

/// Query/body parameters. Ordered so identical requests hash and compare
/// identically for scheduler dedup.
pub type Params = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// Pagination-relevant subset of the response headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseHeaders {
    pub total: Option<u64>,
    pub total_pages: Option<u64>,
    pub link: Option<String>,
}

impl ResponseHeaders {
    /// Next page cursor. Prefers the `Link` header's `rel="next"` target;
    /// falls back to total-pages arithmetic against the page just fetched.
    pub fn next_page(&self, current_page: u64) -> Option<u64> {
        if let Some(page) = self.link.as_deref().and_then(parse_link_next_page) {
            return Some(page);
        }
        match self.total_pages {
            Some(total) if current_page < total => Some(current_page + 1),
            _ => None,
        }
    }
}

/// Extracts the `page` query parameter from the `rel="next"` segment of an
/// RFC5988 `Link` header.
fn parse_link_next_page(link: &str) -> Option<u64> {
    for segment in link.split(',') {
        let segment = segment.trim();
        if !segment.contains("rel=\"next\"") {
            continue;
        }
        let url = segment.strip_prefix('<')?.split('>').next()?;
        let query = url.split_once('?').map(|(_, q)| q)?;
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("page=") {
                return value.parse().ok();
            }
        }
    }
    None
}

/// One REST response: parsed JSON body plus pagination headers. Clone so a
/// deduplicated request result can fan out to every waiter.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    pub data: Value,
    pub headers: ResponseHeaders,
}

impl RemoteResponse {
    /// The body as a record list. Endpoints return either an array or a
    /// single object; a single object becomes a one-element list.
    pub fn records(&self) -> Vec<Value> {
        match &self.data {
            Value::Array(items) => items.clone(),
            Value::Null => Vec::new(),
            other => vec![other.clone()],
        }
    }
}

#[async_trait]
pub trait RestTransport: Send + Sync {
    /// Executes one request. GET sends `params` as the query string; other
    /// methods send `body` as JSON with `params` in the query string.
    async fn request(
        &self,
        method: HttpMethod,
        url: &str,
        params: &Params,
        body: Option<&Value>,
    ) -> Result<RemoteResponse>;
}

/// reqwest-backed transport (rustls, no OpenSSL).
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TillSyncError::Config(format!("build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RestTransport for HttpTransport {
    async fn request(
        &self,
        method: HttpMethod,
        url: &str,
        params: &Params,
        body: Option<&Value>,
    ) -> Result<RemoteResponse> {
        let builder = match method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Post => self.client.post(url),
            HttpMethod::Put => self.client.put(url),
            HttpMethod::Delete => self.client.delete(url),
        };
        let mut builder = builder.query(&params.iter().collect::<Vec<_>>());
        if let Some(body) = body {
            builder = builder.json(body);
        }

        debug!("{} {} ({} params)", method.as_str(), url, params.len());
        let response = builder.send().await?;

        let status = response.status();
        let headers = ResponseHeaders {
            total: header_u64(&response, "x-wp-total"),
            total_pages: header_u64(&response, "x-wp-totalpages"),
            link: response
                .headers()
                .get("link")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        };

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TillSyncError::from_status(status.as_u16(), text));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| TillSyncError::Transport(format!("decode body: {}", e)))?;
        Ok(RemoteResponse { data, headers })
    }
}

fn header_u64(response: &reqwest::Response, name: &str) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}
