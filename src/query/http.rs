//! A [`BaseQuery`] over HTTP, built on `reqwest`.
//!
//! Enabled with the `http` feature.
//!
//! ```rust,ignore
//! use quiver::query::{Api, http::HttpBaseQuery};
//!
//! let api = Api::builder(HttpBaseQuery::new("https://api.example.com")).build();
//! ```

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use super::error::QueryError;
use super::request::{BaseQuery, BaseQueryResult, Method, RequestDescriptor};

/// Sends each [`RequestDescriptor`] as a JSON HTTP request.
///
/// Relative URLs are joined onto the base URL. Empty response bodies decode
/// as `null`; non-success statuses become [`QueryError::Transport`] carrying
/// the status and any JSON error body.
#[derive(Debug, Clone)]
pub struct HttpBaseQuery {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBaseQuery {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }
}

fn method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

fn decode(bytes: &[u8]) -> Option<Value> {
    if bytes.is_empty() {
        return Some(Value::Null);
    }
    serde_json::from_slice(bytes).ok()
}

impl BaseQuery for HttpBaseQuery {
    fn fetch(&self, request: RequestDescriptor) -> BoxFuture<'static, BaseQueryResult> {
        let mut builder = self
            .client
            .request(method(request.method), self.url(&request.url));
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        async move {
            let response = builder
                .send()
                .await
                .map_err(|e| QueryError::transport(e.to_string()))?;
            let status = response.status();
            let bytes = response
                .bytes()
                .await
                .map_err(|e| QueryError::transport(e.to_string()))?;

            if status.is_success() {
                decode(&bytes).ok_or_else(|| QueryError::Transform("response is not JSON".to_string()))
            } else {
                Err(QueryError::Transport {
                    status: Some(status.as_u16()),
                    message: status
                        .canonical_reason()
                        .unwrap_or("request failed")
                        .to_string(),
                    data: decode(&bytes),
                })
            }
        }
        .boxed()
    }
}
