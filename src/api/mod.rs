use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

pub mod retry;
pub mod types;

pub use retry::{retry_idempotent, RetryConfig};
pub use types::Endpoints;

use crate::cache::Identity;
use crate::errors::ApiError;
use crate::observability::telemetry::sanitize_for_log;

/// Longest error body excerpt kept in an [`ApiError::HttpStatus`] message.
const MAX_ERROR_EXCERPT: usize = 200;

/// Trait abstraction over the CRUD surface, enabling test mocking.
#[async_trait]
pub trait ContentApi: Send + Sync {
    /// `GET /api/<resource>`: the authoritative collection.
    async fn list(&self, resource: &str) -> Result<Vec<Value>, ApiError>;

    /// `POST /api/admin/<resource>`: returns the created record.
    async fn create(&self, resource: &str, body: &Map<String, Value>) -> Result<Value, ApiError>;

    /// `PUT /api/admin/<resource>/<id>`: returns the server's view of the
    /// record, or `Null` when the server answers without a body.
    async fn update(
        &self,
        resource: &str,
        id: &Identity,
        body: &Map<String, Value>,
    ) -> Result<Value, ApiError>;

    /// `DELETE /api/admin/<resource>/<id>`
    async fn delete(&self, resource: &str, id: &Identity) -> Result<(), ApiError>;
}

pub struct HttpContentApi {
    client: Client,
    endpoints: Endpoints,
    api_key: Option<String>,
}

impl HttpContentApi {
    pub fn new(config: &crate::config::Config) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ApiError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoints: Endpoints::new(&config.endpoint)?,
            api_key: config.api_key.clone(),
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn execute(&self, label: &str, request: RequestBuilder) -> Result<Value, ApiError> {
        debug!(request = label, "Sending content API request");
        let response = self
            .authorize(request)
            .header("Accept", "application/json")
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        let result = classify_response(status, &body);
        if let Err(e) = &result {
            warn!(request = label, status, error = %e, "Content API request failed");
        }
        result
    }
}

#[async_trait]
impl ContentApi for HttpContentApi {
    async fn list(&self, resource: &str) -> Result<Vec<Value>, ApiError> {
        let url = self.endpoints.list_url(resource)?;
        let value = self.execute("list", self.client.get(url)).await?;
        types::unwrap_list(value)
    }

    async fn create(&self, resource: &str, body: &Map<String, Value>) -> Result<Value, ApiError> {
        let url = self.endpoints.create_url(resource)?;
        let value = self
            .execute("create", self.client.post(url).json(body))
            .await?;
        Ok(types::unwrap_record(value))
    }

    async fn update(
        &self,
        resource: &str,
        id: &Identity,
        body: &Map<String, Value>,
    ) -> Result<Value, ApiError> {
        let url = self.endpoints.item_url(resource, id)?;
        let value = self
            .execute("update", self.client.put(url).json(body))
            .await?;
        Ok(types::unwrap_record(value))
    }

    async fn delete(&self, resource: &str, id: &Identity) -> Result<(), ApiError> {
        let url = self.endpoints.item_url(resource, id)?;
        self.execute("delete", self.client.delete(url)).await?;
        Ok(())
    }
}

/// Whether a response body is an HTML page rather than JSON. Misrouted
/// requests and proxy failures answer with one, sometimes with a 200.
pub fn looks_like_html(body: &str) -> bool {
    let head: String = body
        .trim_start()
        .chars()
        .take(15)
        .collect::<String>()
        .to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

/// Turn a raw HTTP response into a JSON value or a classified error.
pub fn classify_response(status: u16, body: &str) -> Result<Value, ApiError> {
    if looks_like_html(body) {
        return Err(ApiError::HtmlErrorPage { status });
    }

    if !(200..300).contains(&status) {
        return Err(ApiError::HttpStatus {
            status,
            message: error_message(body),
        });
    }

    if body.trim().is_empty() {
        return Ok(Value::Null);
    }

    serde_json::from_str(body).map_err(|e| ApiError::Parse(e.to_string()))
}

fn error_message(body: &str) -> String {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) {
        for key in ["error", "message"] {
            if let Some(Value::String(msg)) = map.get(key) {
                return sanitize_for_log(msg);
            }
        }
    }
    let excerpt: String = body.trim().chars().take(MAX_ERROR_EXCERPT).collect();
    if excerpt.is_empty() {
        "empty response body".to_string()
    } else {
        sanitize_for_log(&excerpt)
    }
}
