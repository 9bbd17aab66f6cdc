use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://story-api.dicoding.dev/v1";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("Server error: {} {status_text}", .status.as_u16())]
    Server {
        status: StatusCode,
        status_text: String,
        body: String,
    },
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    Post,
    Put,
    Delete,
}

/// A single mutation against the remote API.
///
/// `path` is either relative to the client's base url or an absolute url.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: RequestMethod,
    pub path: String,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn create(endpoint: &str, payload: &Value) -> Self {
        Self {
            method: RequestMethod::Post,
            path: endpoint.to_string(),
            body: Some(payload.clone()),
        }
    }

    /// PUT to `endpoint/{payload.id}`; the bare endpoint is used when the payload carries no id.
    pub fn update(endpoint: &str, payload: &Value) -> Self {
        Self {
            method: RequestMethod::Put,
            path: resource_path(endpoint, payload),
            body: Some(payload.clone()),
        }
    }

    pub fn delete(endpoint: &str, payload: &Value) -> Self {
        Self {
            method: RequestMethod::Delete,
            path: resource_path(endpoint, payload),
            body: None,
        }
    }
}

fn resource_path(endpoint: &str, payload: &Value) -> String {
    let id = match payload.get("id") {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => return endpoint.to_string(),
    };
    format!("{}/{}", endpoint.trim_end_matches('/'), id)
}

#[derive(Clone)]
pub struct StoryClient {
    http: Client,
    base_url: Url,
}

impl StoryClient {
    pub fn new() -> Result<Self, ApiError> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, ApiError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolves an endpoint against the base url, keeping any base path prefix such as `/v1`.
    pub fn resolve(&self, endpoint: &str) -> Result<Url, ApiError> {
        if let Ok(absolute) = Url::parse(endpoint) {
            return Ok(absolute);
        }
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = endpoint.trim_start_matches('/');
        Ok(Url::parse(&format!("{base}/{path}"))?)
    }

    pub async fn send(&self, request: &ApiRequest, token: Option<&str>) -> Result<Value, ApiError> {
        let url = self.resolve(&request.path)?;
        let mut builder = match request.method {
            RequestMethod::Post => self.http.post(url),
            RequestMethod::Put => self.http.put(url),
            RequestMethod::Delete => self.http.delete(url),
        };
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        let response = builder.send().await?;
        Self::handle_response(response).await
    }

    /// Reachability check used by the connectivity monitor: any HTTP answer means the API host is reachable.
    pub async fn probe(&self) -> Result<StatusCode, ApiError> {
        let response = self.http.get(self.base_url.clone()).send().await?;
        Ok(response.status())
    }

    async fn handle_response(response: reqwest::Response) -> Result<Value, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let status_text = status.canonical_reason().unwrap_or_default().to_string();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Server {
                status,
                status_text,
                body,
            });
        }
        let bytes = response.bytes().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn update_and_delete_append_payload_id() {
        let update = ApiRequest::update("/api/stories", &json!({"id": 42, "title": "A"}));
        assert_eq!(update.method, RequestMethod::Put);
        assert_eq!(update.path, "/api/stories/42");
        assert!(update.body.is_some());

        let delete = ApiRequest::delete("/api/stories/", &json!({"id": "story-1"}));
        assert_eq!(delete.path, "/api/stories/story-1");
        assert!(delete.body.is_none());
    }

    #[test]
    fn missing_id_keeps_bare_endpoint() {
        let update = ApiRequest::update("/api/stories", &json!({"title": "A"}));
        assert_eq!(update.path, "/api/stories");
    }

    #[test]
    fn resolve_keeps_base_path_prefix() {
        let client = StoryClient::with_base_url("https://story.example/v1").unwrap();
        assert_eq!(
            client.resolve("/stories").unwrap().as_str(),
            "https://story.example/v1/stories"
        );
        assert_eq!(
            client.resolve("https://other.example/x").unwrap().as_str(),
            "https://other.example/x"
        );
    }
}
