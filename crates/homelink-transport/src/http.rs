//! REST transport backed by `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, ClientBuilder};
use url::Url;

use homelink_core::transport::http_method::Method;
use homelink_core::{RestClient, TransportError, TransportResult};

/// A `reqwest`-backed [`RestClient`].
pub struct HttpRestClient {
    client: Client,
}

impl HttpRestClient {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let client = ClientBuilder::new()
            .timeout(timeout)
            .build()
            .expect("default TLS backend unavailable");
        Self { client }
    }
}

impl Default for HttpRestClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RestClient for HttpRestClient {
    async fn call(
        &self,
        method: Method,
        url: Url,
        host_header: String,
        user_agent: Option<String>,
        bearer_token: Option<String>,
        body: Option<serde_json::Value>,
    ) -> TransportResult<(u16, Option<String>, String)> {
        let mut req = match method {
            Method::Get => self.client.get(url),
            Method::Post => self.client.post(url),
        };
        req = req.header(reqwest::header::HOST, host_header);
        if let Some(ua) = user_agent {
            req = req.header(reqwest::header::USER_AGENT, ua);
        }
        if let Some(token) = bearer_token {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.split(';').next().unwrap_or(s).trim().to_string());
        let text = resp.text().await.unwrap_or_default();
        Ok((status, content_type, text))
    }
}
