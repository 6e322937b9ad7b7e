//! Upstream HTTP client
//!
//! One reqwest client shared by the proxy and the handlers. Every call
//! carries the configured deadline; exceeding it maps to the `timeout`
//! error, any other transport failure to `upstream_error` with status 0.

use http::{HeaderMap, Method};
use serde_json::Value;
use std::time::Duration;

use crate::config::UpstreamConfig;
use crate::error::{Error, Result};

/// Hop-by-hop headers that must not be forwarded in either direction
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
    "accept-encoding",
];

/// A forwarded upstream response
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    /// Upstream status code
    pub status: u16,
    /// Content type, defaulting to JSON
    pub content_type: String,
    /// Raw body bytes
    pub body: Vec<u8>,
    /// Upstream `Link` header, passed through for pagination
    pub link: Option<String>,
    /// Upstream `Retry-After` hint in seconds, when present
    pub retry_after: Option<u64>,
}

impl UpstreamResponse {
    /// Parse the body as JSON
    pub fn json(&self) -> Result<Value> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::Upstream {
                status: self.status,
                message: format!("non-JSON upstream body: {e}"),
            })
    }
}

/// Shared upstream client. Cheap to clone.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl UpstreamClient {
    /// Build the client from upstream configuration
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            timeout: config.timeout(),
        })
    }

    /// Forward a request to `instance`, returning the upstream response
    /// whatever its status. Hop-by-hop headers are stripped; the upstream
    /// bearer token replaces whatever authorization the client sent.
    pub async fn forward(
        &self,
        method: Method,
        instance: &str,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Option<Vec<u8>>,
        token: Option<&str>,
    ) -> Result<UpstreamResponse> {
        let url = format!("https://{}{}", instance, path_and_query);

        let mut request = self.http.request(method, &url).timeout(self.timeout);

        for (name, value) in headers {
            let lowered = name.as_str().to_ascii_lowercase();
            if HOP_BY_HOP.contains(&lowered.as_str()) || lowered == "authorization" {
                continue;
            }
            request = request.header(name, value);
        }
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await.map_err(map_transport_error)?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let link = response
            .headers()
            .get(http::header::LINK)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let retry_after = response
            .headers()
            .get(http::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body = response
            .bytes()
            .await
            .map_err(map_transport_error)?
            .to_vec();

        Ok(UpstreamResponse {
            status,
            content_type,
            body,
            link,
            retry_after,
        })
    }

    /// GET a JSON document from `instance`
    pub async fn get_json(
        &self,
        instance: &str,
        path_and_query: &str,
        token: Option<&str>,
    ) -> Result<UpstreamResponse> {
        self.forward(
            Method::GET,
            instance,
            path_and_query,
            &HeaderMap::new(),
            None,
            token,
        )
        .await
    }
}

fn map_transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout
    } else {
        Error::Upstream {
            status: 0,
            message: "upstream unreachable".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_response_json_parsing() {
        let response = UpstreamResponse {
            status: 200,
            content_type: "application/json".to_string(),
            body: br#"[{"id":"1"}]"#.to_vec(),
            link: None,
            retry_after: None,
        };
        let value = response.json().unwrap();
        assert_eq!(value[0]["id"], "1");

        let broken = UpstreamResponse {
            status: 200,
            content_type: "text/html".to_string(),
            body: b"<html>".to_vec(),
            link: None,
            retry_after: None,
        };
        assert!(matches!(broken.json(), Err(Error::Upstream { status: 200, .. })));
    }
}
