//! Forwards tunnel requests to the local HTTP service.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Url};
use thiserror::Error;

use ntunnel_shared::protocol::{
    Headers, TunnelErrorResponse, TunnelRequest, TunnelResponse, TunnelResponseMessage,
};

/// Default cap on relayed response bodies (256 KB)
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 256 * 1024;

/// Status reported for every forwarding failure
const BAD_GATEWAY: u16 = 502;

/// Why a request could not be relayed; the text is sent back to the client.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Response too large: {size} bytes exceeds limit of {limit}")]
    Oversize { size: u64, limit: usize },
}

/// Executes tunnelled requests against a single local base address
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: Client,
    target: Url,
    max_response_size: usize,
}

impl Forwarder {
    pub fn new(target: Url, max_response_size: usize) -> Self {
        Self::with_client(Client::new(), target, max_response_size)
    }

    pub fn with_client(client: Client, target: Url, max_response_size: usize) -> Self {
        Self {
            client,
            target,
            max_response_size,
        }
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    pub fn max_response_size(&self) -> usize {
        self.max_response_size
    }

    /// Forward once; failures become a 502 error envelope.
    pub async fn forward(&self, request: &TunnelRequest) -> TunnelResponseMessage {
        match self.try_forward(request).await {
            Ok(response) => response.into(),
            Err(e) => TunnelErrorResponse::new(request.id.clone(), BAD_GATEWAY, e.to_string()).into(),
        }
    }

    async fn try_forward(&self, request: &TunnelRequest) -> Result<TunnelResponse, ForwardError> {
        let url = resolve(&self.target, &request.path)?;
        let method = Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| ForwardError::Upstream(e.to_string()))?;

        let mut builder = self
            .client
            .request(method, url)
            .headers(to_header_map(&request.headers));
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let mut response = builder
            .send()
            .await
            .map_err(|e| ForwardError::Upstream(describe(&e)))?;

        let limit = self.max_response_size;
        if let Some(declared) = response.content_length() {
            if declared > limit as u64 {
                return Err(ForwardError::Oversize {
                    size: declared,
                    limit,
                });
            }
        }

        let status = response.status().as_u16();
        let headers = from_header_map(response.headers());

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ForwardError::Upstream(describe(&e)))?
        {
            body.extend_from_slice(&chunk);
            if body.len() > limit {
                return Err(ForwardError::Oversize {
                    size: body.len() as u64,
                    limit,
                });
            }
        }

        let body = if body.is_empty() { None } else { Some(body) };
        Ok(TunnelResponse::new(request.id.clone(), status, headers, body))
    }
}

/// Join `path` onto the target's origin. The path can never change the host.
fn resolve(target: &Url, path: &str) -> Result<Url, ForwardError> {
    let origin = target.origin().ascii_serialization();
    Url::parse(&format!("{}{}", origin, path))
        .map_err(|e| ForwardError::Upstream(format!("invalid target url: {}", e)))
}

fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (k, v) in headers {
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
            map.append(name, value);
        }
    }
    map
}

/// Repeated headers are joined with ", ".
fn from_header_map(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in map {
        let value = String::from_utf8_lossy(value.as_bytes());
        headers
            .entry(name.as_str().to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.to_string());
    }
    headers
}

/// Error text including its source chain
fn describe(e: &reqwest::Error) -> String {
    let mut text = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !text.contains(&cause_text) {
            text.push_str(": ");
            text.push_str(&cause_text);
        }
        source = cause.source();
    }
    text
}
