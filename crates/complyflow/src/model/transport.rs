//! Wire access to the hosted model.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::TransportError;

/// One request to the model: an optional system preamble and a user prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub system: Option<String>,
    pub prompt: String,
}

impl ModelRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// Sends a request and returns the model's raw text.
pub trait ModelTransport: Send + Sync {
    fn send(&self, request: &ModelRequest) -> Result<String, TransportError>;
}

/// Settings for [`HttpTransport`].
#[derive(Debug)]
pub struct HttpTransportSettings {
    pub endpoint: String,
    pub model_id: String,
    pub api_key: Option<SecretString>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

/// Messages-style HTTP client for the hosted model.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    settings: HttpTransportSettings,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: [Message<'a>; 1],
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

impl HttpTransport {
    pub fn new(settings: HttpTransportSettings) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| TransportError::Connection(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, settings })
    }
}

/// Maps a non-success HTTP status to a transport error.
pub fn classify_status(status: u16, retry_after: Option<Duration>, body: String) -> TransportError {
    match status {
        429 => TransportError::Throttled { retry_after },
        408 | 504 => TransportError::Timeout,
        500..=599 => TransportError::Unavailable { status },
        _ => TransportError::Rejected { status, body },
    }
}

fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

impl ModelTransport for HttpTransport {
    fn send(&self, request: &ModelRequest) -> Result<String, TransportError> {
        let body = MessagesRequest {
            model: &self.settings.model_id,
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            system: request.system.as_deref(),
            messages: [Message {
                role: "user",
                content: &request.prompt,
            }],
        };

        let mut builder = self.client.post(&self.settings.endpoint).json(&body);
        if let Some(key) = &self.settings.api_key {
            builder = builder.header("x-api-key", key.expose_secret());
        }

        let response = builder.send().map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Connection(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers().get(reqwest::header::RETRY_AFTER));
            let body = response.text().unwrap_or_default();
            return Err(classify_status(status.as_u16(), retry_after, body));
        }

        let parsed: MessagesResponse = response
            .json()
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        let text: String = parsed
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");
        if text.trim().is_empty() {
            return Err(TransportError::Decode("empty response content".to_string()));
        }
        Ok(text)
    }
}
