use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::Client as HttpClient;
use serde_json::Value;

use crate::config::HordeConfig;
use crate::error::{HordeError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct HttpReply {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

impl HttpReply {
    pub fn json(status: u16, body: &Value) -> Self {
        Self {
            status,
            body: serde_json::to_vec(body).unwrap_or_default(),
            content_type: Some("application/json".to_string()),
        }
    }

    pub fn bytes(status: u16, body: Vec<u8>, content_type: Option<&str>) -> Self {
        Self {
            status,
            body,
            content_type: content_type.map(str::to_string),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    pub fn parse_json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// HTTP seam. Non-2xx replies come back as `Ok`; only failures to obtain a
/// reply at all are errors.
pub trait Transport: Send + Sync {
    fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<HttpReply>;

    fn post_json(&self, url: &str, headers: &[(&str, &str)], body: &Value) -> Result<HttpReply>;
}

pub struct ReqwestTransport {
    http: HttpClient,
}

impl ReqwestTransport {
    pub fn new(config: &HordeConfig) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(config.request_timeout)
            .user_agent(config.client_agent.clone())
            .build()
            .map_err(|err| HordeError::Transport {
                url: config.api_base.clone(),
                message: format!("failed to build HTTP client: {err}"),
            })?;
        Ok(Self { http })
    }

    fn send(&self, url: &str, request: reqwest::blocking::RequestBuilder) -> Result<HttpReply> {
        let response = request.send().map_err(|err| transport_error(url, &err))?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .map_err(|err| transport_error(url, &err))?
            .to_vec();
        Ok(HttpReply {
            status,
            body,
            content_type,
        })
    }
}

impl Transport for ReqwestTransport {
    fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<HttpReply> {
        let mut request = self.http.get(url);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        self.send(url, request)
    }

    fn post_json(&self, url: &str, headers: &[(&str, &str)], body: &Value) -> Result<HttpReply> {
        let mut request = self.http.post(url).json(body);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        self.send(url, request)
    }
}

fn transport_error(url: &str, err: &reqwest::Error) -> HordeError {
    let message = if err.is_timeout() {
        format!("request timed out: {err}")
    } else if err.is_connect() {
        format!("connection failed: {err}")
    } else {
        err.to_string()
    };
    HordeError::Transport {
        url: url.to_string(),
        message,
    }
}

/// Time source for the poll loop, swapped for a virtual clock in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}
