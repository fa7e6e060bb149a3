// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP transport for the daemon API.
//!
//! Two call shapes exist: [`Transport::request`] for plain request/response
//! calls whose body decodes as JSON, and [`Transport::stream`] for the
//! newline-delimited pull stream, returned as a lazy line iterator so the
//! body is read incrementally rather than buffered whole.
//!
//! The trait seam exists so tests can substitute a scripted transport;
//! production code uses [`HttpTransport`], a thin wrapper over a blocking
//! reqwest client.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use stablehand::transport::{HttpTransport, Method, Transport};
//!
//! let transport = HttpTransport::new("http://localhost:11434", Duration::from_secs(5))?;
//! let tags = transport.request(Method::Get, "/api/tags", None, Duration::from_secs(10))?;
//! println!("{}", tags);
//! # Ok::<(), stablehand::Error>(())
//! ```

use std::io::{BufRead, BufReader};
use std::time::Duration;

use serde_json::Value;

use crate::error::{Error, Result};

/// HTTP methods accepted by the daemon API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    /// Parse a method name.
    ///
    /// Anything outside the supported set fails with [`Error::InvalidMethod`]
    /// before any I/O happens.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "DELETE" => Ok(Self::Delete),
            _ => Err(Error::InvalidMethod(name.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lazy sequence of raw response lines.
pub type LineStream = Box<dyn Iterator<Item = std::io::Result<String>> + Send>;

/// Issues requests against the daemon.
pub trait Transport: Send + Sync {
    /// Non-streaming call. Decodes the response body as JSON; an empty body
    /// decodes as `null` (the delete endpoint answers 200 with no content).
    fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<Value>;

    /// Streaming call. Yields the raw response lines lazily; dropping the
    /// iterator releases the underlying connection.
    fn stream(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<LineStream>;
}

/// Production transport backed by a blocking reqwest client.
///
/// Every call carries its own timeout, applied to the whole request
/// including body reads, so a stalled stream surfaces as [`Error::Timeout`]
/// instead of hanging past the caller's deadline.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    /// Create a transport for the given daemon base URL.
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| Error::Io(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<reqwest::blocking::Response> {
        let url = format!("{}{}", self.base_url, path);

        let mut request = match method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Delete => self.client.delete(&url),
        };
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.timeout(timeout).send().map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(Error::Remote {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }
}

impl Transport for HttpTransport {
    fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let response = self.send(method, path, body, timeout)?;
        let text = response.text().map_err(classify)?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| Error::Io(format!("invalid response body: {}", e)))
    }

    fn stream(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<LineStream> {
        let response = self.send(method, path, body, timeout)?;
        Ok(Box::new(BufReader::new(response).lines()))
    }
}

/// Triage a reqwest error into the crate taxonomy.
fn classify(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else if e.is_connect() {
        Error::Connection(e.to_string())
    } else {
        // Request construction and mid-body failures without a clearer kind
        // still mean we could not talk to the daemon.
        Error::Connection(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parse() {
        assert_eq!(Method::parse("GET").unwrap(), Method::Get);
        assert_eq!(Method::parse("post").unwrap(), Method::Post);
        assert_eq!(Method::parse("Delete").unwrap(), Method::Delete);
    }

    #[test]
    fn test_method_parse_rejects_unsupported() {
        match Method::parse("PATCH") {
            Err(Error::InvalidMethod(m)) => assert_eq!(m, "PATCH"),
            other => panic!("expected InvalidMethod, got {:?}", other),
        }
        assert!(Method::parse("").is_err());
    }

    #[test]
    fn test_base_url_normalization() {
        let transport =
            HttpTransport::new("http://localhost:11434/", Duration::from_secs(1)).unwrap();
        assert_eq!(transport.base_url(), "http://localhost:11434");

        let transport =
            HttpTransport::new("http://localhost:11434", Duration::from_secs(1)).unwrap();
        assert_eq!(transport.base_url(), "http://localhost:11434");
    }
}
