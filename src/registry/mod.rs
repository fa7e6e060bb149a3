// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Registry client for the daemon's model API.
//!
//! Exposes the four lifecycle operations over any [`Transport`]:
//! list, show, delete, and pull. Results are structured values or typed
//! failures; a missing model on show/delete is a normal outcome carried in
//! the return type, not an error.
//!
//! The client never retries. A connection-level failure propagates
//! immediately; bounded retrying is the prober's job.
//!
//! # Example
//!
//! ```no_run
//! use stablehand::config::ManagerConfig;
//! use stablehand::registry::RegistryClient;
//! use stablehand::transport::HttpTransport;
//!
//! let config = ManagerConfig::default();
//! let transport = HttpTransport::new(&config.host, config.connect_timeout())?;
//! let registry = RegistryClient::new(transport, &config);
//!
//! for model in registry.list()? {
//!     println!("{}", model.name);
//! }
//! # Ok::<(), stablehand::Error>(())
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::progress::{LineFormat, ProgressEvent, ProgressLines};
use crate::pull::{classify_close, FailureCause, PullResult};
use crate::transport::{LineStream, Method, Transport};

/// One installed model as reported by the daemon.
///
/// A value type: produced by list/show, never cached by this crate.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelRecord {
    /// Model identifier (`family:tag`). Opaque; compared for equality only.
    pub name: String,
    /// Size in bytes.
    #[serde(default)]
    pub size: Option<u64>,
    /// Content digest.
    #[serde(default)]
    pub digest: Option<String>,
    /// Last modification time.
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
}

/// Envelope shape of `GET /api/tags`.
#[derive(Debug, Deserialize)]
struct TagsEnvelope {
    models: Vec<ModelRecord>,
}

/// Body shape of `POST /api/show` (name is not echoed back).
#[derive(Debug, Default, Deserialize)]
struct ShowBody {
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    digest: Option<String>,
    #[serde(default)]
    modified_at: Option<DateTime<Utc>>,
}

/// Outcome of a delete request.
///
/// Deleting an absent model reports `NotFound` rather than silent success,
/// so callers can distinguish "already gone" from "removed".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Client for the daemon's model lifecycle endpoints.
pub struct RegistryClient<T: Transport> {
    transport: T,
    request_timeout: Duration,
    pull_timeout: Duration,
}

impl<T: Transport> RegistryClient<T> {
    pub fn new(transport: T, config: &ManagerConfig) -> Self {
        Self {
            transport,
            request_timeout: config.request_timeout(),
            pull_timeout: config.pull_timeout(),
        }
    }

    /// List all installed models.
    ///
    /// A daemon that is reachable but has no models yields an empty vec,
    /// not an error. Both the `{"models": [...]}` envelope and a bare
    /// array response shape are accepted.
    pub fn list(&self) -> Result<Vec<ModelRecord>> {
        self.list_with_timeout(self.request_timeout)
    }

    /// List with an explicit per-call timeout. The prober uses this with a
    /// short timeout independent of its overall wait budget.
    pub(crate) fn list_with_timeout(&self, timeout: Duration) -> Result<Vec<ModelRecord>> {
        let value = self
            .transport
            .request(Method::Get, "/api/tags", None, timeout)?;
        Ok(decode_model_list(value))
    }

    /// Show details for one model. `None` is a normal outcome.
    pub fn show(&self, name: &str) -> Result<Option<ModelRecord>> {
        let body = json!({ "name": name });
        match self
            .transport
            .request(Method::Post, "/api/show", Some(&body), self.request_timeout)
        {
            Ok(value) => {
                let details: ShowBody = serde_json::from_value(value).unwrap_or_default();
                Ok(Some(ModelRecord {
                    name: name.to_string(),
                    size: details.size,
                    digest: details.digest,
                    modified_at: details.modified_at,
                }))
            }
            Err(Error::Remote { status: 404, .. }) => {
                tracing::debug!(model = name, "show: model not installed");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Whether `name` is installed. Identifiers compare by equality only.
    pub fn has_model(&self, name: &str) -> Result<bool> {
        Ok(self.list()?.iter().any(|m| m.name == name))
    }

    /// Delete an installed model.
    pub fn delete(&self, name: &str) -> Result<DeleteOutcome> {
        let body = json!({ "name": name });
        match self.transport.request(
            Method::Delete,
            "/api/delete",
            Some(&body),
            self.request_timeout,
        ) {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(Error::Remote { status: 404, .. }) => {
                tracing::debug!(model = name, "delete: model not installed");
                Ok(DeleteOutcome::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    /// Start a pull and return its lazy event stream.
    pub fn pull(&self, name: &str) -> Result<PullStream> {
        self.pull_with_timeout(name, self.pull_timeout)
    }

    /// Start a pull bounded by an explicit timeout covering the whole
    /// stream. The orchestrator passes its remaining deadline here so a
    /// stalled daemon cannot hold the operation past it.
    pub fn pull_with_timeout(&self, name: &str, timeout: Duration) -> Result<PullStream> {
        let body = json!({ "name": name, "stream": true });
        let lines = self
            .transport
            .stream(Method::Post, "/api/pull", Some(&body), timeout)?;
        Ok(PullStream::new(lines))
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

/// Lazy sequence of pull progress events, terminated by a [`PullResult`].
///
/// Drain the events (it is an `Iterator`), then call [`PullStream::finish`]
/// for the terminal outcome. Dropping the stream early releases the
/// underlying connection.
pub struct PullStream {
    events: ProgressLines<LineStream>,
}

impl PullStream {
    pub(crate) fn new(lines: LineStream) -> Self {
        Self {
            events: ProgressLines::new(lines, LineFormat::Json),
        }
    }

    /// Terminal outcome. Meaningful once the event sequence is exhausted.
    ///
    /// A stream that closes without an explicit success marker is a
    /// `Success` unless the last observed status named an error; a broken
    /// read maps to `Timeout` or a stream failure depending on its kind.
    pub fn finish(mut self) -> PullResult {
        if let Some(err) = self.events.take_io_error() {
            if err.kind() == std::io::ErrorKind::TimedOut
                || err.kind() == std::io::ErrorKind::WouldBlock
            {
                return PullResult::Failure(FailureCause::Timeout);
            }
            return PullResult::Failure(FailureCause::Stream(err.to_string()));
        }
        classify_close(self.events.last_status())
    }
}

impl Iterator for PullStream {
    type Item = ProgressEvent;

    fn next(&mut self) -> Option<ProgressEvent> {
        self.events.next()
    }
}

/// Decode the model list from either accepted response shape.
fn decode_model_list(value: Value) -> Vec<ModelRecord> {
    match value {
        Value::Array(_) => serde_json::from_value(value).unwrap_or_default(),
        Value::Object(_) => serde_json::from_value::<TagsEnvelope>(value)
            .map(|env| env.models)
            .unwrap_or_default(),
        // null (empty body) or anything else: reachable but empty
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_envelope_shape() {
        let value = json!({ "models": [{ "name": "qwen3:0.6b" }] });
        let models = decode_model_list(value);
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].name, "qwen3:0.6b");
        assert_eq!(models[0].size, None);
    }

    #[test]
    fn test_decode_bare_array_shape() {
        let value = json!([{ "name": "mistral:7b", "size": 4100000000u64 }]);
        let models = decode_model_list(value);
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].size, Some(4_100_000_000));
    }

    #[test]
    fn test_decode_empty_and_odd_shapes() {
        assert!(decode_model_list(json!({ "models": [] })).is_empty());
        assert!(decode_model_list(Value::Null).is_empty());
        assert!(decode_model_list(json!({ "unexpected": true })).is_empty());
        assert!(decode_model_list(json!("string")).is_empty());
    }

    #[test]
    fn test_decode_record_with_timestamp() {
        let value = json!({ "models": [{
            "name": "gemma2:2b",
            "digest": "sha256:cafe",
            "modified_at": "2025-06-01T12:00:00Z"
        }]});
        let models = decode_model_list(value);
        assert_eq!(models[0].digest.as_deref(), Some("sha256:cafe"));
        assert!(models[0].modified_at.is_some());
    }
}
