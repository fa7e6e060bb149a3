// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Progress event decoding for pull streams.
//!
//! A pull produces a sequence of independently-decodable records. The
//! daemon emits them as newline-delimited JSON; the external CLI emits
//! human-readable status text. Both decode into the same [`ProgressEvent`]
//! so the consumer loop never cares where the lines came from.
//!
//! A line that fails to decode is skipped, never fatal: the daemon may
//! emit blank keep-alive lines or partial buffering artifacts, and the
//! stream continues past them.

use serde::Deserialize;

/// One decoded unit of a pull stream.
///
/// Ordering matters: events arrive in emission order and are processed in
/// that order. Distinct digests are distinct sub-transfers (models are
/// fetched as multiple content-addressed layers); their progress is never
/// merged into a single counter.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    /// Current status message.
    pub status: String,
    /// Digest of the layer being transferred, when applicable.
    pub digest: Option<String>,
    /// Completed size in bytes, when applicable.
    pub completed: Option<u64>,
    /// Total size in bytes, when applicable.
    pub total: Option<u64>,
}

/// Wire shape of one NDJSON record from the daemon.
///
/// `error` is folded into the status so terminal classification sees it;
/// a record carrying neither `status` nor `error` is not a record.
#[derive(Debug, Deserialize)]
struct WireRecord {
    status: Option<String>,
    error: Option<String>,
    digest: Option<String>,
    completed: Option<u64>,
    total: Option<u64>,
}

impl ProgressEvent {
    /// A state-only update with no numeric fields (e.g. "verifying checksum").
    pub fn status_only(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            digest: None,
            completed: None,
            total: None,
        }
    }

    /// Decode one NDJSON record. Returns `None` for lines that are not
    /// valid records; the caller skips them and keeps reading.
    pub fn from_json_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let record: WireRecord = serde_json::from_str(line).ok()?;
        let status = match (record.status, record.error) {
            (Some(status), _) => status,
            (None, Some(error)) => format!("error: {}", error),
            (None, None) => return None,
        };

        Some(Self {
            status,
            digest: record.digest,
            completed: record.completed,
            total: record.total,
        })
    }

    /// Wrap one human-readable line (subprocess source) as a state-only
    /// event. Blank lines are skipped.
    pub fn from_text_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            None
        } else {
            Some(Self::status_only(line))
        }
    }

    /// Download progress as a percentage (0-100).
    ///
    /// Defined only when both counters are present and `total > 0`; no
    /// percentage is fabricated from partial data.
    pub fn percentage(&self) -> Option<f64> {
        match (self.total, self.completed) {
            (Some(total), Some(completed)) if total > 0 => {
                Some((completed as f64 / total as f64) * 100.0)
            }
            _ => None,
        }
    }

    /// Whether the status names an error condition.
    pub fn is_error(&self) -> bool {
        self.status.to_ascii_lowercase().contains("error")
    }
}

/// Decoding applied to each raw line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFormat {
    /// Newline-delimited JSON records (daemon pull endpoint).
    Json,
    /// Unstructured status text (external CLI output).
    Text,
}

/// Lazy adapter from raw lines to progress events.
///
/// Not restartable. Undecodable lines are skipped; an I/O error on the
/// underlying source ends the iteration and is held for the consumer to
/// inspect via [`ProgressLines::take_io_error`].
pub struct ProgressLines<I> {
    lines: I,
    format: LineFormat,
    io_error: Option<std::io::Error>,
    last_status: Option<String>,
}

impl<I> ProgressLines<I>
where
    I: Iterator<Item = std::io::Result<String>>,
{
    pub fn new(lines: I, format: LineFormat) -> Self {
        Self {
            lines,
            format,
            io_error: None,
            last_status: None,
        }
    }

    /// The status of the most recent decoded event, used for terminal
    /// classification after the stream closes.
    pub fn last_status(&self) -> Option<&str> {
        self.last_status.as_deref()
    }

    /// Take the I/O error that ended the stream, if any.
    pub fn take_io_error(&mut self) -> Option<std::io::Error> {
        self.io_error.take()
    }
}

impl<I> Iterator for ProgressLines<I>
where
    I: Iterator<Item = std::io::Result<String>>,
{
    type Item = ProgressEvent;

    fn next(&mut self) -> Option<ProgressEvent> {
        if self.io_error.is_some() {
            return None;
        }

        loop {
            match self.lines.next() {
                None => return None,
                Some(Err(e)) => {
                    self.io_error = Some(e);
                    return None;
                }
                Some(Ok(line)) => {
                    let decoded = match self.format {
                        LineFormat::Json => ProgressEvent::from_json_line(&line),
                        LineFormat::Text => ProgressEvent::from_text_line(&line),
                    };
                    if let Some(event) = decoded {
                        self.last_status = Some(event.status.clone());
                        return Some(event);
                    }
                    // not a record: skip and keep reading
                }
            }
        }
    }
}
