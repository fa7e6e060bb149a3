// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared fixtures: scripted transports standing in for the daemon.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};
use stablehand::{Error, LineStream, Method, Transport};

/// In-memory daemon double.
///
/// Tracks an installed-model set, answers the four lifecycle endpoints,
/// and serves scripted pull streams. Counts calls so tests can assert how
/// many probes and transfers actually happened.
pub struct FakeDaemon {
    installed: Mutex<Vec<String>>,
    pull_lines: Mutex<Vec<String>>,
    line_delay: Option<Duration>,
    tags_calls: AtomicUsize,
    pull_calls: AtomicUsize,
}

impl FakeDaemon {
    pub fn new() -> Self {
        Self {
            installed: Mutex::new(Vec::new()),
            pull_lines: Mutex::new(Vec::new()),
            line_delay: None,
            tags_calls: AtomicUsize::new(0),
            pull_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_installed(self, names: &[&str]) -> Self {
        *self.installed.lock().unwrap() = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn with_pull_lines(self, lines: Vec<String>) -> Self {
        *self.pull_lines.lock().unwrap() = lines;
        self
    }

    /// Delay applied before each served pull line, to simulate a slow
    /// transfer for deadline and concurrency tests.
    pub fn with_line_delay(mut self, delay: Duration) -> Self {
        self.line_delay = Some(delay);
        self
    }

    pub fn installed(&self) -> Vec<String> {
        self.installed.lock().unwrap().clone()
    }

    pub fn tags_calls(&self) -> usize {
        self.tags_calls.load(Ordering::SeqCst)
    }

    pub fn pull_calls(&self) -> usize {
        self.pull_calls.load(Ordering::SeqCst)
    }
}

impl Transport for FakeDaemon {
    fn request(
        &self,
        _method: Method,
        path: &str,
        body: Option<&Value>,
        _timeout: Duration,
    ) -> stablehand::Result<Value> {
        let name = body
            .and_then(|b| b.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or_default()
            .to_string();

        match path {
            "/api/tags" => {
                self.tags_calls.fetch_add(1, Ordering::SeqCst);
                let models: Vec<Value> = self
                    .installed
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|n| json!({ "name": n }))
                    .collect();
                Ok(json!({ "models": models }))
            }
            "/api/show" => {
                if self.installed.lock().unwrap().iter().any(|n| *n == name) {
                    Ok(json!({ "size": 351000000u64, "digest": "sha256:feed" }))
                } else {
                    Err(Error::Remote {
                        status: 404,
                        body: format!("model '{}' not found", name),
                    })
                }
            }
            "/api/delete" => {
                let mut installed = self.installed.lock().unwrap();
                let before = installed.len();
                installed.retain(|n| *n != name);
                if installed.len() < before {
                    Ok(Value::Null)
                } else {
                    Err(Error::Remote {
                        status: 404,
                        body: format!("model '{}' not found", name),
                    })
                }
            }
            _ => Err(Error::Remote {
                status: 404,
                body: format!("no such endpoint: {}", path),
            }),
        }
    }

    fn stream(
        &self,
        _method: Method,
        path: &str,
        body: Option<&Value>,
        _timeout: Duration,
    ) -> stablehand::Result<LineStream> {
        assert_eq!(path, "/api/pull", "unexpected stream endpoint");
        self.pull_calls.fetch_add(1, Ordering::SeqCst);

        // The real daemon registers the model once the transfer completes;
        // registering up front is close enough for these tests.
        if let Some(name) = body.and_then(|b| b.get("name")).and_then(|n| n.as_str()) {
            self.installed.lock().unwrap().push(name.to_string());
        }

        let lines = self.pull_lines.lock().unwrap().clone();
        let delay = self.line_delay;
        Ok(Box::new(lines.into_iter().map(move |line| {
            if let Some(delay) = delay {
                std::thread::sleep(delay);
            }
            Ok(line)
        })))
    }
}

/// Transport answering every request with one canned result. Used where
/// the response shape itself is under test.
pub struct Scripted {
    response: stablehand::Result<Value>,
    calls: AtomicUsize,
}

impl Scripted {
    pub fn ok(value: Value) -> Self {
        Self {
            response: Ok(value),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn err(error: Error) -> Self {
        Self {
            response: Err(error),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transport for Scripted {
    fn request(
        &self,
        _method: Method,
        _path: &str,
        _body: Option<&Value>,
        _timeout: Duration,
    ) -> stablehand::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.response.clone()
    }

    fn stream(
        &self,
        _method: Method,
        _path: &str,
        _body: Option<&Value>,
        _timeout: Duration,
    ) -> stablehand::Result<LineStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.response {
            Ok(_) => Ok(Box::new(std::iter::empty::<std::io::Result<String>>())),
            Err(e) => Err(e.clone()),
        }
    }
}
