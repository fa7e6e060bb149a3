// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Availability probing with a bounded wait loop.
//!
//! A probe is a lightweight list call with a short per-call timeout,
//! independent of the overall wait budget. Status is derived fresh on
//! every call; nothing is persisted between invocations.

use std::thread;
use std::time::{Duration, Instant};

use crate::registry::RegistryClient;
use crate::transport::Transport;

/// Reachability of the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Reachable,
    Unreachable,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reachable => write!(f, "reachable"),
            Self::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Floor for the poll interval so the wait loop never spins.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default per-probe timeout. Deliberately short: a probe answers
/// "is anyone there", it does not fetch data of interest.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Polls the daemon until it is ready or a deadline elapses.
pub struct Prober<'a, T: Transport> {
    client: &'a RegistryClient<T>,
    probe_timeout: Duration,
}

impl<'a, T: Transport> Prober<'a, T> {
    pub fn new(client: &'a RegistryClient<T>) -> Self {
        Self {
            client,
            probe_timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// One probe attempt.
    pub fn probe(&self) -> ServiceStatus {
        match self.client.list_with_timeout(self.probe_timeout) {
            Ok(_) => ServiceStatus::Reachable,
            Err(e) => {
                tracing::debug!(error = %e, "probe failed");
                ServiceStatus::Unreachable
            }
        }
    }

    /// Probe repeatedly until the daemon answers or `max_wait` elapses.
    ///
    /// Always performs at least one probe, so `max_wait = 0` is a single
    /// attempt. Each probe is bounded by the short per-probe timeout; once
    /// the budget is spent the current attempt's failure is final and no
    /// further probe is started.
    pub fn wait_until_ready(&self, max_wait: Duration, poll_interval: Duration) -> ServiceStatus {
        let interval = poll_interval.max(MIN_POLL_INTERVAL);
        let start = Instant::now();

        loop {
            if self.probe() == ServiceStatus::Reachable {
                return ServiceStatus::Reachable;
            }
            if start.elapsed() >= max_wait {
                return ServiceStatus::Unreachable;
            }
            thread::sleep(interval);
        }
    }
}
