// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lock helpers that recover from poisoning instead of panicking.
//!
//! The per-model pull gate is a plain `Mutex`; if a thread panics while
//! holding it the lock is poisoned. For the gate, stale state is harmless
//! (the guard protects a transfer already abandoned by the panicking
//! thread), so we log the event and recover the guard rather than take the
//! whole process down.

use std::sync::{Mutex, MutexGuard};

/// Acquire a mutex, recovering from poisoning if necessary.
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "locks",
                event = "LOCK_POISONED",
                "Mutex was poisoned during acquisition. Recovering the guard. \
                 A thread previously panicked while holding this lock."
            );
            poisoned.into_inner()
        }
    }
}
