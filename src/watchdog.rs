// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Watchdog client: the fencing mechanism that makes reclaiming a dead owner's lease safe.
//!
//! A lockspace's renewal loop must "pet" a registered watchdog entry after every successful
//! delta-lease renewal. If it stops (because the host is partitioned, wedged, or its client
//! process is unkillable), the external watchdog-multiplex daemon lets the hardware watchdog
//! device fire, resetting the host within `host_dead_seconds`. This is what lets another host
//! safely run a ballot and declare the old owner's lease reclaimable: by the time any other
//! host could observe the owner as dead and commit a new owner, the old owner is guaranteed to
//! either still be petting its watchdog (and thus still alive and still the owner) or already
//! rebooted.
//!
//! This module only models the client side of that contract; the multiplex daemon and the
//! hardware device are out of scope (§1 Non-goals).

use async_trait::async_trait;

/// Sink for watchdog register/pet/unlink calls. Abstracted so tests use [`RecordingWatchdog`]
/// instead of a real daemon socket.
#[async_trait]
pub trait WatchdogSink: Send + Sync {
    /// Registers a new watchdog entry for `lockspace`, to be reset if not pet within
    /// `fail_seconds` of the last successful pet.
    async fn register(&self, lockspace: &str, fail_seconds: u64);

    /// Pets the entry for `lockspace`, recording that a delta-lease renewal just succeeded.
    async fn pet(&self, lockspace: &str, renewed_at_ms: u64);

    /// Removes the entry for `lockspace`, e.g. once all of its clients have been fenced.
    async fn unlink(&self, lockspace: &str);
}

/// No-op sink for deployments that intentionally run without hardware fencing. Using this
/// sink gives up the fencing guarantee entirely: a wedged renewal loop can coexist
/// indefinitely with a new owner elected by another host.
pub struct NullWatchdog;

#[async_trait]
impl WatchdogSink for NullWatchdog {
    async fn register(&self, _lockspace: &str, _fail_seconds: u64) {}
    async fn pet(&self, _lockspace: &str, _renewed_at_ms: u64) {}
    async fn unlink(&self, _lockspace: &str) {}
}

#[cfg(test)]
pub struct RecordingWatchdog {
    pub events: tokio::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl RecordingWatchdog {
    #[must_use]
    pub fn new() -> Self {
        Self { events: tokio::sync::Mutex::new(Vec::new()) }
    }
}

#[cfg(test)]
#[async_trait]
impl WatchdogSink for RecordingWatchdog {
    async fn register(&self, lockspace: &str, fail_seconds: u64) {
        self.events.lock().await.push(format!("register {lockspace} {fail_seconds}"));
    }

    async fn pet(&self, lockspace: &str, renewed_at_ms: u64) {
        self.events.lock().await.push(format!("pet {lockspace} {renewed_at_ms}"));
    }

    async fn unlink(&self, lockspace: &str) {
        self.events.lock().await.push(format!("unlink {lockspace}"));
    }
}
