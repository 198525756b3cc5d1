// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Bounded in-memory log ring buffer backing the `LOG_DUMP` client command.
//!
//! Mirrors the reference daemon's own `log_dump` buffer: a fixed-capacity ring of recent log
//! lines, tagged per lockspace, kept independent of whatever `log` backend is installed so a
//! collaborator can retrieve recent diagnostic history without a real IPC transport or log
//! file to tail.

use std::collections::VecDeque;

use tokio::sync::RwLock;

const DEFAULT_CAPACITY: usize = 1024;

/// One retained log line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogLine {
    pub lockspace: Option<String>,
    pub message: String,
}

/// Bounded ring buffer of recent log lines.
pub struct LogDump {
    capacity: usize,
    lines: RwLock<VecDeque<LogLine>>,
}

impl Default for LogDump {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LogDump {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { capacity, lines: RwLock::new(VecDeque::with_capacity(capacity)) }
    }

    /// Appends a line, evicting the oldest if the buffer is at capacity.
    pub async fn push(&self, lockspace: Option<&str>, message: impl Into<String>) {
        let mut lines = self.lines.write().await;
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(LogLine { lockspace: lockspace.map(str::to_string), message: message.into() });
    }

    /// Returns every retained line, oldest first.
    pub async fn all(&self) -> Vec<LogLine> {
        self.lines.read().await.iter().cloned().collect()
    }

    /// Returns every retained line tagged with `lockspace`, oldest first.
    pub async fn for_lockspace(&self, lockspace: &str) -> Vec<LogLine> {
        self.lines.read().await.iter().filter(|line| line.lockspace.as_deref() == Some(lockspace)).cloned().collect()
    }
}
