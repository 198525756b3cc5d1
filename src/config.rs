// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration.
//!
//! [`Settings`] holds every tunable named in the timing and error-handling design: I/O
//! timeouts, renewal cadence, host count limits, and the watchdog socket path. A collaborator
//! loads it from a TOML file with [`Settings::from_toml_str`]/[`Settings::from_toml_file`] and
//! validates it with [`Settings::validate`] before constructing a [`crate::Runtime`].

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::MAX_HOSTS;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("renewal_warn_seconds must be less than renewal_fail_seconds")]
    WarnNotBeforeFail,
    #[error("max_hosts must be between 1 and {MAX_HOSTS}")]
    MaxHostsOutOfRange,
    #[error("io_timeout_seconds must be at least 1")]
    IoTimeoutTooSmall,
    #[error("host_id_renewal_seconds must be less than renewal_fail_seconds")]
    RenewalIntervalNotBeforeFail,
    #[error("failed to parse settings file")]
    Parse,
}

/// Every tunable the delta lease and paxos engines, the lockspace manager, and the supervisor
/// read from at construction time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Absolute deadline, in seconds, applied to a single disk I/O call.
    pub io_timeout_seconds: u64,
    /// How often a lockspace's renewal loop attempts to renew its delta lease.
    pub host_id_renewal_seconds: u64,
    /// Elapsed time since the last successful renewal after which a `warn`-level log fires.
    pub renewal_warn_seconds: u64,
    /// Elapsed time since the last successful renewal after which the lockspace enters
    /// `Failing` and fencing begins.
    pub renewal_fail_seconds: u64,
    /// Upper bound on time between renewals before a host's delta lease is assumed stale by
    /// other hosts. Defaults to `8 * io_timeout_seconds`.
    pub host_dead_seconds: u64,
    /// Maximum number of host_id slots per lockspace.
    pub max_hosts: u32,
    /// Number of worker tasks available for concurrent client commands (acquire/release/...).
    pub worker_pool_size: usize,
    /// Unix-domain socket path of the watchdog-multiplex daemon, if hardware fencing is in use.
    pub watchdog_socket_path: Option<String>,
    /// Interval, distinct from renewal, on which a lockspace scans every host slot to keep its
    /// host-status oracle fresh for hosts other than itself.
    pub host_status_scan_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let io_timeout_seconds = 10;
        Self {
            io_timeout_seconds,
            host_id_renewal_seconds: 20,
            renewal_warn_seconds: 60,
            renewal_fail_seconds: 80,
            host_dead_seconds: io_timeout_seconds * 8,
            max_hosts: 8,
            worker_pool_size: 8,
            watchdog_socket_path: None,
            host_status_scan_seconds: 10,
        }
    }
}

impl Settings {
    /// Parses settings from a TOML document, falling back to [`Settings::default`] for any
    /// field the document omits.
    ///
    /// # Errors
    /// Returns [`ConfigError::Parse`] if `contents` is not valid TOML for this shape.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|_| ConfigError::Parse)
    }

    /// Reads and parses settings from a TOML file on disk.
    ///
    /// # Errors
    /// Returns [`ConfigError::Parse`] if the file cannot be read or parsed.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|_| ConfigError::Parse)?;
        Self::from_toml_str(&contents)
    }

    /// Validates cross-field invariants that `serde`'s structural deserialization cannot
    /// express.
    ///
    /// # Errors
    /// Returns the first invariant violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.io_timeout_seconds < 1 {
            return Err(ConfigError::IoTimeoutTooSmall);
        }
        if self.renewal_warn_seconds >= self.renewal_fail_seconds {
            return Err(ConfigError::WarnNotBeforeFail);
        }
        if self.host_id_renewal_seconds >= self.renewal_fail_seconds {
            return Err(ConfigError::RenewalIntervalNotBeforeFail);
        }
        if self.max_hosts == 0 || self.max_hosts > MAX_HOSTS {
            return Err(ConfigError::MaxHostsOutOfRange);
        }
        Ok(())
    }
}
