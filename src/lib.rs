// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Core of a shared-storage lock manager.
//!
//! Two coupled algorithms and the runtime that binds them:
//! - [`delta`]: the delta lease engine, a per-host heartbeat lease used to prove liveness and
//!   claim a `host_id` slot in a lockspace.
//! - [`paxos`]: the disk-Paxos resource lease engine, electing a single (or shared-mode)
//!   owner for a named resource using the delta lease as a proof-of-life oracle.
//! - [`runtime`]: the scheduling, ordering, and fencing glue that drives both engines and
//!   kills local clients whose lockspace heartbeat cannot be sustained.
//!
//! Everything outside these modules (CLI parsing, daemonization, the client wire protocol,
//! foreign-language bindings) is a collaborator of this crate, not part of it. The
//! collaborator contract is the public surface of [`runtime::Runtime`] plus the request/
//! response types in this module.

pub mod codec;
pub mod config;
pub mod delta;
pub mod disk;
pub mod error;
pub mod logdump;
pub mod paxos;
pub mod supervisor;
pub mod token;
pub mod watchdog;

mod lockspace;
mod runtime;

pub use error::{Error, Result};
pub use lockspace::{Lockspace, LockspaceId, LockspaceState};
pub use runtime::Runtime;

/// A host's slot index within a lockspace, `1..=max_hosts`. `0` is never a valid host_id.
pub type HostId = u32;

/// Monotonic counter bumped each time a host re-acquires its delta lease slot, or each time
/// a resource's ownership is newly committed by a ballot.
pub type Generation = u64;

/// Paxos round number for a resource lease. Strictly increasing across successful ballots.
pub type Lver = u64;

/// A monotonic timestamp, in milliseconds, as read from [`time::monotime`]. `0` is reserved
/// to mean "free" ([`LEASE_FREE`]).
pub type Timestamp = u64;

/// Opaque handle identifying one held resource lease in memory.
pub type TokenId = u64;

/// `timestamp == LEASE_FREE` on a leader record or host slot means the lease is unowned.
pub const LEASE_FREE: Timestamp = 0;

/// Maximum number of host_id slots in a lockspace. Mirrors `SANLK_MAX_HOSTS` in scope/name
/// though the value is not required to match any existing on-disk deployment for this crate
/// to be correct in isolation.
pub const MAX_HOSTS: u32 = 2000;

/// Maximum number of resource tokens a single client (pid) may hold at once.
pub const MAX_RESOURCES_PER_CLIENT: usize = 8;

pub mod time {
    //! Monotonic clock abstraction.
    //!
    //! All lease timing (renewal deadlines, owner-liveness probing) is expressed in
    //! milliseconds since an arbitrary epoch fixed at process start, never wall-clock time,
    //! so that clock adjustments cannot be mistaken for a live or dead host.
    use std::time::Instant;

    use crate::Timestamp;

    /// Returns the current monotonic time in milliseconds since this process started.
    ///
    /// Two hosts never compare their `monotime()` values against each other directly; each
    /// host only compares its own successive reads of a *disk-resident* timestamp written by
    /// another host, so clock drift between hosts is irrelevant to correctness.
    pub fn monotime() -> Timestamp {
        static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let start = START.get_or_init(Instant::now);
        start.elapsed().as_millis() as Timestamp
    }
}
