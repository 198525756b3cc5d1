// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Supervisor: the top-level fencing loop.
//!
//! When a lockspace's renewal task transitions to [`crate::LockspaceState::Failing`], it is
//! the supervisor's job to kill every local client still using that lockspace before
//! `host_dead_seconds` elapses, escalating signal strength across fixed-size ticks. Once every
//! client pid is gone, the lockspace's watchdog entry is unlinked and the lockspace is dropped
//! from the runtime.

use std::collections::{HashMap, HashSet};

use futures::stream::{FuturesUnordered, StreamExt};
use log::{error, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio_util::sync::CancellationToken;

use crate::lockspace::LockspaceId;

/// Number of ticks a lockspace's clients are sent `SIGTERM` before escalation.
pub const KILL_SIGTERM_ROUNDS: u32 = 2;
/// Number of additional ticks after the `SIGTERM` rounds during which clients are sent
/// `SIGKILL`, before the pid is abandoned.
pub const KILL_SIGKILL_AFTER_ROUNDS: u32 = 1;
/// Total tick count after which a still-alive pid is logged and abandoned rather than retried.
pub const KILL_ABANDON_AFTER_ROUNDS: u32 = 11;
/// Supervisor tick period.
pub const SUPERVISOR_TICK: std::time::Duration = std::time::Duration::from_secs(2);

/// Sends signals to, and checks liveness of, local client processes. Abstracted so tests do
/// not need to fork real processes.
pub trait ProcessKiller: Send + Sync {
    fn send_signal(&self, pid: u32, signal: Signal);
    fn is_alive(&self, pid: u32) -> bool;
}

/// Real process killer using POSIX signals.
pub struct SystemProcessKiller;

impl ProcessKiller for SystemProcessKiller {
    fn send_signal(&self, pid: u32, signal: Signal) {
        let _ = kill(Pid::from_raw(pid as i32), signal);
    }

    fn is_alive(&self, pid: u32) -> bool {
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }
}

/// Outcome of one fencing tick for a single lockspace.
#[derive(Debug, PartialEq, Eq)]
pub enum FenceOutcome {
    /// Clients remain; keep ticking.
    InProgress,
    /// Every tracked client pid is gone (or abandoned); safe to unlink the lockspace.
    Complete,
}

/// Top-level supervisor state: which lockspaces are being fenced, and how many ticks each has
/// been fenced for.
pub struct Supervisor<K: ProcessKiller> {
    killer: K,
    killing: HashMap<LockspaceId, (HashSet<u32>, u32)>,
    shutdown: CancellationToken,
}

impl<K: ProcessKiller> Supervisor<K> {
    #[must_use]
    pub fn new(killer: K) -> Self {
        Self { killer, killing: HashMap::new(), shutdown: CancellationToken::new() }
    }

    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Begins fencing `lockspace`: its registered clients (`pids`) will be signaled with
    /// escalating force on each subsequent [`Supervisor::tick`] call.
    pub fn begin_fencing(&mut self, lockspace: LockspaceId, pids: HashSet<u32>) {
        warn!("lockspace {lockspace} entering fencing with {} local clients", pids.len());
        self.killing.insert(lockspace, (pids, 0));
    }

    #[must_use]
    pub fn is_fencing(&self, lockspace: &LockspaceId) -> bool {
        self.killing.contains_key(lockspace)
    }

    /// Runs one fencing tick across every lockspace currently being fenced, returning the set
    /// of lockspaces that are now fully fenced (safe to unlink and remove).
    pub fn tick(&mut self) -> Vec<LockspaceId> {
        let mut completed = Vec::new();
        for (lockspace, (pids, round)) in &mut self.killing {
            *round += 1;
            pids.retain(|&pid| self.killer.is_alive(pid));

            if pids.is_empty() {
                info!("lockspace {lockspace} fully fenced after {round} ticks");
                completed.push(lockspace.clone());
                continue;
            }

            if *round <= KILL_SIGTERM_ROUNDS {
                for &pid in pids.iter() {
                    self.killer.send_signal(pid, Signal::SIGTERM);
                }
            } else if *round <= KILL_SIGTERM_ROUNDS + KILL_SIGKILL_AFTER_ROUNDS {
                for &pid in pids.iter() {
                    self.killer.send_signal(pid, Signal::SIGKILL);
                }
            } else if *round > KILL_ABANDON_AFTER_ROUNDS {
                error!("lockspace {lockspace} abandoning {} unkillable clients after {round} ticks", pids.len());
                completed.push(lockspace.clone());
            } else {
                for &pid in pids.iter() {
                    self.killer.send_signal(pid, Signal::SIGKILL);
                }
            }
        }
        for lockspace in &completed {
            self.killing.remove(lockspace);
        }
        completed
    }

    #[must_use]
    pub fn fencing_round(&self, lockspace: &LockspaceId) -> Option<u32> {
        self.killing.get(lockspace).map(|(_, round)| *round)
    }

    #[must_use]
    pub fn killer(&self) -> &K {
        &self.killer
    }
}

/// Awaits a set of named background tasks' completion, used for an orderly shutdown join
/// across every lockspace's renewal task.
pub async fn join_all_named(handles: Vec<(LockspaceId, tokio::task::JoinHandle<()>)>) {
    let mut pending: FuturesUnordered<_> = handles
        .into_iter()
        .map(|(id, handle)| async move {
            if let Err(err) = handle.await {
                error!("lockspace {id} renewal task panicked during shutdown: {err}");
            }
            id
        })
        .collect();
    while let Some(id) = pending.next().await {
        info!("lockspace {id} renewal task joined");
    }
}
