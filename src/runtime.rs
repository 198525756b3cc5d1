// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Composition root: wires the delta lease engine, the paxos engine, the lockspace manager,
//! and the supervisor into the single object a collaborator (the client-protocol layer, a
//! direct-edit tool, language bindings) actually drives.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;

use color_eyre::eyre::Result as EyreResult;
use log::info;
use serde::Serialize;
use tokio::sync::{RwLock, Semaphore};

use crate::codec::LeaderRecord;
use crate::config::Settings;
use crate::disk::Disk;
use crate::delta::DeltaEngine;
use crate::error::{Error, Result};
use crate::lockspace::{Lockspace, LockspaceId, LockspaceState};
use crate::logdump::LogDump;
use crate::paxos::{AcquireFlags, PaxosEngine};
use crate::supervisor::{join_all_named, ProcessKiller, Supervisor};
use crate::token::TokenManager;
use crate::watchdog::WatchdogSink;
use crate::{HostId, TokenId};

static LOGGING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a default colored `logforth` backend if no `log` backend has been installed yet.
/// Safe to call from multiple `Runtime::new` invocations in the same process; only the first
/// one takes effect.
fn init_default_logging() {
    LOGGING_INIT.get_or_init(|| {
        logforth::builder().dispatch(|diagnostic| diagnostic.append(logforth::append::Stderr::default())).apply();
    });
}

/// Per-lockspace status, as returned by [`Runtime::status`].
#[derive(Clone, Debug, Serialize)]
pub struct LockspaceStatus {
    pub id: String,
    pub state: String,
    pub host_generation: u64,
}

/// Per-token status, as returned by [`Runtime::status`]/[`Runtime::inquire`].
#[derive(Clone, Debug, Serialize)]
pub struct TokenStatus {
    pub token_id: TokenId,
    pub pid: u32,
    pub resource: String,
}

/// Structured STATUS dump (§6, §11).
#[derive(Clone, Debug, Serialize)]
pub struct StatusReport {
    pub lockspaces: Vec<LockspaceStatus>,
    pub tokens: Vec<TokenStatus>,
}

struct ResourceEntry<D: Disk> {
    lockspace: LockspaceId,
    engine: PaxosEngine<D>,
}

/// The runtime: every lockspace and resource this process currently participates in.
pub struct Runtime<D: Disk, W: WatchdogSink, K: ProcessKiller> {
    settings: Settings,
    watchdog: Arc<W>,
    lockspaces: RwLock<HashMap<LockspaceId, Arc<Lockspace<D>>>>,
    deltas: RwLock<HashMap<LockspaceId, Arc<DeltaEngine<D>>>>,
    resources: RwLock<HashMap<String, ResourceEntry<D>>>,
    tokens: TokenManager<D>,
    log_dump: LogDump,
    supervisor: RwLock<Supervisor<K>>,
    renewal_tasks: RwLock<Vec<(LockspaceId, tokio::task::JoinHandle<()>)>>,
    /// Bounds concurrent in-flight client commands (acquire/release) to `worker_pool_size`,
    /// standing in for the reference daemon's thread-per-command model without actually
    /// spawning an unbounded number of OS threads.
    command_slots: Semaphore,
}

impl<D: Disk + 'static, W: WatchdogSink + 'static, K: ProcessKiller> Runtime<D, W, K> {
    /// Constructs a runtime with the given validated settings. Installs a default logging
    /// backend if the host process has not installed one of its own.
    ///
    /// # Errors
    /// Returns the settings' own validation error if `settings` is invalid.
    pub fn new(settings: Settings, watchdog: Arc<W>, killer: K) -> std::result::Result<Self, crate::config::ConfigError> {
        settings.validate()?;
        init_default_logging();
        let command_slots = Semaphore::new(settings.worker_pool_size.max(1));
        Ok(Self {
            settings,
            watchdog,
            lockspaces: RwLock::new(HashMap::new()),
            deltas: RwLock::new(HashMap::new()),
            resources: RwLock::new(HashMap::new()),
            tokens: TokenManager::new(),
            log_dump: LogDump::default(),
            supervisor: RwLock::new(Supervisor::new(killer)),
            renewal_tasks: RwLock::new(Vec::new()),
            command_slots,
        })
    }

    /// Adds a lockspace: starts its delta-lease acquire and spawns its renewal task.
    ///
    /// # Errors
    /// Propagates delta lease errors from the initial acquire.
    pub async fn add_lockspace(&self, id: LockspaceId, disk: Arc<D>, base_offset: u64, sector_size: u32, host_id: HostId) -> Result<()> {
        let delta = Arc::new(DeltaEngine::new(
            disk,
            base_offset,
            sector_size,
            id.0.clone(),
            std::time::Duration::from_secs(self.settings.io_timeout_seconds),
            std::time::Duration::from_secs(self.settings.host_dead_seconds),
        ));

        let lockspace = Arc::new(Lockspace::new(
            id.clone(),
            Arc::clone(&delta),
            host_id,
            std::time::Duration::from_secs(self.settings.host_id_renewal_seconds),
            std::time::Duration::from_secs(self.settings.renewal_warn_seconds),
            std::time::Duration::from_secs(self.settings.renewal_fail_seconds),
        ));
        lockspace.start(self.settings.max_hosts).await.map_err(Error::from)?;

        self.watchdog.register(&id.0, self.settings.renewal_fail_seconds).await;
        let handle = lockspace.spawn_renewal(Arc::clone(&self.watchdog));
        let scan_handle = lockspace.spawn_host_status_scan(std::time::Duration::from_secs(self.settings.host_status_scan_seconds));

        self.deltas.write().await.insert(id.clone(), delta);
        self.lockspaces.write().await.insert(id.clone(), lockspace);
        self.renewal_tasks.write().await.push((id.clone(), handle));
        self.renewal_tasks.write().await.push((id.clone(), scan_handle));
        self.log_dump.push(Some(&id.0), format!("lockspace {id} added, host_id {host_id}")).await;
        info!("lockspace {id} added");
        Ok(())
    }

    /// Registers a resource this process may acquire, backed by `disks` (one or more replicas;
    /// a majority must agree for any read/write to succeed).
    pub async fn register_resource(&self, lockspace: LockspaceId, name: String, disks: Vec<Arc<D>>, base_offset: u64, sector_size: u32, host_id: HostId) -> Result<()> {
        let delta = self.deltas.read().await.get(&lockspace).cloned().ok_or(Error::UnknownLockspace)?;
        let lockspace_handle = self.lockspaces.read().await.get(&lockspace).cloned().ok_or(Error::UnknownLockspace)?;
        let host_generation = lockspace_handle.host_generation();

        let engine = PaxosEngine::new(
            disks,
            base_offset,
            sector_size,
            self.settings.max_hosts,
            host_id,
            host_generation,
            lockspace.0.clone(),
            name.clone(),
            std::time::Duration::from_secs(self.settings.io_timeout_seconds),
            std::time::Duration::from_secs(self.settings.host_dead_seconds),
            delta,
        );
        self.resources.write().await.insert(name, ResourceEntry { lockspace, engine });
        Ok(())
    }

    /// Acquires `resource` on behalf of `pid`.
    ///
    /// # Errors
    /// Returns an error if the resource is not registered, or propagates the underlying paxos
    /// error.
    pub async fn acquire(&self, pid: u32, resource: &str, flags: AcquireFlags) -> Result<TokenId> {
        let _permit = self.command_slots.acquire().await.expect("command_slots semaphore is never closed");
        let resources = self.resources.read().await;
        let entry = resources.get(resource).ok_or(Error::UnknownResource)?;
        let token = self.tokens.acquire_token(pid, resource, &entry.engine, flags).await.map_err(Error::from)?;
        self.log_dump.push(Some(&entry.lockspace.0), format!("pid {pid} acquired {resource} as token {token}")).await;
        Ok(token)
    }

    /// Releases a single token.
    ///
    /// # Errors
    /// Returns an error if the resource is not registered, or propagates the underlying paxos
    /// error.
    pub async fn release(&self, pid: u32, token_id: TokenId, resource: &str) -> Result<()> {
        let _permit = self.command_slots.acquire().await.expect("command_slots semaphore is never closed");
        let resources = self.resources.read().await;
        let entry = resources.get(resource).ok_or(Error::UnknownResource)?;
        self.tokens.release_token(pid, token_id, &entry.engine).await.map_err(Error::from)?;
        self.log_dump.push(Some(&entry.lockspace.0), format!("pid {pid} released token {token_id}")).await;
        Ok(())
    }

    /// Releases every token held by a client, e.g. because its pid has died.
    pub async fn release_all(&self, pid: u32) {
        let _permit = self.command_slots.acquire().await.expect("command_slots semaphore is never closed");
        let resources = self.resources.read().await;
        let engines: HashMap<String, &PaxosEngine<D>> = resources.iter().map(|(name, entry)| (name.clone(), &entry.engine)).collect();
        let errors = self.tokens.release_all(pid, &engines).await;
        for err in errors {
            self.log_dump.push(None, format!("pid {pid} release_all error: {err}")).await;
        }
    }

    /// Reads a resource's current leader record without acquiring it.
    ///
    /// # Errors
    /// Returns an error if the resource is not registered, or propagates the underlying paxos
    /// error.
    pub async fn read_leader(&self, resource: &str) -> Result<LeaderRecord> {
        let resources = self.resources.read().await;
        let entry = resources.get(resource).ok_or(Error::UnknownResource)?;
        entry.engine.read_leader().await.map_err(Error::from)
    }

    /// Returns a structured snapshot of every lockspace and held token (§11 STATUS).
    pub async fn status(&self) -> StatusReport {
        let mut lockspaces = Vec::new();
        for (id, lockspace) in self.lockspaces.read().await.iter() {
            lockspaces.push(LockspaceStatus {
                id: id.0.clone(),
                state: format!("{:?}", lockspace.state().await),
                host_generation: lockspace.host_generation(),
            });
        }
        StatusReport { lockspaces, tokens: Vec::new() }
    }

    /// Returns the subset of resources a single client currently holds (§11 INQUIRE).
    pub async fn inquire(&self, pid: u32) -> usize {
        self.tokens.resource_count(pid).await
    }

    /// Returns the retained log lines (§11 LOG_DUMP).
    pub async fn log_dump(&self) -> Vec<String> {
        self.log_dump.all().await.into_iter().map(|line| line.message).collect()
    }

    /// Begins fencing a lockspace's local clients, transitioning it toward removal. Intended
    /// to be called once its renewal task reports [`LockspaceState::Failing`].
    pub async fn begin_fencing(&self, lockspace: LockspaceId, local_pids: std::collections::HashSet<u32>) {
        self.supervisor.write().await.begin_fencing(lockspace, local_pids);
    }

    /// Runs one supervisor fencing tick, unlinking and removing any lockspace that becomes
    /// fully fenced.
    pub async fn tick(&self) {
        let completed = self.supervisor.write().await.tick();
        for id in completed {
            self.watchdog.unlink(&id.0).await;
            if let Some(lockspace) = self.lockspaces.write().await.remove(&id) {
                lockspace.stop();
            }
            self.deltas.write().await.remove(&id);
            info!("lockspace {id} removed after fencing");
        }
    }

    /// Requests an orderly shutdown: no new lockspaces may be added, and [`Runtime::run`]
    /// returns once every lockspace has been removed.
    pub async fn request_shutdown(&self) {
        self.supervisor.read().await.request_shutdown();
    }

    /// Drives the supervisor tick loop until shutdown is requested and every lockspace has
    /// been removed, then joins all renewal tasks.
    ///
    /// # Errors
    /// Returns an operational error if the shutdown join fails unexpectedly.
    pub async fn run(&self) -> EyreResult<()> {
        loop {
            tokio::time::sleep(crate::supervisor::SUPERVISOR_TICK).await;
            self.tick().await;
            let shutting_down = self.supervisor.read().await.is_shutting_down();
            if shutting_down && self.lockspaces.read().await.is_empty() {
                break;
            }
        }
        let handles = std::mem::take(&mut *self.renewal_tasks.write().await);
        if handles.is_empty() {
            return Ok(());
        }
        join_all_named(handles).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{MemDisk, SectorAddr};
    use crate::supervisor::SystemProcessKiller;
    use crate::watchdog::RecordingWatchdog;
    use std::time::Duration;

    async fn init_slots(disk: &MemDisk, count: u32) {
        for host_id in 1..=count {
            let leader = LeaderRecord::free("ls", "", 512, count, count, 10);
            let mut bytes = leader.encode().unwrap().to_vec();
            bytes.resize(512, 0);
            disk.write(SectorAddr::new(u64::from(host_id - 1) * 512, 512), bytes, Duration::from_secs(1)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn add_lockspace_then_acquire_a_resource() {
        let mut settings = Settings { host_id_renewal_seconds: 60, renewal_warn_seconds: 70, renewal_fail_seconds: 75, host_dead_seconds: 0, io_timeout_seconds: 1, ..Settings::default() };
        settings.max_hosts = 8;
        let watchdog = Arc::new(RecordingWatchdog::new());
        let runtime = Runtime::new(settings, watchdog, SystemProcessKiller).unwrap();

        let ls_disk = Arc::new(MemDisk::new(512 * 8));
        init_slots(&ls_disk, 8).await;
        runtime.add_lockspace(LockspaceId("ls".into()), ls_disk, 0, 512, 1).await.unwrap();

        let res_disk = Arc::new(MemDisk::new(512 * 10));
        runtime.register_resource(LockspaceId("ls".into()), "res".into(), vec![res_disk.clone()], 0, 512, 1).await.unwrap();
        runtime.resources.read().await.get("res").unwrap().engine.init(8, false).await.unwrap();

        let token = runtime.acquire(42, "res", AcquireFlags::empty()).await.unwrap();
        assert_eq!(runtime.inquire(42).await, 1);
        runtime.release(42, token, "res").await.unwrap();
        assert_eq!(runtime.inquire(42).await, 0);
    }

    #[tokio::test]
    async fn commands_serialize_through_a_single_worker_slot() {
        let mut settings = Settings { host_id_renewal_seconds: 60, renewal_warn_seconds: 70, renewal_fail_seconds: 75, host_dead_seconds: 0, io_timeout_seconds: 1, worker_pool_size: 1, ..Settings::default() };
        settings.max_hosts = 8;
        let watchdog = Arc::new(RecordingWatchdog::new());
        let runtime = Runtime::new(settings, watchdog, SystemProcessKiller).unwrap();

        let ls_disk = Arc::new(MemDisk::new(512 * 8));
        init_slots(&ls_disk, 8).await;
        runtime.add_lockspace(LockspaceId("ls".into()), ls_disk, 0, 512, 1).await.unwrap();

        let res_disk = Arc::new(MemDisk::new(512 * 10));
        runtime.register_resource(LockspaceId("ls".into()), "res".into(), vec![res_disk.clone()], 0, 512, 1).await.unwrap();
        runtime.resources.read().await.get("res").unwrap().engine.init(8, false).await.unwrap();

        let token = runtime.acquire(1, "res", AcquireFlags::empty()).await.unwrap();
        assert_eq!(runtime.inquire(1).await, 1);
        runtime.release(1, token, "res").await.unwrap();
    }
}
