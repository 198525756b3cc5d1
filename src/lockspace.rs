// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Lockspace manager: one renewal task per lockspace, and the lifecycle state machine that
//! couples delta-lease renewal to watchdog fencing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::delta::{DeltaEngine, DeltaError};
use crate::disk::Disk;
use crate::time::monotime;
use crate::watchdog::WatchdogSink;
use crate::{Generation, HostId, Timestamp};

/// Opaque identifier for one lockspace within a [`crate::Runtime`].
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct LockspaceId(pub String);

impl std::fmt::Display for LockspaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The lockspace renewal state machine (§4.5). `Failing` is the trigger for fencing: the
/// supervisor must kill every local client of this lockspace before `host_dead_seconds`
/// elapses, or the watchdog will reset the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockspaceState {
    Starting,
    Running,
    Failing,
    Stopped,
}

struct Inner<D: Disk> {
    state: RwLock<LockspaceState>,
    delta: Arc<DeltaEngine<D>>,
    host_id: HostId,
    host_generation: AtomicU64,
    renewal_interval: Duration,
    renewal_warn: Duration,
    renewal_fail: Duration,
    last_renewal_success: RwLock<Option<Timestamp>>,
    max_hosts: AtomicU64,
}

/// One lockspace: its delta lease engine, renewal task, and lifecycle state.
pub struct Lockspace<D: Disk> {
    id: LockspaceId,
    inner: Arc<Inner<D>>,
    cancel: CancellationToken,
}

impl<D: Disk + 'static> Lockspace<D> {
    #[must_use]
    pub fn new(id: LockspaceId, delta: Arc<DeltaEngine<D>>, host_id: HostId, renewal_interval: Duration, renewal_warn: Duration, renewal_fail: Duration) -> Self {
        Self {
            id,
            inner: Arc::new(Inner {
                state: RwLock::new(LockspaceState::Starting),
                delta,
                host_id,
                host_generation: AtomicU64::new(0),
                renewal_interval,
                renewal_warn,
                renewal_fail,
                last_renewal_success: RwLock::new(None),
                max_hosts: AtomicU64::new(0),
            }),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &LockspaceId {
        &self.id
    }

    pub async fn state(&self) -> LockspaceState {
        *self.inner.state.read().await
    }

    #[must_use]
    pub fn host_generation(&self) -> Generation {
        self.inner.host_generation.load(Ordering::Acquire)
    }

    /// Runs delta-lease acquire, transitioning `Starting → Running` on success.
    ///
    /// # Errors
    /// Propagates delta lease errors without transitioning state.
    pub async fn start(&self, max_hosts: u32) -> Result<(), DeltaError> {
        let leader = self.inner.delta.acquire(self.inner.host_id, max_hosts).await?;
        self.inner.host_generation.store(leader.owner_generation, Ordering::Release);
        self.inner.max_hosts.store(u64::from(max_hosts), Ordering::Release);
        *self.inner.state.write().await = LockspaceState::Running;
        info!("lockspace {} started, host_id {} generation {}", self.id, self.inner.host_id, leader.owner_generation);
        Ok(())
    }

    /// Spawns the per-lockspace renewal loop. The loop pets `watchdog` after each successful
    /// renewal and transitions `Running → Failing` if renewals fail for longer than
    /// `renewal_fail_seconds`.
    pub fn spawn_renewal<W: WatchdogSink + 'static>(&self, watchdog: Arc<W>) -> tokio::task::JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.renewal_interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let generation = inner.host_generation.load(Ordering::Acquire);
                match inner.delta.renew(inner.host_id, generation).await {
                    Ok(_) => {
                        let now = monotime();
                        *inner.last_renewal_success.write().await = Some(now);
                        watchdog.pet(&id.0, now).await;
                        if *inner.state.read().await == LockspaceState::Failing {
                            *inner.state.write().await = LockspaceState::Running;
                            info!("lockspace {id} recovered, renewal succeeding again");
                        }
                    }
                    Err(err) => {
                        warn!("lockspace {id} renewal failed: {err}");
                        let last_success = *inner.last_renewal_success.read().await;
                        let stalled_for = last_success.map_or(inner.renewal_fail, |t| Duration::from_millis(monotime().saturating_sub(t)));
                        if stalled_for >= inner.renewal_warn && stalled_for < inner.renewal_fail {
                            warn!("lockspace {id} renewal has not succeeded in {stalled_for:?}");
                        }
                        if stalled_for >= inner.renewal_fail {
                            error!("lockspace {id} renewal failed for {stalled_for:?}, entering Failing");
                            *inner.state.write().await = LockspaceState::Failing;
                        }
                    }
                }
            }
            *inner.state.write().await = LockspaceState::Stopped;
        })
    }

    /// Spawns a periodic scan of every host slot in this lockspace's delta lease array (§4.5),
    /// refreshing the [`crate::delta::HostStatus`] oracle for hosts beyond the one this process
    /// owns. Runs on its own interval, independent of the renewal loop.
    pub fn spawn_host_status_scan(&self, scan_interval: Duration) -> tokio::task::JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scan_interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let max_hosts = inner.max_hosts.load(Ordering::Acquire) as u32;
                for host_id in 1..=max_hosts {
                    if let Err(err) = inner.delta.read(host_id).await {
                        warn!("lockspace {id} host-status scan of host_id {host_id} failed: {err}");
                    }
                }
            }
        })
    }

    /// Cancels the renewal loop. Does not itself release the delta lease; the caller (the
    /// runtime's lockspace-removal path) does that once it's confirmed no client still holds
    /// resources in this lockspace.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemDisk;
    use std::sync::Arc;

    async fn init_slots(disk: &MemDisk, count: u32) {
        for host_id in 1..=count {
            let leader = crate::codec::LeaderRecord::free("ls", "", 512, count, count, 10);
            let mut bytes = leader.encode().unwrap().to_vec();
            bytes.resize(512, 0);
            disk.write(crate::disk::SectorAddr::new(u64::from(host_id - 1) * 512, 512), bytes, Duration::from_secs(1)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn start_transitions_to_running() {
        let disk = Arc::new(MemDisk::new(512 * 8));
        init_slots(&disk, 8).await;
        let delta = Arc::new(DeltaEngine::new(disk, 0, 512, "ls".into(), Duration::from_millis(20), Duration::from_millis(10)));
        let lockspace = Lockspace::new(LockspaceId("ls".into()), delta, 1, Duration::from_millis(20), Duration::from_millis(40), Duration::from_millis(80));
        lockspace.start(8).await.unwrap();
        assert_eq!(lockspace.state().await, LockspaceState::Running);
    }

    #[tokio::test]
    async fn renewal_loop_pets_watchdog_on_success() {
        let disk = Arc::new(MemDisk::new(512 * 8));
        init_slots(&disk, 8).await;
        let delta = Arc::new(DeltaEngine::new(disk, 0, 512, "ls".into(), Duration::from_millis(20), Duration::from_millis(10)));
        let lockspace = Lockspace::new(LockspaceId("ls".into()), delta, 2, Duration::from_millis(10), Duration::from_millis(40), Duration::from_millis(80));
        lockspace.start(8).await.unwrap();
        let watchdog = Arc::new(crate::watchdog::RecordingWatchdog::new());
        let handle = lockspace.spawn_renewal(Arc::clone(&watchdog));
        tokio::time::sleep(Duration::from_millis(35)).await;
        lockspace.stop();
        let _ = handle.await;
        let events = watchdog.events.lock().await;
        assert!(events.iter().any(|e| e.starts_with("pet ls")));
    }

    #[tokio::test]
    async fn host_status_scan_observes_other_hosts_slots() {
        let disk = Arc::new(MemDisk::new(512 * 8));
        init_slots(&disk, 8).await;
        let delta = Arc::new(DeltaEngine::new(Arc::clone(&disk), 0, 512, "ls".into(), Duration::from_millis(20), Duration::from_millis(10)));
        let lockspace = Lockspace::new(LockspaceId("ls".into()), Arc::clone(&delta), 1, Duration::from_millis(20), Duration::from_millis(40), Duration::from_millis(80));
        lockspace.start(8).await.unwrap();

        assert!(delta.status(3).await.is_none());
        let handle = lockspace.spawn_host_status_scan(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        lockspace.stop();
        let _ = handle.await;

        assert!(delta.status(3).await.is_some());
    }
}
