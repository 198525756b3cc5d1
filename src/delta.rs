// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Delta lease engine: per-host heartbeat lease and the host-status liveness oracle.
//!
//! A delta lease is one sector in a lockspace's host_id array. A host owns the sector whose
//! index equals its `host_id`; renewing it proves the host is alive, and the paxos engine
//! (see [`crate::paxos`]) treats "has this host's delta timestamp advanced recently" as the
//! only trustworthy liveness signal when deciding whether to reclaim a resource from it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::codec::LeaderRecord;
use crate::disk::{Disk, DiskError, SectorAddr};
use crate::time::monotime;
use crate::{Generation, HostId, Timestamp, LEASE_FREE};

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DeltaError {
    #[error(transparent)]
    Disk(#[from] DiskError),
    #[error(transparent)]
    Codec(#[from] crate::codec::CodecError),
    #[error("slot is claimed by a host with a live delta lease")]
    OwnerLive,
    #[error("a conflicting host raced this acquire")]
    Raced,
    #[error("lease record does not show us as owner when renewing")]
    NotOwner,
}

impl DeltaError {
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            DeltaError::Disk(e) => e.code(),
            DeltaError::Codec(e) => e.code(),
            DeltaError::OwnerLive => -222,
            DeltaError::Raced => -223,
            DeltaError::NotOwner => -226,
        }
    }
}

/// What this host has observed about one slot in a lockspace's host_id array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostStatus {
    pub owner_id: HostId,
    pub owner_generation: Generation,
    pub timestamp: Timestamp,
    /// Local monotonic time of the most recent read of this slot.
    pub last_check: Timestamp,
    /// Local monotonic time at which `timestamp` was last observed to change.
    pub last_live: Timestamp,
}

impl HostStatus {
    #[must_use]
    fn observe(previous: Option<Self>, leader: &LeaderRecord, now: Timestamp) -> Self {
        let last_live = match previous {
            Some(p) if p.timestamp == leader.timestamp => p.last_live,
            _ => now,
        };
        Self {
            owner_id: leader.owner_id,
            owner_generation: leader.owner_generation,
            timestamp: leader.timestamp,
            last_check: now,
            last_live,
        }
    }
}

/// Delta lease engine for one lockspace's host_id array.
pub struct DeltaEngine<D: Disk> {
    disk: Arc<D>,
    sector_size: u32,
    base_offset: u64,
    space_name: String,
    io_timeout: Duration,
    host_dead_seconds: Duration,
    status: RwLock<BTreeMap<HostId, HostStatus>>,
}

impl<D: Disk> DeltaEngine<D> {
    #[must_use]
    pub fn new(disk: Arc<D>, base_offset: u64, sector_size: u32, space_name: String, io_timeout: Duration, host_dead_seconds: Duration) -> Self {
        Self { disk, sector_size, base_offset, space_name, io_timeout, host_dead_seconds, status: RwLock::new(BTreeMap::new()) }
    }

    fn slot_addr(&self, host_id: HostId) -> SectorAddr {
        let offset = self.base_offset + u64::from(host_id.saturating_sub(1)) * u64::from(self.sector_size);
        SectorAddr::new(offset, self.sector_size as usize)
    }

    /// Reads and decodes a host's slot, updating the host-status oracle.
    ///
    /// # Errors
    /// Propagates disk and codec errors.
    pub async fn read(&self, host_id: HostId) -> Result<LeaderRecord, DeltaError> {
        let bytes = self.disk.read(self.slot_addr(host_id), self.io_timeout).await?;
        let leader = LeaderRecord::decode(&bytes)?;
        let now = monotime();
        let mut status = self.status.write().await;
        let previous = status.get(&host_id).copied();
        status.insert(host_id, HostStatus::observe(previous, &leader, now));
        Ok(leader)
    }

    /// Returns the last-observed [`HostStatus`] for `host_id`, if this engine has ever read it.
    pub async fn status(&self, host_id: HostId) -> Option<HostStatus> {
        self.status.read().await.get(&host_id).copied()
    }

    /// Claims `host_id`'s slot for this host. Waits out a live owner; fails [`DeltaError::Raced`]
    /// if another host commits the slot concurrently.
    ///
    /// # Errors
    /// Returns [`DeltaError::OwnerLive`] if the slot remains claimed by a live owner after
    /// waiting `host_dead_seconds`, or [`DeltaError::Raced`] if a concurrent acquire wins.
    pub async fn acquire(&self, host_id: HostId, max_hosts: u32) -> Result<LeaderRecord, DeltaError> {
        let mut leader = self.read(host_id).await?;
        if leader.timestamp != LEASE_FREE {
            let observed_at = monotime();
            let (initial_owner, initial_gen, initial_ts) = (leader.owner_id, leader.owner_generation, leader.timestamp);
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                leader = self.read(host_id).await?;
                if (leader.owner_id, leader.owner_generation, leader.timestamp) != (initial_owner, initial_gen, initial_ts) {
                    warn!("delta slot {host_id} changed under us while waiting, owner is live");
                    return Err(DeltaError::OwnerLive);
                }
                if monotime() - observed_at >= self.host_dead_seconds.as_millis() as Timestamp {
                    break;
                }
            }
        }

        let next_generation = leader.owner_generation + 1;
        let mut claim = leader.clone();
        claim.owner_id = host_id;
        claim.owner_generation = next_generation;
        claim.timestamp = monotime();
        claim.num_hosts = max_hosts;
        claim.max_hosts = max_hosts;
        self.write(host_id, &claim).await?;

        tokio::time::sleep(self.host_dead_seconds).await;
        let confirm = self.read(host_id).await?;
        if confirm.owner_id == host_id && confirm.owner_generation == next_generation {
            info!("host_id {host_id} acquired delta lease in {}, generation {next_generation}", self.space_name);
            Ok(confirm)
        } else {
            Err(DeltaError::Raced)
        }
    }

    /// Renews this host's own slot, refreshing `timestamp` while holding `owner_generation`
    /// fixed.
    ///
    /// # Errors
    /// Returns [`DeltaError::NotOwner`] if the slot no longer shows us as owner.
    pub async fn renew(&self, host_id: HostId, expected_generation: Generation) -> Result<LeaderRecord, DeltaError> {
        let leader = self.read(host_id).await?;
        if leader.owner_id != host_id || leader.owner_generation != expected_generation {
            return Err(DeltaError::NotOwner);
        }
        let mut renewed = leader;
        renewed.timestamp = monotime();
        self.write(host_id, &renewed).await?;
        debug!("renewed delta lease for host_id {host_id} in {}", self.space_name);
        Ok(renewed)
    }

    /// Releases this host's own slot, marking it free.
    ///
    /// # Errors
    /// Returns [`DeltaError::NotOwner`] if the slot no longer shows us as owner.
    pub async fn release(&self, host_id: HostId, expected_generation: Generation) -> Result<(), DeltaError> {
        let leader = self.read(host_id).await?;
        if leader.owner_id != host_id || leader.owner_generation != expected_generation {
            return Err(DeltaError::NotOwner);
        }
        let mut freed = leader;
        freed.timestamp = LEASE_FREE;
        self.write(host_id, &freed).await?;
        info!("released delta lease for host_id {host_id} in {}", self.space_name);
        Ok(())
    }

    async fn write(&self, host_id: HostId, leader: &LeaderRecord) -> Result<(), DeltaError> {
        let mut bytes = leader.encode()?.to_vec();
        bytes.resize(self.sector_size as usize, 0);
        self.disk.write(self.slot_addr(host_id), bytes, self.io_timeout).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemDisk;

    fn engine(disk: Arc<MemDisk>) -> DeltaEngine<MemDisk> {
        DeltaEngine::new(disk, 0, 512, "ls".into(), Duration::from_millis(50), Duration::from_millis(20))
    }

    async fn init_slots(disk: &MemDisk, count: u32) {
        for host_id in 1..=count {
            let leader = LeaderRecord::free("ls", "", 512, count, count, 10);
            let mut bytes = leader.encode().unwrap().to_vec();
            bytes.resize(512, 0);
            disk.write(SectorAddr::new(u64::from(host_id - 1) * 512, 512), bytes, Duration::from_secs(1)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn free_slot_is_acquired() {
        let disk = Arc::new(MemDisk::new(512 * 8));
        init_slots(&disk, 8).await;
        let engine = engine(Arc::clone(&disk));
        let leader = engine.acquire(1, 8).await.unwrap();
        assert_eq!(leader.owner_id, 1);
        assert_eq!(leader.owner_generation, 1);
    }

    #[tokio::test]
    async fn renew_requires_matching_generation() {
        let disk = Arc::new(MemDisk::new(512 * 8));
        init_slots(&disk, 8).await;
        let engine = engine(disk);
        let leader = engine.acquire(2, 8).await.unwrap();
        assert!(engine.renew(2, leader.owner_generation).await.is_ok());
        assert_eq!(engine.renew(2, leader.owner_generation + 1).await, Err(DeltaError::NotOwner));
    }

    #[tokio::test]
    async fn release_frees_the_slot() {
        let disk = Arc::new(MemDisk::new(512 * 8));
        init_slots(&disk, 8).await;
        let engine = engine(disk);
        let leader = engine.acquire(3, 8).await.unwrap();
        engine.release(3, leader.owner_generation).await.unwrap();
        let reread = engine.read(3).await.unwrap();
        assert_eq!(reread.timestamp, LEASE_FREE);
    }

    #[tokio::test]
    async fn host_status_tracks_last_live() {
        let disk = Arc::new(MemDisk::new(512 * 8));
        init_slots(&disk, 8).await;
        let engine = engine(disk);
        engine.read(4).await.unwrap();
        let first = engine.status(4).await.unwrap();
        engine.read(4).await.unwrap();
        let second = engine.status(4).await.unwrap();
        assert_eq!(first.last_live, second.last_live);
    }
}
