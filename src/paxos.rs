// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Disk-Paxos resource lease engine.
//!
//! Elects a single owner (or a set of shared-mode holders) for a named resource, using the
//! delta lease engine ([`crate::delta`]) as the only trustworthy source of "is the current
//! owner still alive". A resource's state is replicated across a set of disks; every read or
//! write requires agreement from a majority of them, so the lease survives the permanent loss
//! of a minority of disks.
//!
//! This module issues one read per sector (leader, then each host's dblock) rather than the
//! single combined "lease_read" I/O a tightly-optimized implementation would use; the
//! majority-quorum semantics are the same either way.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use log::{info, warn};
use thiserror::Error;

use crate::codec::{CodecError, Dblock, LeaderRecord, ModeBlock, RequestRecord, MBLOCK_OFFSET};
use crate::delta::{DeltaEngine, DeltaError};
use crate::disk::{Disk, DiskError, SectorAddr};
use crate::time::monotime;
use crate::{Generation, HostId, Lver, Timestamp, LEASE_FREE};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AcquireFlags: u32 {
        /// Skip owner-liveness probing and go straight to a ballot.
        const FORCE        = 0b0000_0001;
        /// Acquire in shared mode; coexists with other shared holders, excludes exclusive ones.
        const SHARED       = 0b0000_0010;
        /// Fail immediately with `OwnedRetry` instead of waiting on a live owner.
        const OWNER_NOWAIT = 0b0000_0100;
    }
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum PaxosError {
    #[error(transparent)]
    Disk(#[from] DiskError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Delta(#[from] DeltaError),
    #[error("could not read the leader record from a majority of disks")]
    LeaderRead,
    #[error("could not write the leader record to a majority of disks")]
    LeaderWrite,
    #[error("could not read a dblock from a majority of disks")]
    DblockRead,
    #[error("could not write a dblock to a majority of disks")]
    DblockWrite,
    #[error("a higher ballot number was observed; retry with a larger mbal")]
    Mbal,
    #[error("a higher lver was observed; restart the acquire")]
    Lver,
    #[error("the resource is already owned by a live host")]
    IdLive,
    #[error("the resource is already owned by us")]
    Owned,
    #[error("the resource is owned and the caller asked not to wait")]
    OwnedRetry,
    #[error("we wrote a different host in as owner")]
    Other,
    #[error("a live host holds the resource in shared mode")]
    Shared,
    #[error("lver does not match the caller's expectation")]
    LverMismatch,
    #[error("release attempted by a host that is not the recorded owner")]
    NotOwner,
    #[error("the resource is already free")]
    AlreadyFree,
    #[error("num_hosts exceeds the dblock area this resource was sized for")]
    TooManyHosts,
}

impl PaxosError {
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            PaxosError::Disk(e) => e.code(),
            PaxosError::Codec(e) => e.code(),
            PaxosError::Delta(e) => e.code(),
            PaxosError::LeaderRead => -210,
            PaxosError::LeaderWrite => -211,
            PaxosError::DblockRead => -213,
            PaxosError::DblockWrite => -214,
            PaxosError::Mbal => -215,
            PaxosError::Lver => -216,
            PaxosError::LverMismatch => -217,
            PaxosError::IdLive => -218,
            PaxosError::Owned => -219,
            PaxosError::OwnedRetry => -220,
            PaxosError::Other => -221,
            PaxosError::Shared => -224,
            PaxosError::NotOwner => -226,
            PaxosError::AlreadyFree => -225,
            PaxosError::TooManyHosts => -227,
        }
    }
}

enum WaitOutcome {
    ProceedToBallot,
    RestartOuter,
}

fn pack_dblock_sector(dblock: &Dblock, mode: &ModeBlock, sector_size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; sector_size];
    let encoded = dblock.encode();
    buf[..encoded.len()].copy_from_slice(&encoded);
    let mode_encoded = mode.encode();
    buf[MBLOCK_OFFSET..MBLOCK_OFFSET + mode_encoded.len()].copy_from_slice(&mode_encoded);
    buf
}

fn unpack_dblock_sector(buf: &[u8]) -> Result<(Dblock, ModeBlock), CodecError> {
    let dblock = Dblock::decode(&buf[..Dblock::ENCODED_LEN])?;
    let mode = ModeBlock::decode(&buf[MBLOCK_OFFSET..MBLOCK_OFFSET + ModeBlock::ENCODED_LEN])?;
    Ok((dblock, mode))
}

/// Resource/paxos lease engine for one named resource, replicated across `disks`.
pub struct PaxosEngine<D: Disk> {
    disks: Vec<Arc<D>>,
    base_offset: u64,
    sector_size: u32,
    max_hosts: u32,
    host_id: HostId,
    host_generation: Generation,
    space_name: String,
    resource_name: String,
    io_timeout: Duration,
    other_host_dead_seconds: Duration,
    delta: Arc<DeltaEngine<D>>,
}

const LEADER_SECTOR: u64 = 0;
const REQUEST_SECTOR: u64 = 1;
const DBLOCK_SECTOR_BASE: u64 = 2;

impl<D: Disk> PaxosEngine<D> {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        disks: Vec<Arc<D>>,
        base_offset: u64,
        sector_size: u32,
        max_hosts: u32,
        host_id: HostId,
        host_generation: Generation,
        space_name: String,
        resource_name: String,
        io_timeout: Duration,
        other_host_dead_seconds: Duration,
        delta: Arc<DeltaEngine<D>>,
    ) -> Self {
        Self { disks, base_offset, sector_size, max_hosts, host_id, host_generation, space_name, resource_name, io_timeout, other_host_dead_seconds, delta }
    }

    fn majority(&self) -> usize {
        self.disks.len() / 2 + 1
    }

    fn addr(&self, sector: u64) -> SectorAddr {
        SectorAddr::new(self.base_offset + sector * u64::from(self.sector_size), self.sector_size as usize)
    }

    async fn read_all(&self, sector: u64) -> Vec<Result<Vec<u8>, DiskError>> {
        let addr = self.addr(sector);
        let reads = self.disks.iter().map(|disk| disk.read(addr, self.io_timeout));
        futures::future::join_all(reads).await
    }

    async fn write_all(&self, sector: u64, bytes: &[u8]) -> usize {
        let addr = self.addr(sector);
        let writes = self.disks.iter().map(|disk| disk.write(addr, bytes.to_vec(), self.io_timeout));
        futures::future::join_all(writes).await.into_iter().filter(Result::is_ok).count()
    }

    /// Reads the resource's leader record from a majority of disks.
    ///
    /// # Errors
    /// Returns [`PaxosError::LeaderRead`] if fewer than a majority of disks return a
    /// checksum-valid record.
    pub async fn read_leader(&self) -> Result<LeaderRecord, PaxosError> {
        let results = self.read_all(LEADER_SECTOR).await;
        let successes: Vec<LeaderRecord> = results.into_iter().filter_map(Result::ok).filter_map(|bytes| LeaderRecord::decode(&bytes).ok()).collect();
        if successes.len() < self.majority() {
            return Err(PaxosError::LeaderRead);
        }
        successes.into_iter().max_by_key(|r| r.lver).ok_or(PaxosError::LeaderRead)
    }

    async fn write_leader(&self, leader: &LeaderRecord) -> Result<(), PaxosError> {
        let mut bytes = leader.encode()?.to_vec();
        bytes.resize(self.sector_size as usize, 0);
        if self.write_all(LEADER_SECTOR, &bytes).await < self.majority() {
            return Err(PaxosError::LeaderWrite);
        }
        Ok(())
    }

    async fn read_dblock_majority(&self, host_id: HostId) -> Result<(Dblock, ModeBlock), PaxosError> {
        let sector = DBLOCK_SECTOR_BASE + u64::from(host_id - 1);
        let results = self.read_all(sector).await;
        let successes: Vec<(Dblock, ModeBlock)> = results.into_iter().filter_map(Result::ok).filter_map(|bytes| unpack_dblock_sector(&bytes).ok()).collect();
        if successes.len() < self.majority() {
            return Err(PaxosError::DblockRead);
        }
        successes.into_iter().max_by_key(|(d, _)| d.bal).ok_or(PaxosError::DblockRead)
    }

    async fn write_dblock(&self, host_id: HostId, dblock: &Dblock, mode: &ModeBlock) -> Result<(), PaxosError> {
        let sector = DBLOCK_SECTOR_BASE + u64::from(host_id - 1);
        let bytes = pack_dblock_sector(dblock, mode, self.sector_size as usize);
        if self.write_all(sector, &bytes).await < self.majority() {
            return Err(PaxosError::DblockWrite);
        }
        Ok(())
    }

    async fn max_observed_mbal(&self) -> u64 {
        let mut max = 0u64;
        for host_id in 1..=self.max_hosts {
            if let Ok((dblock, _)) = self.read_dblock_majority(host_id).await {
                max = max.max(dblock.mbal);
            }
        }
        max
    }

    /// Runs one attempt at a two-phase disk-Paxos ballot for `next_lver` with ballot number
    /// `our_mbal`.
    ///
    /// # Errors
    /// Returns [`PaxosError::Mbal`] or [`PaxosError::Lver`] if a competing proposer is
    /// observed during either phase; the caller decides how to retry.
    async fn run_ballot(&self, next_lver: Lver, our_mbal: u64, flags: AcquireFlags) -> Result<Dblock, PaxosError> {
        let our_mode = self.read_dblock_majority(self.host_id).await.map(|(_, m)| m).unwrap_or_default();

        let prepare = Dblock { mbal: our_mbal, bal: 0, inp: 0, inp2: 0, inp3: 0, lver: next_lver, flags: 0 };
        self.write_dblock(self.host_id, &prepare, &our_mode).await?;

        let mut bk_max: Option<Dblock> = None;
        for host_id in 1..=self.max_hosts {
            let Ok((dblock, mode)) = self.read_dblock_majority(host_id).await else { continue };
            if dblock.lver > next_lver {
                return Err(PaxosError::Lver);
            }
            // A dblock left over from an already-decided earlier round is not a live
            // proposal in this one; only dblocks at our own round number can conflict with
            // or contribute a value to it.
            if dblock.lver == next_lver {
                if host_id != self.host_id && dblock.mbal > our_mbal {
                    return Err(PaxosError::Mbal);
                }
                if dblock.bal > 0 && bk_max.as_ref().is_none_or(|bk| dblock.bal > bk.bal) {
                    bk_max = Some(dblock);
                }
            }
            if !flags.contains(AcquireFlags::SHARED) && host_id != self.host_id && mode.is_shared() && mode.is_claimed() {
                if self.delta.status(host_id).await.is_none() {
                    self.delta.read(host_id).await?;
                }
                if let Some(status) = self.delta.status(host_id).await {
                    let still_live = monotime().saturating_sub(status.last_live) < self.other_host_dead_seconds.as_millis() as Timestamp;
                    if still_live {
                        return Err(PaxosError::Shared);
                    }
                }
            }
        }

        let (inp, inp2, inp3) = match &bk_max {
            Some(bk) => (bk.inp, bk.inp2, bk.inp3),
            None => (u64::from(self.host_id), self.host_generation, monotime()),
        };
        let accept = Dblock { mbal: our_mbal, bal: our_mbal, inp, inp2, inp3, lver: next_lver, flags: 0 };
        let accept_mode = if flags.contains(AcquireFlags::SHARED) {
            ModeBlock { flags: crate::codec::MBLOCK_SHARED, generation: self.host_generation }
        } else {
            our_mode
        };
        self.write_dblock(self.host_id, &accept, &accept_mode).await?;

        for host_id in 1..=self.max_hosts {
            if host_id == self.host_id {
                continue;
            }
            if let Ok((dblock, _)) = self.read_dblock_majority(host_id).await {
                if dblock.lver > next_lver {
                    return Err(PaxosError::Lver);
                }
                if dblock.lver == next_lver && dblock.mbal > our_mbal {
                    return Err(PaxosError::Mbal);
                }
            }
        }
        Ok(accept)
    }

    async fn wait_for_owner(&self, leader: &LeaderRecord, flags: AcquireFlags) -> Result<WaitOutcome, PaxosError> {
        if flags.contains(AcquireFlags::SHARED) {
            let (_, owner_mode) = self.read_dblock_majority(leader.owner_id).await?;
            if owner_mode.is_claimed() && owner_mode.is_shared() {
                return Ok(WaitOutcome::ProceedToBallot);
            }
        }

        if !flags.contains(AcquireFlags::SHARED) {
            for (host_id, _) in shared_holders(self, self.max_hosts).await {
                if host_id == self.host_id {
                    continue;
                }
                if self.delta.status(host_id).await.is_none() {
                    self.delta.read(host_id).await?;
                }
                if let Some(status) = self.delta.status(host_id).await {
                    let live = monotime().saturating_sub(status.last_live) < self.other_host_dead_seconds.as_millis() as Timestamp;
                    if live {
                        return Err(PaxosError::Shared);
                    }
                }
            }
        }

        if self.delta.status(leader.owner_id).await.is_none() {
            self.delta.read(leader.owner_id).await?;
        }
        let initial = self.delta.status(leader.owner_id).await.expect("read above populates status");
        let wait_start = initial.last_live;
        let deadline_ms = self.other_host_dead_seconds.as_millis() as Timestamp;

        loop {
            if flags.contains(AcquireFlags::OWNER_NOWAIT) {
                return Err(PaxosError::OwnedRetry);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.delta.read(leader.owner_id).await?;
            let status = self.delta.status(leader.owner_id).await.expect("just read");

            let current = self.read_leader().await?;
            if current.lver != leader.lver || current.timestamp != leader.timestamp {
                return Ok(WaitOutcome::RestartOuter);
            }

            if status.timestamp != initial.timestamp {
                let (owner_dblock, _) = self.read_dblock_majority(leader.owner_id).await?;
                if owner_dblock.released() {
                    return Ok(WaitOutcome::ProceedToBallot);
                }
                warn!("resource {}/{} owner {} delta lease advanced, still live", self.space_name, self.resource_name, leader.owner_id);
                return Err(PaxosError::IdLive);
            }
            if status.owner_generation != initial.owner_generation || status.owner_id != initial.owner_id {
                return Ok(WaitOutcome::ProceedToBallot);
            }
            if monotime().saturating_sub(wait_start) >= deadline_ms {
                return Ok(WaitOutcome::ProceedToBallot);
            }
        }
    }

    /// Acquires the resource, running owner-liveness probing and, if necessary, a disk-Paxos
    /// ballot.
    ///
    /// # Errors
    /// Returns [`PaxosError::IdLive`] if a live host already owns the resource,
    /// [`PaxosError::Owned`]/[`PaxosError::OwnedRetry`] if another host committed ownership
    /// concurrently, [`PaxosError::Other`] if we wrote a different host in as owner, or
    /// [`PaxosError::Shared`] if a live shared holder blocks an exclusive acquire.
    pub async fn acquire(&self, flags: AcquireFlags) -> Result<LeaderRecord, PaxosError> {
        'outer: loop {
            let leader = self.read_leader().await?;

            if leader.owner_id == self.host_id && leader.owner_generation == self.host_generation && !leader.is_free() {
                return Ok(leader);
            }

            if !(leader.is_free() || flags.contains(AcquireFlags::FORCE)) {
                match self.wait_for_owner(&leader, flags).await? {
                    WaitOutcome::RestartOuter => continue 'outer,
                    WaitOutcome::ProceedToBallot => {}
                }
            }

            let max_mbal = self.max_observed_mbal().await;
            let next_lver = leader.lver + 1;
            let mut our_mbal = if max_mbal == 0 {
                u64::from(self.host_id)
            } else {
                (max_mbal / u64::from(self.max_hosts)) * u64::from(self.max_hosts) + u64::from(self.max_hosts) + u64::from(self.host_id)
            };

            let fresh = self.read_leader().await?;
            if fresh.lver >= next_lver {
                if fresh.owner_id == self.host_id {
                    return Ok(fresh);
                }
                return Err(PaxosError::Owned);
            }

            let dblock = loop {
                match self.run_ballot(next_lver, our_mbal, flags).await {
                    Ok(dblock) => break dblock,
                    Err(PaxosError::Mbal) => {
                        let jitter_ms = rand::random::<u64>() % 2;
                        tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
                        our_mbal += u64::from(self.max_hosts);
                    }
                    Err(PaxosError::Lver) => continue 'outer,
                    Err(other) => return Err(other),
                }
            };

            let mut new_leader = leader.clone();
            new_leader.owner_id = dblock.inp as HostId;
            new_leader.owner_generation = dblock.inp2;
            new_leader.timestamp = dblock.inp3;
            new_leader.lver = dblock.lver;
            new_leader.write_id = self.host_id;
            new_leader.write_generation = self.host_generation;
            new_leader.write_timestamp = monotime();
            if new_leader.owner_id == self.host_id && flags.contains(AcquireFlags::SHARED) {
                new_leader.flags |= crate::codec::LFL_SHORT_HOLD;
            } else if new_leader.owner_id == self.host_id {
                new_leader.flags &= !crate::codec::LFL_SHORT_HOLD;
            }
            self.write_leader(&new_leader).await?;

            if new_leader.owner_id == self.host_id {
                info!("host_id {} acquired resource {}/{} at lver {}", self.host_id, self.space_name, self.resource_name, new_leader.lver);
                return Ok(new_leader);
            }
            return Err(PaxosError::Other);
        }
    }

    /// Releases the resource. If another host committed us in as owner but the local leader
    /// write never happened (the "writer not owner" race), only the dblock is marked released.
    ///
    /// # Errors
    /// Returns [`PaxosError::NotOwner`] if the leader does not show us as owner, or
    /// [`PaxosError::AlreadyFree`] if it is already free.
    pub async fn release(&self) -> Result<LeaderRecord, PaxosError> {
        let leader = self.read_leader().await?;

        if leader.write_id != self.host_id {
            let (mut dblock, mut mode) = self.read_dblock_majority(self.host_id).await?;
            dblock.flags |= crate::codec::DBLOCK_FL_RELEASED;
            if mode.is_shared() {
                mode = ModeBlock::default();
            }
            self.write_dblock(self.host_id, &dblock, &mode).await?;
            return Ok(leader);
        }

        if leader.owner_id != self.host_id || leader.owner_generation != self.host_generation {
            return Err(PaxosError::NotOwner);
        }
        if leader.is_free() {
            return Err(PaxosError::AlreadyFree);
        }

        let (dblock, mut mode) = self.read_dblock_majority(self.host_id).await?;
        if mode.is_shared() {
            mode = ModeBlock::default();
            self.write_dblock(self.host_id, &dblock, &mode).await?;
        }

        let mut freed = leader;
        freed.timestamp = LEASE_FREE;
        freed.write_id = self.host_id;
        freed.write_generation = self.host_generation;
        freed.write_timestamp = monotime();
        freed.flags &= !crate::codec::LFL_SHORT_HOLD;
        self.write_leader(&freed).await?;
        info!("host_id {} released resource {}/{}", self.host_id, self.space_name, self.resource_name);
        Ok(freed)
    }

    /// Zero-fills the resource's lease region (leader, request record, and every dblock sector
    /// up to `max_hosts`) and writes a fresh free leader plus an empty request record. `clear`
    /// marks the leader with `PAXOS_DISK_CLEAR` instead of the normal live magic, for resources
    /// being permanently decommissioned.
    ///
    /// This engine is not given the resource's `align_size`, so it only zeroes the sectors it
    /// actually addresses (through `max_hosts`) rather than the full aligned region a disk
    /// layout tool would reserve; a re-init can leave a stale sector beyond the host area
    /// untouched if a prior configuration used a larger `max_hosts` on the same disk region.
    ///
    /// # Errors
    /// Returns [`PaxosError::TooManyHosts`] if `num_hosts` exceeds the dblock area this engine
    /// was constructed to address (`max_hosts`), or propagates disk and codec errors.
    pub async fn init(&self, num_hosts: u32, clear: bool) -> Result<(), PaxosError> {
        if num_hosts > self.max_hosts {
            return Err(PaxosError::TooManyHosts);
        }
        let zero_sector = vec![0u8; self.sector_size as usize];
        for sector in 0..DBLOCK_SECTOR_BASE + u64::from(self.max_hosts) {
            self.write_all(sector, &zero_sector).await;
        }

        let mut leader = LeaderRecord::free(&self.space_name, &self.resource_name, self.sector_size, num_hosts, self.max_hosts, self.io_timeout.as_secs() as u32);
        if clear {
            leader = leader.cleared();
        }
        self.write_leader(&leader).await?;

        let request = RequestRecord::new(0, 0, 0);
        let mut request_bytes = request.encode().to_vec();
        request_bytes.resize(self.sector_size as usize, 0);
        self.write_all(REQUEST_SECTOR, &request_bytes).await;
        Ok(())
    }

    /// Reads the advisory request record, if any host has left one.
    ///
    /// # Errors
    /// Propagates disk and codec errors.
    pub async fn read_request(&self) -> Result<RequestRecord, PaxosError> {
        let results = self.read_all(REQUEST_SECTOR).await;
        let successes: Vec<RequestRecord> = results.into_iter().filter_map(Result::ok).filter_map(|bytes| RequestRecord::decode(&bytes).ok()).collect();
        successes.into_iter().max_by_key(|r| r.lver).ok_or(PaxosError::DblockRead)
    }

    /// Leaves an advisory note asking the current owner's client to release voluntarily.
    ///
    /// # Errors
    /// Propagates disk and codec errors.
    pub async fn request_release(&self, last_known_lver: Lver) -> Result<(), PaxosError> {
        let request = RequestRecord::new(last_known_lver, self.host_id, self.host_generation);
        let mut bytes = request.encode().to_vec();
        bytes.resize(self.sector_size as usize, 0);
        if self.write_all(REQUEST_SECTOR, &bytes).await < self.majority() {
            return Err(PaxosError::LeaderWrite);
        }
        Ok(())
    }
}

/// Snapshot of all hosts' mode-block claims on a resource, used by callers that need to
/// report shared-mode holders (e.g. STATUS/INQUIRE, see `runtime::StatusReport`).
pub async fn shared_holders<D: Disk>(engine: &PaxosEngine<D>, max_hosts: u32) -> BTreeMap<HostId, ModeBlock> {
    let mut holders = BTreeMap::new();
    for host_id in 1..=max_hosts {
        if let Ok((_, mode)) = engine.read_dblock_majority(host_id).await {
            if mode.is_claimed() && mode.is_shared() {
                holders.insert(host_id, mode);
            }
        }
    }
    holders
}
