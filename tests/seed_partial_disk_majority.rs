// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Seed 5: a resource replicated across 3 disks tolerates the permanent loss of a minority.
//! Losing one disk still lets a majority (2 of 3) decide; losing a second leaves no possible
//! majority and every operation fails loudly instead of silently deciding on stale data.

use std::sync::Arc;
use std::time::Duration;

use diskpaxos::delta::DeltaEngine;
use diskpaxos::disk::{Disk, MemDisk, SectorAddr};
use diskpaxos::paxos::{AcquireFlags, PaxosEngine, PaxosError};

const SECTOR: u32 = 512;
const MAX_HOSTS: u32 = 3;

fn offsets_in_use() -> [u64; 5] {
    // leader, request, then one dblock sector per host_id up to MAX_HOSTS.
    [0, u64::from(SECTOR), 2 * u64::from(SECTOR), 3 * u64::from(SECTOR), 4 * u64::from(SECTOR)]
}

#[tokio::test]
async fn losing_a_minority_of_disks_preserves_availability() {
    let disks: Vec<Arc<MemDisk>> = (0..3).map(|_| Arc::new(MemDisk::new(SECTOR as usize * 8))).collect();

    let delta_disk = Arc::new(MemDisk::new(SECTOR as usize * 8));
    let leader = diskpaxos::codec::LeaderRecord::free("ls", "", SECTOR, MAX_HOSTS, MAX_HOSTS, 10);
    let mut bytes = leader.encode().unwrap().to_vec();
    bytes.resize(SECTOR as usize, 0);
    delta_disk.write(SectorAddr::new(0, SECTOR as usize), bytes, Duration::from_secs(1)).await.unwrap();
    let delta = Arc::new(DeltaEngine::new(delta_disk, 0, SECTOR, "ls".into(), Duration::from_millis(50), Duration::from_millis(20)));

    let engine = PaxosEngine::new(disks.clone(), 0, SECTOR, MAX_HOSTS, 1, 1, "ls".into(), "res".into(), Duration::from_millis(50), Duration::from_millis(20), delta);

    engine.init(MAX_HOSTS, false).await.unwrap();
    let acquired = engine.acquire(AcquireFlags::empty()).await.unwrap();
    assert_eq!(acquired.owner_id, 1);
    engine.release().await.unwrap();

    // One of three disks goes permanently unreachable: a majority (the other two) remains.
    for offset in offsets_in_use() {
        disks[2].fail_offset(offset).await;
    }

    let reacquired = engine.acquire(AcquireFlags::empty()).await.unwrap();
    assert_eq!(reacquired.owner_id, 1);
    assert_eq!(reacquired.lver, 2);

    // A second disk goes down too: no possible majority among 3 disks, every operation must
    // fail rather than decide on a minority.
    for offset in offsets_in_use() {
        disks[1].fail_offset(offset).await;
    }

    let result = engine.acquire(AcquireFlags::empty()).await;
    assert_eq!(result, Err(PaxosError::LeaderRead));

    let read_result = engine.read_leader().await;
    assert_eq!(read_result, Err(PaxosError::LeaderRead));
}
