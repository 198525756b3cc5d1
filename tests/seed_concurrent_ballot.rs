// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Seed 3: two hosts race to acquire the same free resource at the same time. Disk-Paxos
//! guarantees exactly one lver=1 decision lands, and any host that loses the race either sees
//! that decision directly or is told the resource is already owned.

mod support;

use std::sync::Arc;
use std::time::Duration;

use diskpaxos::delta::DeltaEngine;
use diskpaxos::disk::FileDisk;
use diskpaxos::paxos::{AcquireFlags, PaxosError};

#[tokio::test]
async fn exactly_one_racer_commits_the_resource() {
    let image = support::DiskImage::new();
    support::init_delta_slots(&image, "ls", 8, support::SECTOR).await;

    let ls_disk = Arc::new(FileDisk::open(image.path()).unwrap());
    let res_disk = Arc::new(FileDisk::open(image.path()).unwrap());

    let h1_delta = Arc::new(DeltaEngine::new(Arc::clone(&ls_disk), 0, support::SECTOR, "ls".into(), Duration::from_millis(50), Duration::from_millis(20)));
    let h1_leader = h1_delta.acquire(1, 8).await.unwrap();
    let h1_engine = support::paxos_engine(Arc::clone(&res_disk), Arc::clone(&h1_delta), 1, h1_leader.owner_generation);
    h1_engine.init(8, false).await.unwrap();

    let h2_delta = Arc::new(DeltaEngine::new(Arc::clone(&ls_disk), 0, support::SECTOR, "ls".into(), Duration::from_millis(50), Duration::from_millis(20)));
    let h2_leader = h2_delta.acquire(2, 8).await.unwrap();
    let h2_engine = support::paxos_engine(res_disk, h2_delta, 2, h2_leader.owner_generation);

    let (r1, r2) = tokio::join!(h1_engine.acquire(AcquireFlags::empty()), h2_engine.acquire(AcquireFlags::empty()));

    let winner = match (r1, r2) {
        (Ok(a), Ok(b)) => {
            assert_eq!(a, b, "both racers must agree on the single decided leader");
            a.owner_id
        }
        (Ok(a), Err(e)) | (Err(e), Ok(a)) => {
            assert!(matches!(e, PaxosError::Owned | PaxosError::OwnedRetry | PaxosError::Other), "unexpected loser error: {e:?}");
            a.owner_id
        }
        (Err(e1), Err(e2)) => panic!("both racers failed: {e1:?}, {e2:?}"),
    };

    let leader = h1_engine.read_leader().await.unwrap();
    assert_eq!(leader.lver, 1);
    assert!(!leader.is_free());
    assert_eq!(leader.owner_id, winner);
    assert!(winner == 1 || winner == 2);
}
