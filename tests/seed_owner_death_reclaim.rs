// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Seed 2: an owner that stops renewing is eventually reclaimed by another host once its
//! delta lease has looked unchanged for `other_host_dead_seconds`.
//!
//! h1 is modeled without a renewal loop at all, rather than by cancelling one mid-test: a
//! host that has actually crashed is not running anything, so the absence of a task is the
//! faithful model, not a shortcut.

mod support;

use std::sync::Arc;
use std::time::Duration;

use diskpaxos::delta::DeltaEngine;
use diskpaxos::disk::FileDisk;
use diskpaxos::paxos::AcquireFlags;

#[tokio::test]
async fn dead_owner_is_reclaimed_after_the_liveness_window() {
    let image = support::DiskImage::new();
    support::init_delta_slots(&image, "ls", 8, support::SECTOR).await;

    let ls_disk = Arc::new(FileDisk::open(image.path()).unwrap());
    let res_disk = Arc::new(FileDisk::open(image.path()).unwrap());

    let h1_delta = Arc::new(DeltaEngine::new(Arc::clone(&ls_disk), 0, support::SECTOR, "ls".into(), Duration::from_millis(50), Duration::from_millis(20)));
    let h1_leader = h1_delta.acquire(1, 8).await.unwrap();
    let h1_engine = support::paxos_engine_with_dead(vec![Arc::clone(&res_disk)], Arc::clone(&h1_delta), 1, h1_leader.owner_generation, Duration::from_millis(200));
    h1_engine.init(8, false).await.unwrap();
    let committed = h1_engine.acquire(AcquireFlags::empty()).await.unwrap();
    assert_eq!(committed.lver, 1);
    assert_eq!(committed.owner_id, 1);

    // h1 never renews again from here: its slot's timestamp is frozen.

    let h2_delta = Arc::new(DeltaEngine::new(Arc::clone(&ls_disk), 0, support::SECTOR, "ls".into(), Duration::from_millis(50), Duration::from_millis(20)));
    let h2_leader = h2_delta.acquire(2, 8).await.unwrap();
    let h2_engine = support::paxos_engine_with_dead(vec![res_disk], h2_delta, 2, h2_leader.owner_generation, Duration::from_millis(200));

    let reclaimed = h2_engine.acquire(AcquireFlags::empty()).await.unwrap();
    assert_eq!(reclaimed.lver, 2);
    assert_eq!(reclaimed.owner_id, 2);
    assert_eq!(reclaimed.owner_generation, h2_leader.owner_generation);
}
