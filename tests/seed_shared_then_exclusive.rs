// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Seed 4: two hosts both acquire a resource in shared mode; a third host's exclusive acquire
//! fails fast while either shared holder is live, then succeeds once both release.
//!
//! This scenario does not need fine timing control (no crash or renewal-cadence simulation), so
//! unlike the other `seed_*` tests it drives the full [`diskpaxos::Runtime`] wiring end to end.

mod support;

use std::sync::Arc;

use diskpaxos::config::Settings;
use diskpaxos::disk::FileDisk;
use diskpaxos::error::Error;
use diskpaxos::paxos::{AcquireFlags, PaxosEngine, PaxosError};
use diskpaxos::supervisor::SystemProcessKiller;
use diskpaxos::token::TokenError;
use diskpaxos::watchdog::NullWatchdog;
use diskpaxos::{LockspaceId, Runtime};

fn settings() -> Settings {
    Settings { host_id_renewal_seconds: 2, renewal_warn_seconds: 3, renewal_fail_seconds: 4, host_dead_seconds: 1, io_timeout_seconds: 1, max_hosts: 8, ..Settings::default() }
}

async fn runtime_for(host_id: u32, ls_path: &std::path::Path, res_path: &std::path::Path) -> Runtime<FileDisk, NullWatchdog, SystemProcessKiller> {
    let runtime = Runtime::new(settings(), Arc::new(NullWatchdog), SystemProcessKiller).unwrap();
    let ls_disk = Arc::new(FileDisk::open(ls_path).unwrap());
    runtime.add_lockspace(LockspaceId("ls".into()), ls_disk, 0, support::SECTOR, host_id).await.unwrap();
    let res_disk = Arc::new(FileDisk::open(res_path).unwrap());
    runtime.register_resource(LockspaceId("ls".into()), "res".into(), vec![res_disk], support::RESOURCE_OFFSET, support::SECTOR, host_id).await.unwrap();
    runtime
}

#[tokio::test]
async fn shared_holders_block_an_exclusive_acquire_until_released() {
    let image = support::DiskImage::new();
    support::init_delta_slots(&image, "ls", 8, support::SECTOR).await;

    // A resource must be initialized before any runtime registers it, same as an operator
    // running an init tool once against fresh storage.
    let init_disk = Arc::new(FileDisk::open(image.path()).unwrap());
    let init_delta = Arc::new(diskpaxos::delta::DeltaEngine::new(
        Arc::clone(&init_disk),
        0,
        support::SECTOR,
        "ls".into(),
        std::time::Duration::from_secs(1),
        std::time::Duration::from_secs(1),
    ));
    let init_engine = PaxosEngine::new(vec![Arc::clone(&init_disk)], support::RESOURCE_OFFSET, support::SECTOR, support::MAX_HOSTS, 1, 0, "ls".into(), "res".into(), std::time::Duration::from_secs(1), std::time::Duration::from_secs(1), init_delta);
    init_engine.init(8, false).await.unwrap();

    let h1 = runtime_for(1, image.path(), image.path()).await;
    let h2 = runtime_for(2, image.path(), image.path()).await;
    let h3 = runtime_for(3, image.path(), image.path()).await;

    let t1 = h1.acquire(100, "res", AcquireFlags::SHARED).await.unwrap();
    let t2 = h2.acquire(200, "res", AcquireFlags::SHARED).await.unwrap();

    let blocked = h3.acquire(300, "res", AcquireFlags::OWNER_NOWAIT).await;
    assert_eq!(blocked, Err(Error::Token(TokenError::Paxos(PaxosError::Shared))));

    h1.release(100, t1, "res").await.unwrap();
    h2.release(200, t2, "res").await.unwrap();

    let token3 = h3.acquire(300, "res", AcquireFlags::empty()).await.unwrap();
    assert_eq!(h3.inquire(300).await, 1);
    h3.release(300, token3, "res").await.unwrap();
}
