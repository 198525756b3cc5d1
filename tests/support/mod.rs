// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shared scaffolding for the `seed_*` end-to-end scenario tests: a `tempfile`-backed disk
//! image standing in for the shared block device all hosts in a scenario see, plus the
//! sector layout the scenarios agree on.

use std::sync::Arc;
use std::time::Duration;

use diskpaxos::codec::LeaderRecord;
use diskpaxos::delta::DeltaEngine;
use diskpaxos::disk::{Disk, FileDisk, SectorAddr};
use diskpaxos::paxos::PaxosEngine;
use diskpaxos::{Generation, HostId};

pub const SECTOR: u32 = 512;
pub const MAX_HOSTS: u32 = 8;
pub const RESOURCE_OFFSET: u64 = 1024 * 1024;

/// A shared disk image backing a lockspace at offset 0 and a resource at [`RESOURCE_OFFSET`].
pub struct DiskImage {
    file: tempfile::NamedTempFile,
}

impl DiskImage {
    #[must_use]
    pub fn new() -> Self {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(RESOURCE_OFFSET + 64 * 1024).unwrap();
        Self { file }
    }

    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        self.file.path()
    }
}

/// Writes a free leader record into each of `count` host_id slots in the lockspace area.
pub async fn init_delta_slots(image: &DiskImage, space_name: &str, count: u32, sector_size: u32) {
    let disk = FileDisk::open(image.path()).unwrap();
    for host_id in 1..=count {
        let leader = LeaderRecord::free(space_name, "", sector_size, count, count, 10);
        let mut bytes = leader.encode().unwrap().to_vec();
        bytes.resize(sector_size as usize, 0);
        let addr = SectorAddr::new(u64::from(host_id - 1) * u64::from(sector_size), sector_size as usize);
        disk.write(addr, bytes, Duration::from_secs(1)).await.unwrap();
    }
}

/// Builds a [`PaxosEngine`] over a single replica of the resource area, with timings small
/// enough for a test to exercise liveness-dependent paths in well under a second.
#[must_use]
pub fn paxos_engine(disk: Arc<FileDisk>, delta: Arc<DeltaEngine<FileDisk>>, host_id: HostId, host_generation: Generation) -> PaxosEngine<FileDisk> {
    paxos_engine_with_dead(vec![disk], delta, host_id, host_generation, Duration::from_millis(300))
}

/// Like [`paxos_engine`], but over one or more disk replicas and a caller-chosen
/// `other_host_dead_seconds`, for scenarios that need to tune how long a probe waits out a
/// live owner before giving up.
#[must_use]
pub fn paxos_engine_with_dead(disks: Vec<Arc<FileDisk>>, delta: Arc<DeltaEngine<FileDisk>>, host_id: HostId, host_generation: Generation, other_host_dead_seconds: Duration) -> PaxosEngine<FileDisk> {
    PaxosEngine::new(disks, RESOURCE_OFFSET, SECTOR, MAX_HOSTS, host_id, host_generation, "ls".into(), "res".into(), Duration::from_millis(100), other_host_dead_seconds, delta)
}
