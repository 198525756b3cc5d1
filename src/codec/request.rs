// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Request record codec: an advisory "please release" note left for a resource's owner.
//!
//! Request records are not part of the paxos protocol itself, and no acceptor consults them
//! for correctness. They are a courtesy channel: a host about to contend for a resource
//! records who it is and what generation it last observed, so the current owner's client can
//! choose to release voluntarily instead of making the requester wait out the full
//! liveness timeout.

use super::checksum::record_checksum;
use super::{CodecError, REQUEST_DISK_MAGIC};
use crate::{Generation, HostId, Lver};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestRecord {
    pub magic: u32,
    pub version: u32,
    pub lver: Lver,
    pub host_id: HostId,
    pub generation: Generation,
}

impl RequestRecord {
    pub const ENCODED_LEN: usize = 4 + 4 + 8 + 4 + 8 + 4;

    #[must_use]
    pub fn new(lver: Lver, host_id: HostId, generation: Generation) -> Self {
        Self { magic: REQUEST_DISK_MAGIC, version: super::CODEC_VERSION, lver, host_id, generation }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        let mut off = 0;
        buf[off..off + 4].copy_from_slice(&self.magic.to_le_bytes());
        off += 4;
        buf[off..off + 4].copy_from_slice(&self.version.to_le_bytes());
        off += 4;
        buf[off..off + 8].copy_from_slice(&self.lver.to_le_bytes());
        off += 8;
        buf[off..off + 4].copy_from_slice(&self.host_id.to_le_bytes());
        off += 4;
        buf[off..off + 8].copy_from_slice(&self.generation.to_le_bytes());
        off += 8;

        let checksum = record_checksum(&buf[..off]);
        buf[off..off + 4].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Decodes and checksum-verifies a request record.
    ///
    /// # Errors
    /// Returns [`CodecError::ShortBuffer`] if `buf` is too short, or
    /// [`CodecError::RequestChecksum`] if the trailing checksum does not match.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(CodecError::ShortBuffer);
        }
        let payload_len = Self::ENCODED_LEN - 4;
        let expected = record_checksum(&buf[..payload_len]);
        let actual = u32::from_le_bytes(buf[payload_len..Self::ENCODED_LEN].try_into().unwrap());
        if expected != actual {
            return Err(CodecError::RequestChecksum);
        }

        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let lver = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let host_id = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        let generation = u64::from_le_bytes(buf[20..28].try_into().unwrap());
        Ok(Self { magic, version, lver, host_id, generation })
    }
}
