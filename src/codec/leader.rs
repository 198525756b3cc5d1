// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Leader record codec.
//!
//! The same record layout backs both the delta lease host slot and the paxos resource
//! leader: both are "the committed state of a lease, with an owner and a timestamp",
//! differing only in which fields a given engine cares about (the delta lease engine
//! ignores `lver`/`num_hosts`/`max_hosts`; the paxos engine ignores `io_timeout`).

use super::checksum::record_checksum;
use super::{pack_name, unpack_name, CodecError, NAME_LEN, PAXOS_DISK_CLEAR, PAXOS_DISK_MAGIC};
use crate::{Generation, HostId, Lver, Timestamp};

/// Canonical state of a lease: delta lease host slot, or paxos resource leader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderRecord {
    pub magic: u32,
    pub version: u32,
    pub flags: u32,
    pub sector_size: u32,
    pub num_hosts: u32,
    pub max_hosts: u32,
    pub owner_id: HostId,
    pub owner_generation: Generation,
    pub lver: Lver,
    pub timestamp: Timestamp,
    pub space_name: String,
    pub resource_name: String,
    pub io_timeout: u32,
    pub write_id: HostId,
    pub write_generation: Generation,
    pub write_timestamp: Timestamp,
}

impl LeaderRecord {
    pub const ENCODED_LEN: usize = 4 + 4 + 4 + 4 + 4 + 4 + 8 + 8 + 8 + 8 + NAME_LEN + NAME_LEN + 4 + 8 + 8 + 8 + 4;

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.timestamp == crate::LEASE_FREE
    }

    /// A record with sensible zeroed/free defaults for a given lockspace+resource pair,
    /// suitable as the post-`init` state before any host has acquired it.
    #[must_use]
    pub fn free(space_name: &str, resource_name: &str, sector_size: u32, num_hosts: u32, max_hosts: u32, io_timeout: u32) -> Self {
        Self {
            magic: PAXOS_DISK_MAGIC,
            version: super::CODEC_VERSION,
            flags: 0,
            sector_size,
            num_hosts,
            max_hosts,
            owner_id: 0,
            owner_generation: 0,
            lver: 0,
            timestamp: crate::LEASE_FREE,
            space_name: space_name.to_string(),
            resource_name: resource_name.to_string(),
            io_timeout,
            write_id: 0,
            write_generation: 0,
            write_timestamp: 0,
        }
    }

    #[must_use]
    pub fn cleared(mut self) -> Self {
        self.magic = PAXOS_DISK_CLEAR;
        self.timestamp = crate::LEASE_FREE;
        self
    }

    /// Encodes this record, including a correctly-computed trailing checksum.
    ///
    /// # Errors
    /// Returns [`CodecError::NameTooLong`] if either name does not fit in [`NAME_LEN`] bytes.
    pub fn encode(&self) -> Result<[u8; Self::ENCODED_LEN], CodecError> {
        let mut buf = [0u8; Self::ENCODED_LEN];
        let mut off = 0;
        write_u32(&mut buf, &mut off, self.magic);
        write_u32(&mut buf, &mut off, self.version);
        write_u32(&mut buf, &mut off, self.flags);
        write_u32(&mut buf, &mut off, self.sector_size);
        write_u32(&mut buf, &mut off, self.num_hosts);
        write_u32(&mut buf, &mut off, self.max_hosts);
        write_u64(&mut buf, &mut off, u64::from(self.owner_id));
        write_u64(&mut buf, &mut off, self.owner_generation);
        write_u64(&mut buf, &mut off, self.lver);
        write_u64(&mut buf, &mut off, self.timestamp);
        write_name(&mut buf, &mut off, &self.space_name)?;
        write_name(&mut buf, &mut off, &self.resource_name)?;
        write_u32(&mut buf, &mut off, self.io_timeout);
        write_u64(&mut buf, &mut off, u64::from(self.write_id));
        write_u64(&mut buf, &mut off, self.write_generation);
        write_u64(&mut buf, &mut off, self.write_timestamp);

        debug_assert_eq!(off, Self::ENCODED_LEN - 4);
        let checksum = record_checksum(&buf[..off]);
        write_u32(&mut buf, &mut off, checksum);
        Ok(buf)
    }

    /// Decodes and checksum-verifies a record.
    ///
    /// # Errors
    /// Returns [`CodecError::ShortBuffer`] if `buf` is too short, or
    /// [`CodecError::LeaderChecksum`] if the trailing checksum does not match.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(CodecError::ShortBuffer);
        }
        let payload_len = Self::ENCODED_LEN - 4;
        let expected = record_checksum(&buf[..payload_len]);
        let actual = read_u32(&buf[payload_len..Self::ENCODED_LEN]);
        if expected != actual {
            return Err(CodecError::LeaderChecksum);
        }

        let mut off = 0;
        let magic = read_u32_adv(buf, &mut off);
        let version = read_u32_adv(buf, &mut off);
        let flags = read_u32_adv(buf, &mut off);
        let sector_size = read_u32_adv(buf, &mut off);
        let num_hosts = read_u32_adv(buf, &mut off);
        let max_hosts = read_u32_adv(buf, &mut off);
        let owner_id = read_u64_adv(buf, &mut off) as HostId;
        let owner_generation = read_u64_adv(buf, &mut off);
        let lver = read_u64_adv(buf, &mut off);
        let timestamp = read_u64_adv(buf, &mut off);
        let space_name = unpack_name(read_bytes_adv(buf, &mut off, NAME_LEN));
        let resource_name = unpack_name(read_bytes_adv(buf, &mut off, NAME_LEN));
        let io_timeout = read_u32_adv(buf, &mut off);
        let write_id = read_u64_adv(buf, &mut off) as HostId;
        let write_generation = read_u64_adv(buf, &mut off);
        let write_timestamp = read_u64_adv(buf, &mut off);

        Ok(Self {
            magic,
            version,
            flags,
            sector_size,
            num_hosts,
            max_hosts,
            owner_id,
            owner_generation,
            lver,
            timestamp,
            space_name,
            resource_name,
            io_timeout,
            write_id,
            write_generation,
            write_timestamp,
        })
    }
}

fn write_u32(buf: &mut [u8], off: &mut usize, v: u32) {
    buf[*off..*off + 4].copy_from_slice(&v.to_le_bytes());
    *off += 4;
}

fn write_u64(buf: &mut [u8], off: &mut usize, v: u64) {
    buf[*off..*off + 8].copy_from_slice(&v.to_le_bytes());
    *off += 8;
}

fn write_name(buf: &mut [u8], off: &mut usize, name: &str) -> Result<(), CodecError> {
    let packed: [u8; NAME_LEN] = pack_name(name)?;
    buf[*off..*off + NAME_LEN].copy_from_slice(&packed);
    *off += NAME_LEN;
    Ok(())
}

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_le_bytes(buf[..4].try_into().unwrap())
}

fn read_u32_adv(buf: &[u8], off: &mut usize) -> u32 {
    let v = read_u32(&buf[*off..*off + 4]);
    *off += 4;
    v
}

fn read_u64_adv(buf: &[u8], off: &mut usize) -> u64 {
    let v = u64::from_le_bytes(buf[*off..*off + 8].try_into().unwrap());
    *off += 8;
    v
}

fn read_bytes_adv<'a>(buf: &'a [u8], off: &mut usize, len: usize) -> &'a [u8] {
    let v = &buf[*off..*off + len];
    *off += len;
    v
}
