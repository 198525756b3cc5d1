// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! On-disk record encoding.
//!
//! Every record is fixed-width, little-endian, and CRC32C-checksummed over its own
//! serialized bytes (checksum field excluded). Records are never produced by reinterpreting
//! an in-memory struct's bytes: each type implements explicit [`encode`]/[`decode`] pairs
//! that read and write individual fields, so the on-disk layout is independent of this
//! process's struct layout, alignment, or endianness.

pub mod checksum;
pub mod dblock;
pub mod leader;
pub mod mode_block;
pub mod request;

pub use dblock::Dblock;
pub use leader::LeaderRecord;
pub use mode_block::ModeBlock;
pub use request::RequestRecord;

use thiserror::Error;

/// Magic identifying a live leader record (delta lease or paxos resource leader).
pub const PAXOS_DISK_MAGIC: u32 = 0x6152_0106;
/// Magic written over a leader record that has been explicitly cleared (`init(clear=true)`).
pub const PAXOS_DISK_CLEAR: u32 = 0x6152_0107;
/// Magic identifying a request record.
pub const REQUEST_DISK_MAGIC: u32 = 0x6152_0108;

/// On-disk format version understood by this codec.
pub const CODEC_VERSION: u32 = 1;

/// `LeaderRecord::flags`: the lease was committed with a short-hold (shared) mode at the
/// time of commit. Informational only; shared-mode enforcement lives in the dblocks' mode
/// blocks, not in this flag.
pub const LFL_SHORT_HOLD: u32 = 0x0000_0001;

/// `Dblock::flags`: the host voluntarily released this resource. Lets another host that
/// already wrote us in as owner (the "writer not owner" race, see paxos module docs) learn
/// that it's safe to proceed without waiting out the full liveness timeout.
pub const DBLOCK_FL_RELEASED: u32 = 0x0000_0001;

/// `ModeBlock::flags`: this host currently holds (or last held) the resource in shared mode.
pub const MBLOCK_SHARED: u32 = 0x0000_0001;

/// Byte offset of the mode block within a dblock sector. The mode block is overlaid after
/// the dblock proper so a single aligned sector read/write covers both.
pub const MBLOCK_OFFSET: usize = dblock::Dblock::ENCODED_LEN;

/// Fixed width of the `space_name`/`resource_name` fields in a [`LeaderRecord`].
pub const NAME_LEN: usize = 48;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("leader record magic mismatch")]
    LeaderMagic,
    #[error("leader record version unsupported")]
    LeaderVersion,
    #[error("leader record lockspace name mismatch")]
    LeaderLockspace,
    #[error("leader record resource name mismatch")]
    LeaderResource,
    #[error("leader record num_hosts out of range")]
    LeaderNumHosts,
    #[error("leader record checksum mismatch")]
    LeaderChecksum,
    #[error("dblock checksum mismatch")]
    DblockChecksum,
    #[error("mode block checksum mismatch")]
    ModeBlockChecksum,
    #[error("request record checksum mismatch")]
    RequestChecksum,
    #[error("buffer too short to decode record")]
    ShortBuffer,
    #[error("name does not fit in fixed-width field")]
    NameTooLong,
}

impl CodecError {
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            CodecError::LeaderMagic => -203,
            CodecError::LeaderVersion => -204,
            CodecError::LeaderLockspace => -205,
            CodecError::LeaderResource => -206,
            CodecError::LeaderNumHosts => -207,
            CodecError::LeaderChecksum | CodecError::ModeBlockChecksum => -208,
            CodecError::DblockChecksum => -209,
            CodecError::RequestChecksum => -231,
            CodecError::ShortBuffer | CodecError::NameTooLong => -232,
        }
    }
}

/// Packs `name` into a fixed-width, NUL-padded field of length `N`.
///
/// # Errors
/// Returns [`CodecError::NameTooLong`] if `name` (as UTF-8 bytes) does not fit.
pub fn pack_name<const N: usize>(name: &str) -> Result<[u8; N], CodecError> {
    let bytes = name.as_bytes();
    if bytes.len() > N {
        return Err(CodecError::NameTooLong);
    }
    let mut out = [0u8; N];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

/// Unpacks a fixed-width, NUL-padded field back into a `String`, stopping at the first NUL.
#[must_use]
pub fn unpack_name(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_round_trip() {
        let packed: [u8; NAME_LEN] = pack_name("lockspace-42").unwrap();
        assert_eq!(unpack_name(&packed), "lockspace-42");
    }

    #[test]
    fn name_too_long_is_rejected() {
        let long_name = "x".repeat(NAME_LEN + 1);
        let result: Result<[u8; NAME_LEN], _> = pack_name(&long_name);
        assert_eq!(result, Err(CodecError::NameTooLong));
    }
}
