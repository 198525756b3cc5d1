// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Crate-wide error type.
//!
//! Each component module (`disk`, `codec`, `delta`, `paxos`, `token`) defines its own
//! narrow `thiserror` enum for internal use; this module aggregates them into the single
//! surface a collaborator (the client-protocol layer, the direct-edit tool, language
//! bindings) actually needs to match on. [`Error::code`] preserves the historical negative
//! integer taxonomy from the specification's error handling design for callers that still
//! expect it.

use thiserror::Error;

use crate::codec::CodecError;
use crate::delta::DeltaError;
use crate::disk::DiskError;
use crate::paxos::PaxosError;
use crate::token::TokenError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Disk(#[from] DiskError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Delta(#[from] DeltaError),
    #[error(transparent)]
    Paxos(#[from] PaxosError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("no resource is registered under that name")]
    UnknownResource,
    #[error("no lockspace is registered under that name")]
    UnknownLockspace,
}

impl Error {
    /// The historical negative integer error code for this error, as enumerated in the
    /// specification's error handling design (`AIO_TIMEOUT`, `ACQUIRE_IDLIVE`, ...).
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Error::Disk(e) => e.code(),
            Error::Codec(e) => e.code(),
            Error::Delta(e) => e.code(),
            Error::Paxos(e) => e.code(),
            Error::Token(e) => e.code(),
            Error::UnknownResource | Error::UnknownLockspace => -230,
        }
    }
}
