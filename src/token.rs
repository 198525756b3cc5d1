// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Resource/token manager (§4.6): serializes concurrent operations on the same resource,
//! tracks which client holds which token, and enforces the per-client resource limit.

use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::disk::Disk;
use crate::paxos::{AcquireFlags, PaxosEngine, PaxosError};
use crate::{TokenId, MAX_RESOURCES_PER_CLIENT};

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error(transparent)]
    Paxos(#[from] PaxosError),
    #[error("client already holds the maximum number of resource tokens")]
    TooManyResources,
    #[error("no token with that id is held by this client")]
    UnknownToken,
}

impl TokenError {
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            TokenError::Paxos(e) => e.code(),
            TokenError::TooManyResources => -227,
            TokenError::UnknownToken => -230,
        }
    }
}

/// A pid's currently-held resource tokens.
#[derive(Default)]
struct ClientSlot {
    tokens: Vec<TokenId>,
}

/// Tracks, per resource, a mutex serializing operations on it and the next token id to hand
/// out. Concurrent operations on *different* resources proceed independently.
pub struct TokenManager<D: Disk> {
    next_token_id: Mutex<TokenId>,
    resource_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    clients: RwLock<HashMap<u32, ClientSlot>>,
    tokens: RwLock<HashMap<TokenId, (u32, String)>>,
    _marker: std::marker::PhantomData<D>,
}

impl<D: Disk> Default for TokenManager<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Disk> TokenManager<D> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_token_id: Mutex::new(1),
            resource_locks: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
            _marker: std::marker::PhantomData,
        }
    }

    async fn resource_lock(&self, resource: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.resource_locks.read().await.get(resource) {
            return Arc::clone(lock);
        }
        let mut locks = self.resource_locks.write().await;
        Arc::clone(locks.entry(resource.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    /// Acquires `resource` on behalf of `pid` via disk-Paxos, registers the resulting token,
    /// and assigns it into the client's slot. Failures roll back: the token is never recorded
    /// if the paxos acquire itself fails, and the acquire is never attempted if the client is
    /// already at its resource limit.
    ///
    /// # Errors
    /// Returns [`TokenError::TooManyResources`] if `pid` already holds
    /// [`MAX_RESOURCES_PER_CLIENT`] tokens, or propagates the underlying paxos error.
    pub async fn acquire_token(&self, pid: u32, resource: &str, engine: &PaxosEngine<D>, flags: AcquireFlags) -> Result<TokenId, TokenError> {
        {
            let clients = self.clients.read().await;
            if clients.get(&pid).is_some_and(|slot| slot.tokens.len() >= MAX_RESOURCES_PER_CLIENT) {
                return Err(TokenError::TooManyResources);
            }
        }

        let lock = self.resource_lock(resource).await;
        let _guard = lock.lock().await;

        engine.acquire(flags).await?;

        let token_id = {
            let mut next = self.next_token_id.lock().await;
            let id = *next;
            *next += 1;
            id
        };

        self.tokens.write().await.insert(token_id, (pid, resource.to_string()));
        self.clients.write().await.entry(pid).or_default().tokens.push(token_id);
        info!("pid {pid} acquired token {token_id} for resource {resource}");
        Ok(token_id)
    }

    /// Releases a single token, via the given engine (already scoped to the token's resource),
    /// and removes it from the client's slot.
    ///
    /// # Errors
    /// Returns [`TokenError::UnknownToken`] if `pid` does not hold `token_id`, or propagates
    /// the underlying paxos error.
    pub async fn release_token(&self, pid: u32, token_id: TokenId, engine: &PaxosEngine<D>) -> Result<(), TokenError> {
        let resource = {
            let mut clients = self.clients.write().await;
            let slot = clients.get_mut(&pid).ok_or(TokenError::UnknownToken)?;
            let position = slot.tokens.iter().position(|&t| t == token_id).ok_or(TokenError::UnknownToken)?;
            slot.tokens.remove(position);
            self.tokens.write().await.remove(&token_id).map(|(_, r)| r).ok_or(TokenError::UnknownToken)?
        };

        let lock = self.resource_lock(&resource).await;
        let _guard = lock.lock().await;
        engine.release().await?;
        info!("pid {pid} released token {token_id} for resource {resource}");
        Ok(())
    }

    /// Releases every token held by `pid`, in the order they were acquired, e.g. when the
    /// client's pid has died. Collects and returns the engines' errors rather than stopping at
    /// the first failure, so one stuck resource does not block releasing the others.
    pub async fn release_all(&self, pid: u32, engines: &HashMap<String, &PaxosEngine<D>>) -> Vec<TokenError> {
        let token_ids: Vec<TokenId> = self.clients.read().await.get(&pid).map(|slot| slot.tokens.clone()).unwrap_or_default();
        let mut errors = Vec::new();
        for token_id in token_ids {
            let Some(resource) = self.tokens.read().await.get(&token_id).map(|(_, r)| r.clone()) else { continue };
            let Some(engine) = engines.get(resource.as_str()) else {
                warn!("no engine registered for resource {resource} while releasing pid {pid}'s tokens");
                continue;
            };
            if let Err(err) = self.release_token(pid, token_id, engine).await {
                errors.push(err);
            }
        }
        errors
    }

    /// Number of tokens currently held by `pid`.
    pub async fn resource_count(&self, pid: u32) -> usize {
        self.clients.read().await.get(&pid).map_or(0, |slot| slot.tokens.len())
    }
}
