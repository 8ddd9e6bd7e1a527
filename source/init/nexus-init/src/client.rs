// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Child-side stubs for the init protocol
//! OWNERS: @runtime
//! STATUS: Functional
//! TEST_COVERAGE: e2e (tests/e2e)
//!
//! PUBLIC API:
//!   - InitClient::connect(): wrap the `initep` capability a process was spawned with
//!   - InitClient::handshake(): obtain a client id
//!   - InitClient::request_memory(): obtain a frame of at least the requested size

use nexus_abi::{init_rpc, Cap, ClientId, Rights, Word};
use nexus_ipc::{Endpoint, IpcError, Message, Router, Wait};
use thiserror::Error;

use crate::mem::Grant;

/// Failures seen by a client of init.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RpcError {
    /// Channel failure.
    #[error("ipc failure: {0}")]
    Ipc(#[from] IpcError),
    /// A memory request was attempted before the handshake.
    #[error("handshake not performed")]
    NotConnected,
    /// Init answered `{STATUS_FAILED, detail, 0}`.
    #[error("request denied (detail {detail:#x})")]
    Denied {
        /// Wire error detail.
        detail: Word,
    },
    /// The response does not follow the protocol.
    #[error("malformed response")]
    Malformed,
}

/// Connection from a child process to init.
pub struct InitClient {
    router: Router,
    initep: Cap,
    endpoint: Endpoint,
    id: Option<ClientId>,
    wait: Wait,
}

impl InitClient {
    /// Creates the client's receive endpoint; requests go to `initep`.
    pub fn connect(router: Router, initep: Cap) -> Self {
        let (endpoint, _) = router.create_endpoint();
        Self { router, initep, endpoint, id: None, wait: Wait::Blocking }
    }

    /// Applies `wait` to every send and receive.
    #[must_use]
    pub fn with_wait(mut self, wait: Wait) -> Self {
        self.wait = wait;
        self
    }

    /// Id assigned by the last successful handshake.
    pub fn id(&self) -> Option<ClientId> {
        self.id
    }

    /// Receive endpoint responses arrive on.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Sends the client's receive endpoint to init and records the id it returns.
    pub fn handshake(&mut self) -> Result<ClientId, RpcError> {
        let remote = self.endpoint.mint(Rights::ENDPOINT_PEER);
        let reply = self.call(Message::fixed([init_rpc::HANDSHAKE], Some(remote)))?;
        let id = match reply.words() {
            [init_rpc::STATUS_OK, id, ..] => ClientId::from_word(*id).ok_or(RpcError::Malformed)?,
            [init_rpc::STATUS_FAILED, detail, ..] => return Err(RpcError::Denied { detail: *detail }),
            _ => return Err(RpcError::Malformed),
        };
        self.id = Some(id);
        Ok(id)
    }

    /// Requests a frame of at least `bytes` bytes.
    pub fn request_memory(&mut self, bytes: u64) -> Result<Grant, RpcError> {
        let id = self.id.ok_or(RpcError::NotConnected)?;
        self.endpoint.alloc_recv_slot()?;
        let reply = self.call(Message::fixed([init_rpc::MEMORY, id.to_word(), bytes], Some(Cap::null())))?;
        let (words, cap) = reply.into_parts();
        match words[..] {
            [init_rpc::STATUS_OK, _, granted, ..] => {
                match cap.filter(|cap| cap.frame_region().is_some()) {
                    Some(frame) if granted >= bytes => Ok(Grant { frame, bytes: granted }),
                    _ => Err(RpcError::Malformed),
                }
            }
            [init_rpc::STATUS_FAILED, detail, ..] => Err(RpcError::Denied { detail }),
            _ => Err(RpcError::Malformed),
        }
    }

    /// Sends a raw request and waits for the reply.
    pub fn call(&mut self, request: Message) -> Result<Message, RpcError> {
        self.router.send(&self.initep, request, self.wait).map_err(|err| RpcError::Ipc(err.error))?;
        Ok(self.endpoint.recv(self.wait)?)
    }
}

impl core::fmt::Debug for InitClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InitClient")
            .field("initep", &self.initep)
            .field("endpoint", &self.endpoint)
            .field("id", &self.id)
            .finish()
    }
}
