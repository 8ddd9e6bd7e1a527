// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Deferred responses parked until their channel can take a send
//! OWNERS: @runtime
//! STATUS: Functional
//! TEST_COVERAGE: 4 unit tests
//!
//! Each listener holds at most one parked response. The response owns any capability it
//! transfers until the send succeeds.

use nexus_abi::{init_rpc, ClientId, Word};
use nexus_ipc::Message;

use crate::mem::{Grant, MemError};
use crate::registry::ListenerId;

/// Response produced by a handler and not yet sent.
#[derive(Debug, PartialEq, Eq)]
pub enum PendingResponse {
    /// `{STATUS_OK, client_id}` without capability.
    Handshake {
        /// Newly registered client.
        client: ClientId,
    },
    /// `{STATUS_OK, 0, bytes}` + frame, or `{STATUS_FAILED, detail, 0}`.
    MemoryGrant {
        /// Requesting client.
        client: ClientId,
        /// Granted frame or allocation failure.
        outcome: Result<Grant, MemError>,
    },
    /// `{STATUS_FAILED, detail, 0}` for a request the server could not serve.
    Rejected {
        /// Client answered.
        client: ClientId,
        /// Wire error detail.
        detail: Word,
    },
}

impl PendingResponse {
    /// Client the response is addressed to.
    pub fn client(&self) -> ClientId {
        match self {
            Self::Handshake { client }
            | Self::MemoryGrant { client, .. }
            | Self::Rejected { client, .. } => *client,
        }
    }

    /// Encodes the response into its wire message, moving any capability into it.
    pub fn encode(self) -> Message {
        match self {
            Self::Handshake { client } => Message::fixed([init_rpc::STATUS_OK, client.to_word()], None),
            Self::MemoryGrant { outcome: Ok(Grant { frame, bytes }), .. } => {
                Message::fixed([init_rpc::STATUS_OK, 0, bytes], Some(frame))
            }
            Self::MemoryGrant { outcome: Err(err), .. } => {
                Message::fixed([init_rpc::STATUS_FAILED, err.code(), 0], None)
            }
            Self::Rejected { detail, .. } => Message::fixed([init_rpc::STATUS_FAILED, detail, 0], None),
        }
    }
}

/// A parked send: either a fresh response or one already encoded by a send that would block.
#[derive(Debug)]
pub enum Continuation {
    /// Response waiting for its first send attempt.
    Fresh(PendingResponse),
    /// Encoded response handed back by a blocked send.
    Retry {
        /// Recipient.
        client: ClientId,
        /// Message to resend.
        message: Message,
    },
}

impl Continuation {
    /// Recipient of the parked response.
    pub fn client(&self) -> ClientId {
        match self {
            Self::Fresh(response) => response.client(),
            Self::Retry { client, .. } => *client,
        }
    }

    /// Wire message to send.
    pub fn into_message(self) -> Message {
        match self {
            Self::Fresh(response) => response.encode(),
            Self::Retry { message, .. } => message,
        }
    }
}

/// Per-listener parking area for responses awaiting send readiness.
#[derive(Debug, Default)]
pub struct Scheduler {
    parked: Vec<Option<Continuation>>,
}

impl Scheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks `continuation` for `listener`, returning any continuation it displaces.
    pub fn park(&mut self, listener: ListenerId, continuation: Continuation) -> Option<Continuation> {
        let index = listener.index();
        if self.parked.len() <= index {
            self.parked.resize_with(index + 1, || None);
        }
        self.parked[index].replace(continuation)
    }

    /// Recipient of the response parked for `listener`.
    pub fn peek_client(&self, listener: ListenerId) -> Option<ClientId> {
        self.parked.get(listener.index()).and_then(Option::as_ref).map(Continuation::client)
    }

    /// Removes the continuation parked for `listener`.
    pub fn take(&mut self, listener: ListenerId) -> Option<Continuation> {
        self.parked.get_mut(listener.index()).and_then(Option::take)
    }

    /// Number of parked responses.
    pub fn pending(&self) -> usize {
        self.parked.iter().filter(|slot| slot.is_some()).count()
    }
}
