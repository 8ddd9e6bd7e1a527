// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Capability-carrying message channels between init and its clients
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 10 unit tests
//!
//! PUBLIC API:
//!   - Message: bounded word payload plus one capability slot
//!   - Wait enum: Wait behavior for blocking operations
//!   - IpcError: IPC error types
//!   - Router/Endpoint: host endpoint table and receive handles
//!
//! DEPENDENCIES:
//!   - parking_lot: endpoint table lock and readiness condvar
//!   - nexus-abi: capability and word types

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

use core::fmt;
use core::time::Duration;

use nexus_abi::{Cap, Word, MAX_WORDS};

/// Result type returned by IPC operations.
pub type Result<T> = core::result::Result<T, IpcError>;

/// Behaviour of a blocking call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Block until the operation completes.
    Blocking,
    /// Return immediately if no progress can be made.
    NonBlocking,
    /// Block until either the operation completes or the timeout expires.
    Timeout(Duration),
}

impl Wait {
    /// Returns `true` when the caller requested a non-blocking attempt.
    pub const fn is_non_blocking(self) -> bool {
        matches!(self, Self::NonBlocking)
    }

    /// Converts a [`Wait::Timeout`] variant into its [`Duration`].
    pub const fn timeout(self) -> Option<Duration> {
        match self {
            Self::Timeout(duration) => Some(duration),
            Self::Blocking | Self::NonBlocking => None,
        }
    }
}

/// Errors produced by the IPC runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpcError {
    /// Operation could not progress without blocking.
    WouldBlock,
    /// The receive raced with the kernel; retrying delivers the same message.
    Transient,
    /// The head message carries a capability but no receive slot is provisioned.
    NoRecvSlot,
    /// No capability slots left to provision.
    NoSpace,
    /// The caller exceeded the requested timeout.
    Timeout,
    /// The opposite endpoint disconnected.
    Disconnected,
    /// Message exceeds [`MAX_WORDS`].
    TooLong,
    /// Capability does not name an endpoint or lacks the required rights.
    BadCapability,
}

impl IpcError {
    /// Returns `true` for failures that are resolved by re-arming the receive.
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Transient | Self::NoRecvSlot)
    }
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WouldBlock => write!(f, "operation would block"),
            Self::Transient => write!(f, "transient receive failure"),
            Self::NoRecvSlot => write!(f, "no receive slot provisioned"),
            Self::NoSpace => write!(f, "capability slots exhausted"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Disconnected => write!(f, "peer disconnected"),
            Self::TooLong => write!(f, "message exceeds {MAX_WORDS} words"),
            Self::BadCapability => write!(f, "capability cannot reach an endpoint"),
        }
    }
}

impl std::error::Error for IpcError {}

/// A single channel message: up to [`MAX_WORDS`] words and one capability.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Message {
    words: Vec<Word>,
    cap: Option<Cap>,
}

impl Message {
    /// Builds a message, rejecting payloads longer than [`MAX_WORDS`].
    pub fn new(words: &[Word], cap: Option<Cap>) -> Result<Self> {
        if words.len() > MAX_WORDS {
            return Err(IpcError::TooLong);
        }
        Ok(Self { words: words.to_vec(), cap })
    }

    /// Builds a message from a fixed-size payload checked at compile time.
    pub fn fixed<const N: usize>(words: [Word; N], cap: Option<Cap>) -> Self {
        const { assert!(N <= MAX_WORDS) };
        Self { words: words.to_vec(), cap }
    }

    /// Payload words.
    pub fn words(&self) -> &[Word] {
        &self.words
    }

    /// Word at `index`, if present.
    pub fn word(&self, index: usize) -> Option<Word> {
        self.words.get(index).copied()
    }

    /// Returns `true` when a capability rides along.
    pub fn has_cap(&self) -> bool {
        self.cap.is_some()
    }

    /// Moves the attached capability out of the message.
    pub fn take_cap(&mut self) -> Option<Cap> {
        self.cap.take()
    }

    /// Splits the message into words and capability.
    pub fn into_parts(self) -> (Vec<Word>, Option<Cap>) {
        (self.words, self.cap)
    }
}

/// Failed send: the message comes back to the caller so its capability is not lost.
#[derive(Debug, PartialEq, Eq)]
pub struct SendError {
    /// Reason the send failed.
    pub error: IpcError,
    /// Undelivered message.
    pub message: Message,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "send failed: {}", self.error)
    }
}

impl std::error::Error for SendError {}

mod host;
pub use host::{Endpoint, Router, RouterConfig};
