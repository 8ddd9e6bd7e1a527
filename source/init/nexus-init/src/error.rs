// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Error types for init startup and per-message dispatch
//! OWNERS: @runtime
//!
//! `InitError` is fatal and only produced before the event loop starts.
//! `DispatchError` is reported to the loop for one message and never stops it.

use nexus_abi::{init_rpc, ClientId, CoreId, Word};
use nexus_ipc::IpcError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::mem::MemError;
use crate::registry::ListenerId;

/// Fatal startup failures.
#[derive(Debug, Error)]
pub enum InitError {
    /// Loading or validating the configuration failed.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The boot information argument is not a decimal number.
    #[error("invalid boot information argument {0:?}")]
    InvalidBootInfo(String),
    /// Unrecognised command line argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// No boot information was passed, yet this is the boot core.
    #[error("no boot information on core {core}")]
    MissingBootInfo {
        /// Core the server runs on.
        core: CoreId,
    },
    /// The RAM allocator could not be initialised.
    #[error("RAM allocator initialisation failed: {0}")]
    RamInit(#[source] MemError),
    /// Setting up a server endpoint failed.
    #[error("endpoint setup failed: {0}")]
    Endpoint(#[source] IpcError),
    /// No program with that name exists.
    #[error("program {0} missing from catalog")]
    UnknownProgram(String),
    /// Spawning the process thread failed.
    #[error("process {name} spawn failed: {source}")]
    Spawn {
        /// Program name.
        name: String,
        /// Reason reported by the thread builder.
        source: std::io::Error,
    },
}

/// Failure handling a single channel event.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// `words[0]` is not a known opcode.
    #[error("{listener}: unknown operation {opcode:#x}")]
    UnknownOperation {
        /// Channel the request arrived on.
        listener: ListenerId,
        /// Received opcode.
        opcode: Word,
    },
    /// The client id was never issued on this channel.
    #[error("{listener}: unknown client {client}")]
    UnknownClient {
        /// Channel the request arrived on.
        listener: ListenerId,
        /// Client id word as received.
        client: Word,
    },
    /// The request carried fewer words than its opcode requires.
    #[error("{listener}: malformed request opcode={opcode:#x} words={words}")]
    Malformed {
        /// Channel the request arrived on.
        listener: ListenerId,
        /// Received opcode.
        opcode: Word,
        /// Number of words received.
        words: usize,
    },
    /// The request's capability is missing or cannot be used.
    #[error("{listener}: request capability missing or unusable")]
    BadCapability {
        /// Channel the request arrived on.
        listener: ListenerId,
    },
    /// No client id left to assign.
    #[error("{listener}: client registry exhausted")]
    RegistryExhausted {
        /// Channel the request arrived on.
        listener: ListenerId,
    },
    /// The channel cannot be re-armed; it stops serving.
    #[error("{listener}: channel failed: {source}")]
    ChannelFailed {
        /// Failed channel.
        listener: ListenerId,
        /// Receive or provisioning error.
        source: IpcError,
    },
    /// A response could not be delivered and was dropped.
    #[error("{listener}: response to {client} dropped: {source}")]
    SendFailed {
        /// Channel the request arrived on.
        listener: ListenerId,
        /// Intended recipient.
        client: ClientId,
        /// Send error.
        source: IpcError,
    },
}

impl DispatchError {
    /// Channel the error belongs to.
    pub const fn listener(&self) -> ListenerId {
        match *self {
            Self::UnknownOperation { listener, .. }
            | Self::UnknownClient { listener, .. }
            | Self::Malformed { listener, .. }
            | Self::BadCapability { listener }
            | Self::RegistryExhausted { listener }
            | Self::ChannelFailed { listener, .. }
            | Self::SendFailed { listener, .. } => listener,
        }
    }

    /// Error detail for a `{STATUS_FAILED, detail, 0}` reply, when the client can be answered.
    pub const fn wire_detail(&self) -> Option<Word> {
        match self {
            Self::UnknownOperation { .. } => Some(init_rpc::ERR_UNKNOWN_OPERATION),
            Self::UnknownClient { .. } => Some(init_rpc::ERR_UNKNOWN_CLIENT),
            Self::Malformed { .. } => Some(init_rpc::ERR_MALFORMED),
            Self::BadCapability { .. } => Some(init_rpc::ERR_BAD_CAPABILITY),
            Self::RegistryExhausted { .. } | Self::ChannelFailed { .. } | Self::SendFailed { .. } => None,
        }
    }
}
