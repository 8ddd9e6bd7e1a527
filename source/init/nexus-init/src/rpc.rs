// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Request decoding and the HANDSHAKE / MEMORY handlers
//! OWNERS: @runtime
//! STATUS: Functional
//! TEST_COVERAGE: 7 unit tests
//!
//! Handlers decide; they never send. Each returns the response to park.

use log::{debug, info};
use nexus_abi::{init_rpc, Cap, ClientId, Rights, Word};
use nexus_ipc::Message;

use crate::continuation::PendingResponse;
use crate::error::DispatchError;
use crate::mem::{frame_alloc, FrameAllocator, Grant};
use crate::registry::{ListenerId, Registry};

/// Decoded request.
#[derive(Debug, PartialEq, Eq)]
pub enum Request {
    /// `{HANDSHAKE}` + the client's receive endpoint.
    Handshake {
        /// Capability to the client's receive endpoint.
        remote: Cap,
    },
    /// `{MEMORY, client_id, requested_size}` + an empty slot.
    Memory {
        /// Client id word as received.
        client: Word,
        /// Requested size in bytes.
        bytes: u64,
        /// Slot the frame is retyped into.
        slot: Option<Cap>,
    },
}

impl Request {
    /// Decodes a non-empty message received on `listener`.
    pub fn decode(listener: ListenerId, message: Message) -> Result<Self, DispatchError> {
        let (words, cap) = message.into_parts();
        let opcode = words.first().copied().ok_or(DispatchError::Malformed { listener, opcode: 0, words: 0 })?;
        match opcode {
            init_rpc::HANDSHAKE => {
                let remote = cap
                    .filter(|cap| cap.endpoint_id().is_some() && cap.rights().contains(Rights::SEND))
                    .ok_or(DispatchError::BadCapability { listener })?;
                Ok(Self::Handshake { remote })
            }
            init_rpc::MEMORY => match words[..] {
                [_, client, bytes, ..] => Ok(Self::Memory { client, bytes, slot: cap }),
                _ => Err(DispatchError::Malformed { listener, opcode, words: words.len() }),
            },
            opcode => Err(DispatchError::UnknownOperation { listener, opcode }),
        }
    }
}

/// Registers a client bound to `listener` and answers with its id.
pub fn handshake(
    registry: &mut Registry,
    listener: ListenerId,
    remote: Cap,
) -> Result<PendingResponse, DispatchError> {
    let client = registry
        .register(listener, remote)
        .map_err(|_| DispatchError::RegistryExhausted { listener })?;
    info!(target: "init::rpc", "{listener}: handshake -> {client}");
    Ok(PendingResponse::Handshake { client })
}

/// Resolves the client named by `client_word` on `listener`.
pub fn resolve_client(
    registry: &Registry,
    listener: ListenerId,
    client_word: Word,
) -> Result<ClientId, DispatchError> {
    let unknown = DispatchError::UnknownClient { listener, client: client_word };
    let id = ClientId::from_word(client_word).ok_or(unknown)?;
    match registry.lookup(id) {
        Ok(conn) if conn.bound_to(listener) => Ok(id),
        _ => Err(unknown),
    }
}

/// Allocates a frame for a registered client.
///
/// Allocation failures become a FAILED response; only an unresolvable client is an error.
pub fn memory_grant<A>(
    registry: &Registry,
    allocator: &mut A,
    listener: ListenerId,
    client_word: Word,
    bytes: u64,
    slot: Option<Cap>,
) -> Result<PendingResponse, DispatchError>
where
    A: FrameAllocator + ?Sized,
{
    let client = resolve_client(registry, listener, client_word)?;
    let outcome = frame_alloc(allocator, slot, bytes).map(|(frame, bytes)| Grant { frame, bytes });
    match &outcome {
        Ok(grant) => debug!(target: "init::rpc", "{client}: granted {:#x} bytes (asked {bytes:#x})", grant.bytes),
        Err(err) => info!(target: "init::rpc", "{client}: memory request {bytes:#x} failed: {err}"),
    }
    Ok(PendingResponse::MemoryGrant { client, outcome })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{MemError, RamAllocator};
    use nexus_abi::EndpointId;

    fn peer(raw: u32) -> Cap {
        Cap::endpoint(EndpointId::new(raw), Rights::ENDPOINT_PEER)
    }

    const L0: ListenerId = ListenerId::new(0);

    #[test]
    fn decodes_handshake() {
        let request = Request::decode(L0, Message::fixed([init_rpc::HANDSHAKE], Some(peer(4)))).unwrap();
        assert_eq!(request, Request::Handshake { remote: peer(4) });
    }

    #[test]
    fn handshake_without_endpoint_rejected() {
        let err = Request::decode(L0, Message::fixed([init_rpc::HANDSHAKE], None)).unwrap_err();
        assert_eq!(err, DispatchError::BadCapability { listener: L0 });
        let recv_only = Cap::endpoint(EndpointId::new(1), Rights::RECV);
        let err = Request::decode(L0, Message::fixed([init_rpc::HANDSHAKE], Some(recv_only))).unwrap_err();
        assert_eq!(err.wire_detail(), Some(init_rpc::ERR_BAD_CAPABILITY));
    }

    #[test]
    fn short_memory_request_is_malformed() {
        let err = Request::decode(L0, Message::fixed([init_rpc::MEMORY, 0], Some(Cap::null()))).unwrap_err();
        assert_eq!(err, DispatchError::Malformed { listener: L0, opcode: init_rpc::MEMORY, words: 2 });
    }

    #[test]
    fn unknown_opcode_reported() {
        let err = Request::decode(L0, Message::fixed([0x99, 1, 2], None)).unwrap_err();
        assert_eq!(err, DispatchError::UnknownOperation { listener: L0, opcode: 0x99 });
        assert_eq!(err.wire_detail(), Some(init_rpc::ERR_UNKNOWN_OPERATION));
    }

    #[test]
    fn handshake_assigns_dense_ids() {
        let mut registry = Registry::new();
        for expected in 0..3u32 {
            let response = handshake(&mut registry, ListenerId::new(expected as usize), peer(expected)).unwrap();
            assert_eq!(response, PendingResponse::Handshake { client: ClientId::new(expected) });
        }
    }

    #[test]
    fn memory_grant_requires_client_bound_to_listener() {
        let mut registry = Registry::new();
        let mut ram = RamAllocator::new(0, 1 << 20, 4096).unwrap();
        handshake(&mut registry, ListenerId::new(0), peer(0)).unwrap();
        handshake(&mut registry, ListenerId::new(1), peer(1)).unwrap();

        let err = memory_grant(&registry, &mut ram, ListenerId::new(1), 0, 4096, None).unwrap_err();
        assert_eq!(err, DispatchError::UnknownClient { listener: ListenerId::new(1), client: 0 });
        let err = memory_grant(&registry, &mut ram, L0, 7, 4096, None).unwrap_err();
        assert_eq!(err.wire_detail(), Some(init_rpc::ERR_UNKNOWN_CLIENT));
        let err = memory_grant(&registry, &mut ram, L0, u64::MAX, 4096, None).unwrap_err();
        assert!(matches!(err, DispatchError::UnknownClient { .. }));
        assert_eq!(ram.free_bytes(), 1 << 20, "nothing allocated for rejected requests");
    }

    #[test]
    fn memory_grant_turns_allocation_failure_into_response() {
        let mut registry = Registry::new();
        let mut ram = RamAllocator::new(0, 8192, 4096).unwrap();
        handshake(&mut registry, L0, peer(0)).unwrap();

        let ok = memory_grant(&registry, &mut ram, L0, 0, 5000, Some(Cap::null())).unwrap();
        let PendingResponse::MemoryGrant { outcome: Ok(grant), .. } = ok else {
            panic!("expected a granted frame");
        };
        assert_eq!(grant.bytes, 8192);

        let failed = memory_grant(&registry, &mut ram, L0, 0, 1, Some(Cap::null())).unwrap();
        assert!(matches!(
            failed,
            PendingResponse::MemoryGrant { outcome: Err(MemError::OutOfMemory { .. }), .. }
        ));
    }
}
