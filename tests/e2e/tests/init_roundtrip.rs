// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use nexus_abi::{init_rpc, Cap, ClientId, Rights};
use nexus_e2e::{small_config, Harness, CLIENT_WAIT};
use nexus_init::{DispatchError, InitConfig, RpcError};
use nexus_ipc::{IpcError, Message};

const PAGE: u64 = 4096;

#[test]
fn handshake_then_memory_for_two_clients() {
    let mut harness = Harness::new(&small_config());
    let (_, mut first) = harness.connect();
    let (_, mut second) = harness.connect();

    let ((id_a, grant_a), errors) = harness.drive(|| {
        let id = first.handshake().unwrap();
        (id, first.request_memory(PAGE).unwrap())
    });
    assert!(errors.is_empty(), "{errors:?}");
    assert_eq!(id_a, ClientId::new(0));
    assert!(grant_a.bytes >= PAGE);

    let ((id_b, grant_b), errors) = harness.drive(|| {
        let id = second.handshake().unwrap();
        (id, second.request_memory(PAGE).unwrap())
    });
    assert!(errors.is_empty(), "{errors:?}");
    assert_eq!(id_b, ClientId::new(1));

    let region_a = grant_a.frame.frame_region().unwrap();
    let region_b = grant_b.frame.frame_region().unwrap();
    assert!(region_a.bytes() >= PAGE && region_b.bytes() >= PAGE);
    assert!(!region_a.overlaps(&region_b));
    assert!(grant_a.frame.rights().contains(Rights::MAP));
    assert_eq!(harness.server().stats().grants, 2);
}

#[test]
fn ids_follow_handshake_order() {
    let mut harness = Harness::new(&small_config());
    let mut clients: Vec<_> = (0..5).map(|_| harness.connect().1).collect();
    let (ids, errors) = harness.drive(|| clients.iter_mut().map(|c| c.handshake().unwrap()).collect::<Vec<_>>());
    assert!(errors.is_empty());
    assert_eq!(ids, (0..5).map(ClientId::new).collect::<Vec<_>>());
    assert_eq!(harness.server().registry().len(), 5);
}

#[test]
fn memory_response_reaches_only_the_requesting_client() {
    let mut harness = Harness::new(&small_config());
    let (_, mut first) = harness.connect();
    let (_, mut second) = harness.connect();
    let (_, errors) = harness.drive(|| {
        first.handshake().unwrap();
        second.handshake().unwrap();
        let grant = second.request_memory(3 * PAGE).unwrap();
        assert_eq!(grant.bytes, 3 * PAGE);
    });
    assert!(errors.is_empty());
    assert_eq!(first.endpoint().try_recv().unwrap_err(), IpcError::WouldBlock);
    assert_eq!(second.endpoint().try_recv().unwrap_err(), IpcError::WouldBlock);
}

#[test]
fn never_issued_client_id_is_rejected() {
    let mut harness = Harness::new(&small_config());
    let (listener, mut first) = harness.connect();
    let (_, mut second) = harness.connect();
    let free_before = harness.server().allocator().free_bytes();

    let ((forged, foreign), errors) = harness.drive(|| {
        first.handshake().unwrap();
        second.handshake().unwrap();
        let forged = first.call(Message::fixed([init_rpc::MEMORY, 7, PAGE], Some(Cap::null()))).unwrap();
        let foreign = first.call(Message::fixed([init_rpc::MEMORY, 1, PAGE], Some(Cap::null()))).unwrap();
        (forged, foreign)
    });
    assert_eq!(forged.words(), &[init_rpc::STATUS_FAILED, init_rpc::ERR_UNKNOWN_CLIENT, 0]);
    assert!(!forged.has_cap());
    assert_eq!(foreign.words(), &[init_rpc::STATUS_FAILED, init_rpc::ERR_UNKNOWN_CLIENT, 0]);
    assert_eq!(
        errors,
        vec![
            DispatchError::UnknownClient { listener, client: 7 },
            DispatchError::UnknownClient { listener, client: 1 },
        ]
    );
    assert_eq!(second.endpoint().try_recv().unwrap_err(), IpcError::WouldBlock, "no misroute");
    assert_eq!(harness.server().allocator().free_bytes(), free_before);

    let (grant, errors) = harness.drive(|| first.request_memory(PAGE));
    assert!(errors.is_empty());
    assert!(grant.is_ok(), "channel keeps serving");
}

#[test]
fn oversized_request_fails_and_channel_survives() {
    let mut harness = Harness::new(&small_config());
    let (_, mut client) = harness.connect();
    let (results, errors) = harness.drive(|| {
        client.handshake().unwrap();
        [
            client.request_memory(1 << 40).map(|g| g.bytes),
            client.request_memory(u64::MAX).map(|g| g.bytes),
            client.request_memory(0).map(|g| g.bytes),
            client.request_memory(PAGE).map(|g| g.bytes),
        ]
    });
    assert!(errors.is_empty(), "allocation failures are responses, not dispatch errors");
    assert_eq!(results[0], Err(RpcError::Denied { detail: init_rpc::ERR_OUT_OF_MEMORY }));
    assert_eq!(results[1], Err(RpcError::Denied { detail: init_rpc::ERR_SIZE_OVERFLOW }));
    assert_eq!(results[2], Err(RpcError::Denied { detail: init_rpc::ERR_ZERO_SIZE }));
    assert_eq!(results[3], Ok(PAGE));
    assert_eq!(harness.server().stats().failed_grants, 3);
}

#[test]
fn failed_response_carries_zero_size_and_no_capability() {
    let mut harness = Harness::new(&small_config());
    let (_, mut client) = harness.connect();
    let (reply, _) = harness.drive(|| {
        let id = client.handshake().unwrap();
        client.endpoint().alloc_recv_slot().unwrap();
        client.call(Message::fixed([init_rpc::MEMORY, id.to_word(), 1 << 40], Some(Cap::null()))).unwrap()
    });
    assert_eq!(reply.words()[0], init_rpc::STATUS_FAILED);
    assert_ne!(reply.words()[1], 0);
    assert_eq!(reply.words()[2], 0);
    assert!(!reply.has_cap());
}

#[test]
fn unknown_opcode_answered_and_loop_continues() {
    let mut harness = Harness::new(&small_config());
    let (listener, mut client) = harness.connect();
    let ((reply, grant), errors) = harness.drive(|| {
        client.handshake().unwrap();
        let reply = client.call(Message::fixed([0x42], None)).unwrap();
        (reply, client.request_memory(PAGE))
    });
    assert_eq!(reply.words(), &[init_rpc::STATUS_FAILED, init_rpc::ERR_UNKNOWN_OPERATION, 0]);
    assert_eq!(errors, vec![DispatchError::UnknownOperation { listener, opcode: 0x42 }]);
    assert!(grant.is_ok());
}

#[test]
fn pipelined_requests_answered_in_order() {
    let config = InitConfig { channel_slots: 1, ..small_config() };
    let mut harness = Harness::new(&config);
    let (_, initep) = harness.channel();
    let (endpoint, _) = harness.router().create_endpoint();
    let router = harness.router().clone();

    let ((first, second), errors) = harness.drive(move || {
        let remote = endpoint.mint(Rights::ENDPOINT_PEER);
        router.send(&initep, Message::fixed([init_rpc::HANDSHAKE], Some(remote)), CLIENT_WAIT).unwrap();
        let id = endpoint.recv(CLIENT_WAIT).unwrap().word(1).unwrap();
        for bytes in [PAGE, 2 * PAGE] {
            let request = Message::fixed([init_rpc::MEMORY, id, bytes], Some(Cap::null()));
            router.send(&initep, request, CLIENT_WAIT).unwrap();
        }
        endpoint.alloc_recv_slot().unwrap();
        let first = endpoint.recv(CLIENT_WAIT).unwrap();
        endpoint.alloc_recv_slot().unwrap();
        let second = endpoint.recv(CLIENT_WAIT).unwrap();
        (first, second)
    });
    assert!(errors.is_empty(), "{errors:?}");
    assert_eq!(first.words(), &[init_rpc::STATUS_OK, 0, PAGE]);
    assert_eq!(second.words(), &[init_rpc::STATUS_OK, 0, 2 * PAGE]);
}
