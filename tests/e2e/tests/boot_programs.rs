// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::time::{Duration, Instant};

use nexus_abi::{ClientId, CoreId};
use nexus_init::programs::ProgramCatalog;
use nexus_init::{
    bootstrap, BootArgs, HostPlatform, InitClient, InitConfig, InitError, ListenerClass, ListenerId, Platform,
    ProcessHandle, RamAllocator, RpcError, Server,
};
use nexus_ipc::Router;

fn serve_until_exit(server: &mut Server<RamAllocator>, processes: Vec<ProcessHandle>) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while processes.iter().any(|p| !p.is_finished()) {
        assert!(Instant::now() < deadline, "boot programs did not finish");
        let _ = server.event_dispatch_timeout(Duration::from_millis(5));
    }
    server.run_until_idle();
    for process in processes {
        let name = process.name().to_string();
        assert!(process.join(), "{name} panicked");
    }
}

#[test]
fn hello_handshakes_and_gets_a_page() {
    let config = InitConfig { ram_bytes: 16 * 4096, ..InitConfig::default() };
    let router = Router::new(config.router_config());
    let mut platform = HostPlatform::new(router.clone(), CoreId::new(1));
    let (mut server, processes) = bootstrap(&config, router, &mut platform).unwrap();
    assert_eq!(processes.len(), 1);
    assert_eq!(processes[0].name(), "hello");

    serve_until_exit(&mut server, processes);
    assert_eq!(server.registry().len(), 1);
    assert_eq!(
        server.listener_class(ListenerId::new(0)),
        Some(ListenerClass::Client { latest: ClientId::new(0) })
    );
    assert_eq!(server.stats().grants, 1);
    assert_eq!(server.allocator().free_bytes(), 15 * 4096);
}

fn greedy(mut client: InitClient) -> Result<(), RpcError> {
    client.handshake()?;
    loop {
        client.request_memory(4096)?;
    }
}

#[test]
fn exhausting_program_does_not_stop_others() {
    let config = InitConfig {
        ram_bytes: 4 * 4096,
        boot_programs: vec!["greedy".to_string(), "hello".to_string()],
        ..InitConfig::default()
    };
    let router = Router::new(config.router_config());
    let mut catalog = ProgramCatalog::builtin();
    catalog.insert("greedy", greedy);
    let mut platform = HostPlatform::with_catalog(router.clone(), CoreId::new(1), catalog);
    let (mut server, processes) = bootstrap(&config, router, &mut platform).unwrap();

    serve_until_exit(&mut server, processes);
    assert_eq!(server.registry().len(), 2);
    assert_eq!(server.allocator().free_bytes(), 0);
    assert!(server.stats().failed_grants >= 1);
}

#[test]
fn unknown_boot_program_is_fatal() {
    let config = InitConfig { boot_programs: vec!["ghost".to_string()], ..InitConfig::default() };
    let router = Router::new(config.router_config());
    let mut platform = HostPlatform::new(router.clone(), CoreId::new(1));
    let err = bootstrap(&config, router, &mut platform).err().expect("bootstrap must fail");
    assert!(matches!(err, InitError::UnknownProgram(name) if name == "ghost"));
}

#[test]
fn unusable_ram_window_is_fatal() {
    let config = InitConfig { ram_base: 0x1001, ..InitConfig::default() };
    let router = Router::new(config.router_config());
    let mut platform = HostPlatform::new(router.clone(), CoreId::new(1));
    let err = bootstrap(&config, router, &mut platform).err().expect("bootstrap must fail");
    assert!(matches!(err, InitError::RamInit(_)));
}

#[test]
fn config_file_drives_bootstrap() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("init.toml");
    fs::write(&path, "ram_bytes = 32768\nboot_programs = []\nchannel_slots = 2\n").unwrap();
    let args = BootArgs::parse(["--core", "3", "--config", path.to_str().unwrap()]).unwrap();

    let config = InitConfig::load(args.config.as_deref().unwrap()).unwrap();
    config.validate().unwrap();
    let router = Router::new(config.router_config());
    let mut platform = HostPlatform::new(router.clone(), args.core.unwrap());
    args.check_core(platform.core_id()).unwrap();
    let (server, processes) = bootstrap(&config, router, &mut platform).unwrap();
    assert!(processes.is_empty());
    assert_eq!(server.allocator().total_bytes(), 32768);
}
