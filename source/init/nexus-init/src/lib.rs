// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Root server brokering channels and physical memory for every process on a core
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: unit tests per module + e2e (tests/e2e)
//!
//! PUBLIC API: service_main_loop(), bootstrap(), ReadyNotifier, Server, InitClient
//! DEPENDS_ON: nexus-abi, nexus-ipc
//! INVARIANTS: Emit `init: start` / `init: ready` markers; the event loop never exits
//!
//! Init is the first process on a core. Every other process handshakes with it over a
//! private channel and asks it for frames; init owns the RAM allocator and never hands
//! out a frame twice.

pub mod boot;
pub mod client;
pub mod config;
pub mod continuation;
pub mod dispatch;
pub mod error;
pub mod mem;
pub mod programs;
pub mod registry;
pub mod rpc;

use std::convert::Infallible;
use std::path::Path;

use log::info;
use nexus_abi::CoreId;
use nexus_ipc::Router;

pub use boot::{spawn_process, BootArgs, HostPlatform, Platform, ProcessHandle};
pub use client::{InitClient, RpcError};
pub use config::{ConfigError, InitConfig, DEFAULT_CONFIG_PATH};
pub use continuation::PendingResponse;
pub use dispatch::{ListenerClass, ListenerState, Server, ServerStats};
pub use error::{DispatchError, InitError};
pub use mem::{frame_alloc, ram_allocator_init, FrameAllocator, Grant, MemError, RamAllocator};
pub use registry::{ListenerId, Registry, RegistryError};

/// Callback invoked once init has spawned its boot programs and is about to serve.
pub struct ReadyNotifier(Box<dyn FnOnce() + Send>);

impl ReadyNotifier {
    /// Create a new notifier from the supplied closure.
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Box::new(func))
    }

    /// Execute the wrapped callback.
    pub fn notify(self) {
        (self.0)();
    }
}

/// Installs the `env_logger` backend. `RUST_LOG` takes precedence over `default_filter`.
pub fn init_logging(default_filter: &str) {
    let env = env_logger::Env::default().default_filter_or(default_filter);
    // A logger installed earlier stays in place.
    let _ = env_logger::Builder::from_env(env).format_timestamp(None).try_init();
}

/// Builds the server over `router` and spawns the configured boot programs.
pub fn bootstrap<P>(
    config: &InitConfig,
    router: Router,
    platform: &mut P,
) -> Result<(Server<RamAllocator>, Vec<ProcessHandle>), InitError>
where
    P: Platform + ?Sized,
{
    let allocator = ram_allocator_init(config).map_err(InitError::RamInit)?;
    let mut server = Server::new(router, allocator);
    let mut processes = Vec::with_capacity(config.boot_programs.len());
    for name in &config.boot_programs {
        processes.push(spawn_process(&mut server, platform, name)?);
    }
    Ok((server, processes))
}

/// Runs init: load configuration, check the core, bootstrap, then serve forever.
///
/// Only startup failures return.
pub fn service_main_loop(args: BootArgs, notifier: ReadyNotifier) -> Result<Infallible, InitError> {
    let path = args.config.as_deref().unwrap_or(Path::new(DEFAULT_CONFIG_PATH));
    let config = InitConfig::load(path)?;
    config.validate()?;
    init_logging(&config.log_level);
    println!("init: start");

    let router = Router::new(config.router_config());
    let mut platform = HostPlatform::new(router.clone(), args.core.unwrap_or(CoreId::BOOT));
    let core = platform.core_id();
    args.check_core(core)?;
    info!(target: "init", "core {core} bootinfo={:?}", args.bootinfo);

    let (mut server, processes) = bootstrap(&config, router, &mut platform)?;
    println!("init: ready");
    notifier.notify();

    let _processes = processes;
    server.run()
}
