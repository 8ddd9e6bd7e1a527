// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Helpers driving an init server against client threads over host endpoints.

#![forbid(unsafe_code)]

use std::thread;
use std::time::Duration;

use nexus_abi::Cap;
use nexus_init::{ram_allocator_init, DispatchError, InitClient, InitConfig, ListenerId, RamAllocator, Server};
use nexus_ipc::{Router, Wait};

/// Wait applied by test clients so a broken server fails the test instead of hanging it.
pub const CLIENT_WAIT: Wait = Wait::Timeout(Duration::from_secs(5));

/// Server slice used by each `event_dispatch_timeout` call while a client runs.
const POLL: Duration = Duration::from_millis(5);

/// Small RAM window: 64 pages starting at 2 GiB.
pub fn small_config() -> InitConfig {
    InitConfig { ram_bytes: 64 * 4096, boot_programs: Vec::new(), ..InitConfig::default() }
}

/// An init server plus the endpoint table its clients share.
pub struct Harness {
    router: Router,
    server: Server<RamAllocator>,
}

impl Harness {
    /// Builds a server from `config` without spawning anything.
    pub fn new(config: &InitConfig) -> Self {
        let router = Router::new(config.router_config());
        let allocator = ram_allocator_init(config).expect("ram allocator");
        Self { server: Server::new(router.clone(), allocator), router }
    }

    /// Endpoint table.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// The server under test.
    pub fn server(&self) -> &Server<RamAllocator> {
        &self.server
    }

    /// Creates a bootstrap channel and returns the capability a process would be spawned with.
    pub fn channel(&mut self) -> (ListenerId, Cap) {
        let (endpoint, initep) = self.router.create_endpoint();
        let listener = self.server.add_bootstrap(endpoint).expect("bootstrap listener");
        (listener, initep)
    }

    /// Creates a bootstrap channel and a client connected to it.
    pub fn connect(&mut self) -> (ListenerId, InitClient) {
        let (listener, initep) = self.channel();
        (listener, InitClient::connect(self.router.clone(), initep).with_wait(CLIENT_WAIT))
    }

    /// Runs `client` on its own thread while serving, until it returns.
    ///
    /// Returns the client's result and every dispatch error the server reported meanwhile.
    pub fn drive<T, F>(&mut self, client: F) -> (T, Vec<DispatchError>)
    where
        F: FnOnce() -> T + Send,
        T: Send,
    {
        let server = &mut self.server;
        thread::scope(|scope| {
            let handle = scope.spawn(client);
            let mut errors = Vec::new();
            while !handle.is_finished() {
                if let Err(err) = server.event_dispatch_timeout(POLL) {
                    errors.push(err);
                }
            }
            errors.extend(server.run_until_idle());
            match handle.join() {
                Ok(value) => (value, errors),
                Err(panic) => std::panic::resume_unwind(panic),
            }
        })
    }
}
