// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Builtin programs init can spawn on the host platform
//! OWNERS: @runtime

use std::collections::BTreeMap;

use log::info;

use crate::client::{InitClient, RpcError};

/// Entry point of a builtin program.
pub type ProgramMain = fn(InitClient) -> Result<(), RpcError>;

/// Programs available to [`crate::boot::HostPlatform`], by name.
#[derive(Clone, Debug, Default)]
pub struct ProgramCatalog {
    programs: BTreeMap<String, ProgramMain>,
}

impl ProgramCatalog {
    /// Catalog with every builtin program.
    pub fn builtin() -> Self {
        let mut catalog = Self::default();
        catalog.insert("hello", hello);
        catalog
    }

    /// Adds or replaces a program.
    pub fn insert(&mut self, name: &str, main: ProgramMain) {
        self.programs.insert(name.to_string(), main);
    }

    /// Looks up a program by name.
    pub fn get(&self, name: &str) -> Option<ProgramMain> {
        self.programs.get(name).copied()
    }

    /// Program names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.programs.keys().map(String::as_str)
    }
}

/// Page requested by `hello`.
pub const HELLO_REQUEST_BYTES: u64 = 4096;

fn hello(mut client: InitClient) -> Result<(), RpcError> {
    let id = client.handshake()?;
    info!(target: "hello", "hello: connected as {id}");
    let grant = client.request_memory(HELLO_REQUEST_BYTES)?;
    let base = grant.frame.frame_region().map_or(0, |region| region.base());
    info!(target: "hello", "hello: got {:#x} bytes at {base:#x}", grant.bytes);
    Ok(())
}
