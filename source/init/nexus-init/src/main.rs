// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Root server entry point: `nexus-init [bootinfo] [--config <path>] [--core <n>]`.

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

use nexus_init::{service_main_loop, BootArgs, ReadyNotifier};

/// Entrypoint for the init binary. Initialization failures abort; otherwise the
/// event loop never returns.
fn main() -> ! {
    let result = BootArgs::parse(std::env::args().skip(1))
        .and_then(|args| service_main_loop(args, ReadyNotifier::new(|| ())));
    match result {
        Ok(never) => match never {},
        Err(err) => {
            eprintln!("init: fatal error: {err}");
            std::process::abort()
        }
    }
}
