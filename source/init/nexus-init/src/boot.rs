// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process entry arguments and the platform collaborators init relies on
//! OWNERS: @runtime
//! STATUS: Functional
//! TEST_COVERAGE: 6 unit tests
//!
//! PUBLIC API:
//!   - BootArgs::parse(): `[bootinfo] [--config <path>] [--core <n>]`
//!   - Platform: core id lookup and process spawning
//!   - HostPlatform: runs catalog programs as threads
//!   - spawn_process(): gives a new process its own bootstrap channel to init

use std::path::PathBuf;
use std::thread;

use log::{error, info};
use nexus_abi::{Cap, CoreId};
use nexus_ipc::Router;

use crate::client::InitClient;
use crate::dispatch::Server;
use crate::error::InitError;
use crate::mem::FrameAllocator;
use crate::programs::ProgramCatalog;

/// Parsed command line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BootArgs {
    /// Boot information pointer; only the boot core receives one.
    pub bootinfo: Option<u64>,
    /// Configuration file override.
    pub config: Option<PathBuf>,
    /// Core override for platforms without a hardware core id.
    pub core: Option<CoreId>,
}

impl BootArgs {
    /// Parses arguments following the program name.
    ///
    /// The positional argument is a decimal boot information pointer; `0` means none.
    pub fn parse<I, S>(args: I) -> Result<Self, InitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = Self::default();
        let mut positional = false;
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_ref() {
                "--config" => {
                    let path = args.next().ok_or_else(|| missing_value("--config"))?;
                    parsed.config = Some(PathBuf::from(path.as_ref()));
                }
                "--core" => {
                    let raw = args.next().ok_or_else(|| missing_value("--core"))?;
                    let core = raw
                        .as_ref()
                        .parse::<u32>()
                        .map_err(|_| InitError::InvalidArgument(format!("--core {}", raw.as_ref())))?;
                    parsed.core = Some(CoreId::new(core));
                }
                flag if flag.starts_with("--") => {
                    return Err(InitError::InvalidArgument(flag.to_string()));
                }
                value if !positional => {
                    positional = true;
                    let pointer = value
                        .parse::<u64>()
                        .map_err(|_| InitError::InvalidBootInfo(value.to_string()))?;
                    parsed.bootinfo = (pointer != 0).then_some(pointer);
                }
                extra => return Err(InitError::InvalidArgument(extra.to_string())),
            }
        }
        Ok(parsed)
    }

    /// Only secondary cores may start without boot information.
    pub fn check_core(&self, core: CoreId) -> Result<(), InitError> {
        if self.bootinfo.is_none() && core.is_boot() {
            return Err(InitError::MissingBootInfo { core });
        }
        Ok(())
    }
}

fn missing_value(flag: &str) -> InitError {
    InitError::InvalidArgument(format!("{flag} requires a value"))
}

/// A spawned process.
#[derive(Debug)]
pub struct ProcessHandle {
    name: String,
    join: thread::JoinHandle<()>,
}

impl ProcessHandle {
    /// Program name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` once the process has exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the process to exit; `false` if it panicked.
    pub fn join(self) -> bool {
        self.join.join().is_ok()
    }
}

/// Services init needs from the platform.
pub trait Platform {
    /// Core this instance of init runs on.
    fn core_id(&self) -> CoreId;

    /// Starts `name`, handing it `initep` as its channel to init.
    fn spawn(&mut self, name: &str, initep: Cap) -> Result<ProcessHandle, InitError>;
}

/// Runs builtin programs as threads sharing the host endpoint table.
pub struct HostPlatform {
    router: Router,
    core: CoreId,
    catalog: ProgramCatalog,
}

impl HostPlatform {
    /// Host platform with the builtin catalog.
    pub fn new(router: Router, core: CoreId) -> Self {
        Self::with_catalog(router, core, ProgramCatalog::builtin())
    }

    /// Host platform spawning from `catalog`.
    pub fn with_catalog(router: Router, core: CoreId, catalog: ProgramCatalog) -> Self {
        Self { router, core, catalog }
    }
}

impl Platform for HostPlatform {
    fn core_id(&self) -> CoreId {
        self.core
    }

    fn spawn(&mut self, name: &str, initep: Cap) -> Result<ProcessHandle, InitError> {
        let main = self.catalog.get(name).ok_or_else(|| InitError::UnknownProgram(name.to_string()))?;
        let router = self.router.clone();
        let program = name.to_string();
        let join = thread::Builder::new()
            .name(format!("proc-{name}"))
            .spawn(move || {
                if let Err(err) = main(InitClient::connect(router, initep)) {
                    error!(target: "init", "{program}: exited with error: {err}");
                }
            })
            .map_err(|source| InitError::Spawn { name: name.to_string(), source })?;
        Ok(ProcessHandle { name: name.to_string(), join })
    }
}

/// Creates a bootstrap channel for `name`, serves it, and spawns the process with its send end.
pub fn spawn_process<A, P>(server: &mut Server<A>, platform: &mut P, name: &str) -> Result<ProcessHandle, InitError>
where
    A: FrameAllocator,
    P: Platform + ?Sized,
{
    let (endpoint, initep) = server.router().create_endpoint();
    let listener = server.add_bootstrap(endpoint).map_err(InitError::Endpoint)?;
    let handle = platform.spawn(name, initep)?;
    info!(target: "init", "init: spawn {name} on {listener}");
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bootinfo_pointer() {
        let args = BootArgs::parse(["2147483648"]).unwrap();
        assert_eq!(args.bootinfo, Some(0x8000_0000));
        args.check_core(CoreId::BOOT).unwrap();
    }

    #[test]
    fn absent_or_zero_bootinfo_is_none() {
        assert_eq!(BootArgs::parse(Vec::<String>::new()).unwrap().bootinfo, None);
        assert_eq!(BootArgs::parse(["0"]).unwrap().bootinfo, None);
    }

    #[test]
    fn non_numeric_bootinfo_rejected() {
        assert!(matches!(BootArgs::parse(["0x1000"]), Err(InitError::InvalidBootInfo(_))));
    }

    #[test]
    fn options_and_extra_positionals() {
        let args = BootArgs::parse(["--core", "2", "--config", "/tmp/init.toml"]).unwrap();
        assert_eq!(args.core, Some(CoreId::new(2)));
        assert_eq!(args.config, Some(PathBuf::from("/tmp/init.toml")));
        assert!(matches!(BootArgs::parse(["1", "2"]), Err(InitError::InvalidArgument(_))));
        assert!(matches!(BootArgs::parse(["--core"]), Err(InitError::InvalidArgument(_))));
        assert!(matches!(BootArgs::parse(["--verbose"]), Err(InitError::InvalidArgument(_))));
    }

    #[test]
    fn boot_core_requires_bootinfo() {
        let args = BootArgs::default();
        assert!(matches!(
            args.check_core(CoreId::BOOT),
            Err(InitError::MissingBootInfo { core }) if core == CoreId::BOOT
        ));
        args.check_core(CoreId::new(1)).unwrap();
    }

    #[test]
    fn unknown_program_not_spawned() {
        let router = Router::new(nexus_ipc::RouterConfig::default());
        let mut platform = HostPlatform::with_catalog(router.clone(), CoreId::new(1), ProgramCatalog::default());
        let (_endpoint, initep) = router.create_endpoint();
        assert!(matches!(platform.spawn("ghost", initep), Err(InitError::UnknownProgram(name)) if name == "ghost"));
    }
}
