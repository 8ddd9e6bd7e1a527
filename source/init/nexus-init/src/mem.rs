// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical frame allocation on behalf of child processes
//! OWNERS: @runtime
//! STATUS: Functional
//! TEST_COVERAGE: 10 unit tests + 1 property test
//!
//! PUBLIC API:
//!   - FrameAllocator: `alloc(bytes)` / `release(region)` contract consumed by the dispatcher
//!   - RamAllocator: first-fit allocator over the configured RAM window
//!   - ram_allocator_init(): builds the allocator from `InitConfig`
//!   - frame_alloc(): retypes a client-supplied empty slot into a frame capability
//!
//! INVARIANTS:
//!   - Granted sizes are rounded up to the frame granularity, never down
//!   - Granted regions never overlap

use log::{debug, warn};
use nexus_abi::{init_rpc, Cap, FrameRegion, Rights, Word};
use thiserror::Error;

use crate::config::InitConfig;

/// Frame allocation failures. [`MemError::code`] is the wire error detail.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// Zero-byte frame requested.
    #[error("zero-sized frame requested")]
    ZeroSize,
    /// No free region large enough.
    #[error("out of memory: {requested} bytes requested, {free} bytes free")]
    OutOfMemory {
        /// Requested size.
        requested: u64,
        /// Bytes still free (possibly fragmented).
        free: u64,
    },
    /// Rounding the request to the granularity overflows.
    #[error("requested size {requested:#x} overflows frame rounding")]
    SizeOverflow {
        /// Requested size.
        requested: u64,
    },
    /// The client-supplied slot already holds an object.
    #[error("receiving slot is not empty")]
    SlotOccupied,
    /// The configured RAM window is unusable.
    #[error("invalid RAM range base={base:#x} bytes={bytes:#x} granularity={granularity:#x}")]
    InvalidRange {
        /// Base of the configured window.
        base: u64,
        /// Size of the configured window.
        bytes: u64,
        /// Configured frame granularity.
        granularity: u64,
    },
}

impl MemError {
    /// Stable non-zero error detail sent in `{STATUS_FAILED, detail, 0}`.
    pub const fn code(&self) -> Word {
        match self {
            Self::ZeroSize => init_rpc::ERR_ZERO_SIZE,
            Self::OutOfMemory { .. } => init_rpc::ERR_OUT_OF_MEMORY,
            Self::SizeOverflow { .. } => init_rpc::ERR_SIZE_OVERFLOW,
            Self::SlotOccupied => init_rpc::ERR_SLOT_OCCUPIED,
            Self::InvalidRange { .. } => init_rpc::ERR_INVALID_RANGE,
        }
    }
}

/// Source of physical frames.
pub trait FrameAllocator {
    /// Allocates a region of at least `bytes` bytes.
    fn alloc(&mut self, bytes: u64) -> Result<FrameRegion, MemError>;

    /// Takes back a region returned by [`FrameAllocator::alloc`] that never reached a client.
    fn release(&mut self, region: FrameRegion);
}

/// A frame handed to a client together with its actual size.
#[derive(Debug, PartialEq, Eq)]
pub struct Grant {
    /// Frame capability; moved to the client.
    pub frame: Cap,
    /// Size of the frame, at least the requested size.
    pub bytes: u64,
}

/// First-fit allocator over a contiguous RAM window.
#[derive(Debug, Clone)]
pub struct RamAllocator {
    granularity: u64,
    total: u64,
    free: Vec<FrameRegion>,
}

impl RamAllocator {
    /// Manages `bytes` of RAM starting at `base`, handing out multiples of `granularity`.
    ///
    /// A trailing partial granule is left unused.
    pub fn new(base: u64, bytes: u64, granularity: u64) -> Result<Self, MemError> {
        let invalid = MemError::InvalidRange { base, bytes, granularity };
        if granularity == 0 || !granularity.is_power_of_two() || base % granularity != 0 {
            return Err(invalid);
        }
        let usable = bytes - bytes % granularity;
        if usable == 0 || base.checked_add(usable).is_none() {
            return Err(invalid);
        }
        Ok(Self { granularity, total: usable, free: vec![FrameRegion::new(base, usable)] })
    }

    /// Allocation unit in bytes.
    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    /// Bytes managed by the allocator.
    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    /// Bytes not yet handed out.
    pub fn free_bytes(&self) -> u64 {
        self.free.iter().map(FrameRegion::bytes).sum()
    }

    /// Rounds `bytes` up to the granularity.
    pub fn round_up(&self, bytes: u64) -> Result<u64, MemError> {
        if bytes == 0 {
            return Err(MemError::ZeroSize);
        }
        let mask = self.granularity - 1;
        bytes
            .checked_add(mask)
            .map(|padded| padded & !mask)
            .ok_or(MemError::SizeOverflow { requested: bytes })
    }
}

impl FrameAllocator for RamAllocator {
    fn alloc(&mut self, bytes: u64) -> Result<FrameRegion, MemError> {
        let rounded = self.round_up(bytes)?;
        let Some(index) = self.free.iter().position(|region| region.bytes() >= rounded) else {
            return Err(MemError::OutOfMemory { requested: bytes, free: self.free_bytes() });
        };
        let region = self.free[index];
        let granted = FrameRegion::new(region.base(), rounded);
        if region.bytes() == rounded {
            self.free.remove(index);
        } else {
            self.free[index] = FrameRegion::new(granted.end(), region.bytes() - rounded);
        }
        debug!(
            target: "init::mem",
            "alloc {bytes:#x} -> [{:#x}, {:#x}) free={:#x}",
            granted.base(),
            granted.end(),
            self.free_bytes()
        );
        Ok(granted)
    }

    fn release(&mut self, region: FrameRegion) {
        if region.bytes() == 0 || self.free.iter().any(|free| free.overlaps(&region)) {
            warn!(target: "init::mem", "ignoring release of [{:#x}, {:#x})", region.base(), region.end());
            return;
        }
        let index = self.free.partition_point(|free| free.base() < region.base());
        self.free.insert(index, region);
        if index + 1 < self.free.len() && region.end() == self.free[index + 1].base() {
            let next = self.free.remove(index + 1);
            self.free[index] = FrameRegion::new(region.base(), region.bytes() + next.bytes());
        }
        if index > 0 && self.free[index - 1].end() == region.base() {
            let merged = self.free.remove(index);
            let prev = self.free[index - 1];
            self.free[index - 1] = FrameRegion::new(prev.base(), prev.bytes() + merged.bytes());
        }
        debug!(target: "init::mem", "release [{:#x}, {:#x}) free={:#x}", region.base(), region.end(), self.free_bytes());
    }
}

/// Builds the RAM allocator described by `config`. Failure is fatal at startup.
pub fn ram_allocator_init(config: &InitConfig) -> Result<RamAllocator, MemError> {
    let allocator = RamAllocator::new(config.ram_base, config.ram_bytes, config.frame_granularity)?;
    debug!(
        target: "init::mem",
        "ram window base={:#x} usable={:#x} granule={:#x}",
        config.ram_base,
        allocator.total_bytes(),
        allocator.granularity()
    );
    Ok(allocator)
}

/// Allocates at least `bytes` and retypes the client's empty `slot` into the frame.
///
/// A missing slot is treated as empty. An occupied slot is rejected before any memory is taken.
pub fn frame_alloc<A>(allocator: &mut A, slot: Option<Cap>, bytes: u64) -> Result<(Cap, u64), MemError>
where
    A: FrameAllocator + ?Sized,
{
    let slot = slot.unwrap_or_default();
    if slot.is_valid() {
        return Err(MemError::SlotOccupied);
    }
    let region = allocator.alloc(bytes)?;
    let frame = slot
        .retype_frame(region, Rights::FRAME_DEFAULT)
        .map_err(|_| MemError::SlotOccupied)?;
    Ok((frame, region.bytes()))
}
