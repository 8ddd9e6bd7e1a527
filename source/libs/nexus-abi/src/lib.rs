// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Capability and wire ABI shared by init and its clients
//! OWNERS: @runtime
//! PUBLIC API: Cap, CapObject, Rights, FrameRegion, EndpointId, ClientId, CoreId, init_rpc
//! DEPENDS_ON: bitflags
//! INVARIANTS: Cap is move-only; a granted capability leaves the sender when it is sent
//! NOTE: Host builds cannot stop a process from constructing a Cap; authority is by convention

use core::fmt;

/// Fixed-width message word.
pub type Word = u64;

/// Maximum number of payload words carried by a single channel message.
pub const MAX_WORDS: usize = 8;

/// Init RPC wire constants.
///
/// Requests carry the opcode in `words[0]`. Responses carry a status in `words[0]`.
pub mod init_rpc {
    use super::Word;

    /// Client handshake: `{HANDSHAKE}` + remote endpoint capability.
    pub const HANDSHAKE: Word = 1;
    /// Memory request: `{MEMORY, client_id, requested_size}` + empty slot capability.
    pub const MEMORY: Word = 2;

    /// Request succeeded.
    pub const STATUS_OK: Word = 0;
    /// Request failed; `words[1]` carries the error detail.
    pub const STATUS_FAILED: Word = 1;

    /// Frame allocator ran out of physical memory.
    pub const ERR_OUT_OF_MEMORY: Word = 0x10;
    /// Zero-byte frame requested.
    pub const ERR_ZERO_SIZE: Word = 0x11;
    /// The receiving slot supplied with the request was not empty.
    pub const ERR_SLOT_OCCUPIED: Word = 0x12;
    /// Requested size overflows after rounding to the frame granularity.
    pub const ERR_SIZE_OVERFLOW: Word = 0x13;
    /// RAM allocator was configured with an unusable range.
    pub const ERR_INVALID_RANGE: Word = 0x14;
    /// Opcode not recognised by the server.
    pub const ERR_UNKNOWN_OPERATION: Word = 0x20;
    /// Client id was never issued on this channel.
    pub const ERR_UNKNOWN_CLIENT: Word = 0x21;
    /// Request carried fewer words than the opcode requires.
    pub const ERR_MALFORMED: Word = 0x22;
    /// Request carried a missing or unusable capability.
    pub const ERR_BAD_CAPABILITY: Word = 0x23;
}

/// Kernel endpoint identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointId(u32);

impl EndpointId {
    /// Wraps a raw endpoint index.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw endpoint index.
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep#{}", self.0)
    }
}

/// Identifier handed to a client by the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(u32);

impl ClientId {
    /// Wraps a raw client index.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Decodes a client id from a message word; `None` when it cannot name any client.
    pub fn from_word(word: Word) -> Option<Self> {
        u32::try_from(word).ok().map(Self)
    }

    /// Encodes the id as a message word.
    pub const fn to_word(self) -> Word {
        self.0 as Word
    }

    /// Table index for this id.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Identifier of the core a process runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoreId(u32);

impl CoreId {
    /// The core that receives boot information.
    pub const BOOT: Self = Self(0);

    /// Wraps a raw core number.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw core number.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns `true` for the boot core.
    pub const fn is_boot(self) -> bool {
        self.0 == Self::BOOT.0
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags::bitflags! {
    /// Rights conferred on the holder of a capability.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Rights: u32 {
        /// Send messages to the endpoint.
        const SEND = 1 << 0;
        /// Receive messages from the endpoint.
        const RECV = 1 << 1;
        /// Read the frame.
        const READ = 1 << 2;
        /// Write the frame.
        const WRITE = 1 << 3;
        /// Map the frame into an address space.
        const MAP = 1 << 4;
        /// Attach capabilities to messages sent through the endpoint.
        const GRANT = 1 << 5;
    }
}

impl Rights {
    /// Rights attached to frames granted by init.
    pub const FRAME_DEFAULT: Self = Self::READ.union(Self::WRITE).union(Self::MAP);
    /// Rights attached to endpoint capabilities handed to peers.
    pub const ENDPOINT_PEER: Self = Self::SEND.union(Self::GRANT);
}

/// Physical memory region backing a frame capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameRegion {
    base: u64,
    bytes: u64,
}

impl FrameRegion {
    /// Describes `bytes` of physical memory starting at `base`.
    pub const fn new(base: u64, bytes: u64) -> Self {
        Self { base, bytes }
    }

    /// First byte of the region.
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// Size in bytes.
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }

    /// One past the last byte.
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.bytes)
    }

    /// Returns `true` when both regions share at least one byte.
    pub const fn overlaps(&self, other: &FrameRegion) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

/// Kernel object a capability refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CapObject {
    /// Empty slot.
    Null,
    /// Message endpoint.
    Endpoint(EndpointId),
    /// Physical memory frame.
    Frame(FrameRegion),
}

/// Reference to a kernel object.
///
/// `Cap` is not `Clone`: handing one over moves it, and the previous holder keeps
/// nothing usable. On the host the constructors are plain functions, so unforgeability
/// holds by convention only: endpoint capabilities come from `nexus_ipc::Router` and
/// frames from init's allocator.
#[derive(Debug, PartialEq, Eq)]
pub struct Cap {
    object: CapObject,
    rights: Rights,
}

impl Cap {
    /// An empty slot.
    pub const fn null() -> Self {
        Self { object: CapObject::Null, rights: Rights::empty() }
    }

    /// Capability to an endpoint.
    ///
    /// Minting authority belongs to the endpoint table; other callers use it in tests only.
    pub const fn endpoint(id: EndpointId, rights: Rights) -> Self {
        Self { object: CapObject::Endpoint(id), rights }
    }

    /// Referenced object.
    pub const fn object(&self) -> &CapObject {
        &self.object
    }

    /// Rights held on the object.
    pub const fn rights(&self) -> Rights {
        self.rights
    }

    /// Returns `true` for an empty slot.
    pub const fn is_null(&self) -> bool {
        matches!(self.object, CapObject::Null)
    }

    /// Returns `true` when the capability refers to an object.
    pub const fn is_valid(&self) -> bool {
        !self.is_null()
    }

    /// Endpoint referenced by this capability, if any.
    pub const fn endpoint_id(&self) -> Option<EndpointId> {
        match self.object {
            CapObject::Endpoint(id) => Some(id),
            _ => None,
        }
    }

    /// Frame referenced by this capability, if any.
    pub const fn frame_region(&self) -> Option<FrameRegion> {
        match self.object {
            CapObject::Frame(region) => Some(region),
            _ => None,
        }
    }

    /// Retypes an empty slot into a frame capability.
    ///
    /// A slot that already holds an object is handed back untouched. Only the holder of
    /// the RAM allocator retypes slots.
    pub fn retype_frame(self, region: FrameRegion, rights: Rights) -> Result<Cap, Cap> {
        if self.is_valid() {
            return Err(self);
        }
        Ok(Self { object: CapObject::Frame(region), rights })
    }
}

impl Default for Cap {
    fn default() -> Self {
        Self::null()
    }
}
