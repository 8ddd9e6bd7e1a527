// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-process endpoint table standing in for kernel-mediated channels
//!
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - Router: shared endpoint table (create, send, readiness, waiting)
//!   - Endpoint: receive side of one endpoint, owned by exactly one process
//!   - RouterConfig: buffer slots per endpoint and capability slot pool size
//!
//! SECURITY INVARIANTS:
//!   - No unsafe code
//!   - Sends require SEND rights; attaching a capability requires GRANT
//!   - A rejected send hands the message (and its capability) back to the caller
//!   - A capability is only received into a provisioned slot
//!   - Receiving a capability or dropping an endpoint returns its slot to the pool
//!
//! ERROR CONDITIONS:
//!   - IpcError::WouldBlock: queue empty (recv) or full (send)
//!   - IpcError::Transient / NoRecvSlot: retry-eligible receive failures
//!   - IpcError::NoSpace: capability slot pool exhausted
//!   - IpcError::Disconnected: receive side dropped

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use nexus_abi::{Cap, EndpointId, Rights};
use parking_lot::{Condvar, Mutex};

use crate::{IpcError, Message, Result, SendError, Wait};

/// Sizing of the endpoint table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouterConfig {
    /// Messages buffered per endpoint before senders see `WouldBlock`.
    pub channel_slots: usize,
    /// Capability slots available for receive provisioning across all endpoints.
    ///
    /// A slot is held from provisioning until the capability it received is dequeued.
    pub recv_slots: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self { channel_slots: 4, recv_slots: 1024 }
    }
}

/// Shared endpoint table. Cloning yields another handle to the same table.
#[derive(Clone)]
pub struct Router {
    shared: Arc<Shared>,
}

struct Shared {
    table: Mutex<Table>,
    changed: Condvar,
}

struct Table {
    generation: u64,
    channel_slots: usize,
    free_slots: usize,
    queues: Vec<Queue>,
}

struct Queue {
    messages: VecDeque<Message>,
    recv_slot: bool,
    open: bool,
    transient_faults: u32,
}

impl Queue {
    fn head_deliverable(&self) -> bool {
        match self.messages.front() {
            Some(head) => self.transient_faults > 0 || !head.has_cap() || self.recv_slot,
            None => false,
        }
    }
}

impl Table {
    fn queue(&self, id: EndpointId) -> Option<&Queue> {
        self.queues.get(id.raw() as usize)
    }

    fn queue_mut(&mut self, id: EndpointId) -> Option<&mut Queue> {
        self.queues.get_mut(id.raw() as usize)
    }

    fn bump(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }
}

impl Router {
    /// Creates an empty endpoint table.
    pub fn new(config: RouterConfig) -> Self {
        let table = Table {
            generation: 0,
            channel_slots: config.channel_slots.max(1),
            free_slots: config.recv_slots,
            queues: Vec::new(),
        };
        Self { shared: Arc::new(Shared { table: Mutex::new(table), changed: Condvar::new() }) }
    }

    /// Creates an endpoint, returning its receive side and a capability a peer can send to.
    pub fn create_endpoint(&self) -> (Endpoint, Cap) {
        let mut table = self.shared.table.lock();
        let id = EndpointId::new(table.queues.len() as u32);
        table.queues.push(Queue {
            messages: VecDeque::new(),
            recv_slot: false,
            open: true,
            transient_faults: 0,
        });
        table.bump();
        drop(table);
        self.shared.changed.notify_all();
        (Endpoint { router: self.clone(), id }, Cap::endpoint(id, Rights::ENDPOINT_PEER))
    }

    /// Attempts to enqueue `message` on the endpoint named by `to` without blocking.
    pub fn try_send(&self, to: &Cap, message: Message) -> core::result::Result<(), SendError> {
        let id = match Self::check_send(to, &message) {
            Ok(id) => id,
            Err(error) => return Err(SendError { error, message }),
        };
        let mut table = self.shared.table.lock();
        let slots = table.channel_slots;
        let Some(queue) = table.queue_mut(id) else {
            return Err(SendError { error: IpcError::BadCapability, message });
        };
        if !queue.open {
            return Err(SendError { error: IpcError::Disconnected, message });
        }
        if queue.messages.len() >= slots {
            return Err(SendError { error: IpcError::WouldBlock, message });
        }
        queue.messages.push_back(message);
        table.bump();
        drop(table);
        self.shared.changed.notify_all();
        Ok(())
    }

    /// Sends `message`, waiting for buffer space as requested by `wait`.
    pub fn send(&self, to: &Cap, message: Message, wait: Wait) -> core::result::Result<(), SendError> {
        let deadline = wait.timeout().map(|timeout| Instant::now() + timeout);
        let mut message = message;
        loop {
            let seen = self.generation();
            match self.try_send(to, message) {
                Err(SendError { error: IpcError::WouldBlock, message: back }) => {
                    if wait.is_non_blocking() {
                        return Err(SendError { error: IpcError::WouldBlock, message: back });
                    }
                    if !self.wait_past(seen, deadline) {
                        return Err(SendError { error: IpcError::Timeout, message: back });
                    }
                    message = back;
                }
                other => return other,
            }
        }
    }

    /// Returns `true` when a send to `to` would not block.
    ///
    /// A disconnected or unknown target counts as ready so the sender observes the failure.
    pub fn send_ready(&self, to: &Cap) -> bool {
        let Some(id) = to.endpoint_id() else {
            return true;
        };
        let table = self.shared.table.lock();
        match table.queue(id) {
            Some(queue) => !queue.open || queue.messages.len() < table.channel_slots,
            None => true,
        }
    }

    /// Current change counter; every enqueue, dequeue and endpoint change advances it.
    pub fn generation(&self) -> u64 {
        self.shared.table.lock().generation
    }

    /// Blocks until the table changes past `seen` and returns the new generation.
    pub fn wait_for_change(&self, seen: u64) -> u64 {
        let mut table = self.shared.table.lock();
        while table.generation == seen {
            self.shared.changed.wait(&mut table);
        }
        table.generation
    }

    /// Like [`Router::wait_for_change`] but gives up at `deadline`.
    pub fn wait_for_change_until(&self, seen: u64, deadline: Instant) -> Option<u64> {
        if self.wait_past(seen, Some(deadline)) {
            Some(self.generation())
        } else {
            None
        }
    }

    /// Makes the next `count` receives on `id` fail with [`IpcError::Transient`].
    pub fn inject_transient(&self, id: EndpointId, count: u32) {
        let mut table = self.shared.table.lock();
        if let Some(queue) = table.queue_mut(id) {
            queue.transient_faults = queue.transient_faults.saturating_add(count);
        }
        table.bump();
        drop(table);
        self.shared.changed.notify_all();
    }

    /// Number of messages waiting on `id`.
    pub fn queued(&self, id: EndpointId) -> usize {
        self.shared.table.lock().queue(id).map_or(0, |queue| queue.messages.len())
    }

    /// Capability slots still available for provisioning.
    pub fn free_recv_slots(&self) -> usize {
        self.shared.table.lock().free_slots
    }

    fn check_send(to: &Cap, message: &Message) -> Result<EndpointId> {
        let id = to.endpoint_id().ok_or(IpcError::BadCapability)?;
        if !to.rights().contains(Rights::SEND) {
            return Err(IpcError::BadCapability);
        }
        if message.has_cap() && !to.rights().contains(Rights::GRANT) {
            return Err(IpcError::BadCapability);
        }
        Ok(id)
    }

    fn wait_past(&self, seen: u64, deadline: Option<Instant>) -> bool {
        let mut table = self.shared.table.lock();
        while table.generation == seen {
            match deadline {
                Some(deadline) => {
                    if self.shared.changed.wait_until(&mut table, deadline).timed_out() {
                        return table.generation != seen;
                    }
                }
                None => self.shared.changed.wait(&mut table),
            }
        }
        true
    }
}

/// Receive side of an endpoint. Dropping it disconnects every sender.
pub struct Endpoint {
    router: Router,
    id: EndpointId,
}

impl Endpoint {
    /// Endpoint identifier.
    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// Table this endpoint lives in.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Mints another capability to this endpoint carrying `rights`.
    pub fn mint(&self, rights: Rights) -> Cap {
        Cap::endpoint(self.id, rights)
    }

    /// Returns `true` when [`Endpoint::try_recv`] would make progress.
    pub fn recv_ready(&self) -> bool {
        let table = self.router.shared.table.lock();
        table.queue(self.id).is_some_and(Queue::head_deliverable)
    }

    /// Receives the head message without blocking.
    pub fn try_recv(&self) -> Result<Message> {
        let mut table = self.router.shared.table.lock();
        let queue = table.queue_mut(self.id).ok_or(IpcError::Disconnected)?;
        let head_has_cap = match queue.messages.front() {
            Some(head) => head.has_cap(),
            None => return Err(IpcError::WouldBlock),
        };
        if queue.transient_faults > 0 {
            queue.transient_faults -= 1;
            return Err(IpcError::Transient);
        }
        if head_has_cap && !queue.recv_slot {
            return Err(IpcError::NoRecvSlot);
        }
        let message = queue.messages.pop_front().ok_or(IpcError::WouldBlock)?;
        if head_has_cap {
            // The capability moves out with the message, so its slot goes back to the pool.
            queue.recv_slot = false;
            table.free_slots += 1;
        }
        table.bump();
        drop(table);
        self.router.shared.changed.notify_all();
        Ok(message)
    }

    /// Receives the head message, waiting as requested by `wait`.
    pub fn recv(&self, wait: Wait) -> Result<Message> {
        let deadline = wait.timeout().map(|timeout| Instant::now() + timeout);
        loop {
            let seen = self.router.generation();
            match self.try_recv() {
                Err(IpcError::Transient) => continue,
                Err(err @ (IpcError::WouldBlock | IpcError::NoRecvSlot)) => {
                    if wait.is_non_blocking() {
                        return Err(err);
                    }
                    if !self.router.wait_past(seen, deadline) {
                        return Err(IpcError::Timeout);
                    }
                }
                other => return other,
            }
        }
    }

    /// Provisions the slot the next received capability lands in.
    pub fn alloc_recv_slot(&self) -> Result<()> {
        let mut table = self.router.shared.table.lock();
        if table.queue(self.id).is_some_and(|queue| queue.recv_slot) {
            return Ok(());
        }
        if table.free_slots == 0 {
            return Err(IpcError::NoSpace);
        }
        table.free_slots -= 1;
        if let Some(queue) = table.queue_mut(self.id) {
            queue.recv_slot = true;
        }
        table.bump();
        drop(table);
        self.router.shared.changed.notify_all();
        Ok(())
    }

    /// Returns `true` when a receive slot is provisioned.
    pub fn has_recv_slot(&self) -> bool {
        self.router.shared.table.lock().queue(self.id).is_some_and(|queue| queue.recv_slot)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let mut table = self.router.shared.table.lock();
        let mut released = false;
        if let Some(queue) = table.queue_mut(self.id) {
            queue.open = false;
            queue.messages.clear();
            released = std::mem::take(&mut queue.recv_slot);
        }
        if released {
            table.free_slots += 1;
        }
        table.bump();
        drop(table);
        self.router.shared.changed.notify_all();
    }
}

impl core::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Endpoint").field("id", &self.id).finish()
    }
}
