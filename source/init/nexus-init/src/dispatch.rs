// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Single-threaded receive / decode / dispatch / respond loop
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 12 unit tests + e2e (tests/e2e)
//!
//! PUBLIC API:
//!   - Server: listeners, client registry, parked responses and the frame allocator
//!   - Server::event_dispatch(): handle exactly one channel event, blocking until one is ready
//!   - Server::run(): serve forever
//!
//! INVARIANTS:
//!   - A listener is either awaiting a receive or awaiting the send of one parked response
//!   - A listener's next receive is armed only after its parked response left
//!   - Errors from one request never stop the loop or touch other listeners
//!   - A rejection is answered only when its sender is known; otherwise it is dropped

use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};
use nexus_abi::{init_rpc, ClientId, Word};
use nexus_ipc::{Endpoint, IpcError, Router, SendError};

use crate::continuation::{Continuation, PendingResponse, Scheduler};
use crate::error::DispatchError;
use crate::mem::FrameAllocator;
use crate::registry::{ListenerId, Registry};
use crate::rpc::{self, Request};

/// Protocol a listener accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerClass {
    /// Fresh endpoint handed to a spawned process; nobody to answer until a handshake binds it.
    Bootstrap,
    /// Bound by at least one handshake.
    Client {
        /// Most recent client registered on this listener.
        latest: ClientId,
    },
}

/// Per-listener progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerState {
    /// Receive armed.
    AwaitingRecv,
    /// A response is parked until the client's endpoint has room.
    AwaitingSend,
    /// Receive could not be re-armed; the listener is no longer served.
    Failed,
}

struct Listener {
    endpoint: Endpoint,
    class: ListenerClass,
    state: ListenerState,
}

/// Counters reported at debug level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Completed handshakes.
    pub handshakes: u64,
    /// Frames granted.
    pub grants: u64,
    /// Memory requests answered with FAILED.
    pub failed_grants: u64,
    /// Requests rejected by the dispatcher.
    pub rejected: u64,
    /// Receives re-armed after a transient failure.
    pub transient_retries: u64,
    /// Empty messages ignored.
    pub spurious: u64,
}

enum Event {
    Recv,
    Send,
}

/// The root server.
pub struct Server<A: FrameAllocator> {
    router: Router,
    listeners: Vec<Listener>,
    registry: Registry,
    scheduler: Scheduler,
    allocator: A,
    stats: ServerStats,
    cursor: usize,
}

impl<A: FrameAllocator> Server<A> {
    /// Creates a server without listeners.
    pub fn new(router: Router, allocator: A) -> Self {
        Self {
            router,
            listeners: Vec::new(),
            registry: Registry::new(),
            scheduler: Scheduler::new(),
            allocator,
            stats: ServerStats::default(),
            cursor: 0,
        }
    }

    /// Serves `endpoint` as a bootstrap listener and arms its first receive.
    pub fn add_bootstrap(&mut self, endpoint: Endpoint) -> Result<ListenerId, IpcError> {
        endpoint.alloc_recv_slot()?;
        let id = ListenerId::new(self.listeners.len());
        debug!(target: "init::dispatch", "{id}: serving {}", endpoint.id());
        self.listeners.push(Listener {
            endpoint,
            class: ListenerClass::Bootstrap,
            state: ListenerState::AwaitingRecv,
        });
        Ok(id)
    }

    /// Endpoint table the server lives in.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Registered clients.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Frame allocator.
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Counters.
    pub fn stats(&self) -> ServerStats {
        self.stats
    }

    /// Class of `listener`.
    pub fn listener_class(&self, listener: ListenerId) -> Option<ListenerClass> {
        self.listeners.get(listener.index()).map(|l| l.class)
    }

    /// State of `listener`.
    pub fn listener_state(&self, listener: ListenerId) -> Option<ListenerState> {
        self.listeners.get(listener.index()).map(|l| l.state)
    }

    /// Number of responses parked awaiting send readiness.
    pub fn pending_responses(&self) -> usize {
        self.scheduler.pending()
    }

    /// Handles one ready event, if any, without blocking.
    ///
    /// Listeners are visited round-robin so a busy client cannot starve the others.
    pub fn dispatch_ready(&mut self) -> Result<bool, DispatchError> {
        let count = self.listeners.len();
        for step in 0..count {
            let index = (self.cursor + step) % count;
            let id = ListenerId::new(index);
            let event = match self.listeners[index].state {
                ListenerState::AwaitingRecv if self.listeners[index].endpoint.recv_ready() => Event::Recv,
                ListenerState::AwaitingSend if self.target_ready(id) => Event::Send,
                _ => continue,
            };
            self.cursor = (index + 1) % count;
            match event {
                Event::Recv => self.handle_recv(id)?,
                Event::Send => self.handle_send(id)?,
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Waits for the next channel event and handles it.
    pub fn event_dispatch(&mut self) -> Result<(), DispatchError> {
        loop {
            let seen = self.router.generation();
            if self.dispatch_ready()? {
                return Ok(());
            }
            self.router.wait_for_change(seen);
        }
    }

    /// Like [`Server::event_dispatch`] but returns `Ok(false)` when nothing happened within `timeout`.
    pub fn event_dispatch_timeout(&mut self, timeout: Duration) -> Result<bool, DispatchError> {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = self.router.generation();
            if self.dispatch_ready()? {
                return Ok(true);
            }
            if self.router.wait_for_change_until(seen, deadline).is_none() {
                return Ok(false);
            }
        }
    }

    /// Handles events until none is ready, collecting per-message errors.
    pub fn run_until_idle(&mut self) -> Vec<DispatchError> {
        let mut errors = Vec::new();
        loop {
            match self.dispatch_ready() {
                Ok(true) => {}
                Ok(false) => return errors,
                Err(err) => errors.push(err),
            }
        }
    }

    /// Serves forever. Per-message errors are logged and the loop continues.
    pub fn run(&mut self) -> ! {
        loop {
            if let Err(err) = self.event_dispatch() {
                warn!(target: "init::dispatch", "{err}");
                debug!(target: "init::dispatch", "stats {:?}", self.stats);
            }
        }
    }

    fn target_ready(&self, listener: ListenerId) -> bool {
        let Some(client) = self.scheduler.peek_client(listener) else {
            return true;
        };
        match self.registry.lookup(client) {
            Ok(conn) => self.router.send_ready(&conn.channel().remote),
            Err(_) => true,
        }
    }

    fn handle_recv(&mut self, id: ListenerId) -> Result<(), DispatchError> {
        let message = match self.listeners[id.index()].endpoint.try_recv() {
            Ok(message) => message,
            Err(IpcError::WouldBlock) => return Ok(()),
            Err(err) if err.is_transient() => {
                self.stats.transient_retries += 1;
                debug!(target: "init::dispatch", "{id}: {err}, re-arming");
                return self.rearm(id);
            }
            Err(source) => {
                self.listeners[id.index()].state = ListenerState::Failed;
                error!(target: "init::dispatch", "{id}: receive failed: {source}");
                return Err(DispatchError::ChannelFailed { listener: id, source });
            }
        };
        if message.words().is_empty() {
            self.stats.spurious += 1;
            trace!(target: "init::dispatch", "{id}: empty message ignored");
            return self.rearm(id);
        }
        let claimed = (message.word(0) == Some(init_rpc::MEMORY)).then(|| message.word(1)).flatten();
        let result = Request::decode(id, message).and_then(|request| self.handle_request(id, request));
        match result {
            Ok(response) => {
                self.park(id, Continuation::Fresh(response));
                Ok(())
            }
            Err(err) => self.reject(id, err, claimed),
        }
    }

    fn handle_request(&mut self, id: ListenerId, request: Request) -> Result<PendingResponse, DispatchError> {
        match request {
            Request::Handshake { remote } => {
                let response = rpc::handshake(&mut self.registry, id, remote)?;
                self.listeners[id.index()].class = ListenerClass::Client { latest: response.client() };
                self.stats.handshakes += 1;
                Ok(response)
            }
            Request::Memory { client, bytes, slot } => {
                let response = rpc::memory_grant(&self.registry, &mut self.allocator, id, client, bytes, slot)?;
                match &response {
                    PendingResponse::MemoryGrant { outcome: Ok(_), .. } => self.stats.grants += 1,
                    _ => self.stats.failed_grants += 1,
                }
                Ok(response)
            }
        }
    }

    /// Client a rejection on `id` can be answered to: the one named by `claimed` if it is
    /// bound here, else the listener's only client. `None` when the sender is ambiguous.
    fn rejection_target(&self, id: ListenerId, claimed: Option<Word>) -> Option<ClientId> {
        if let Some(client) = claimed.and_then(|word| rpc::resolve_client(&self.registry, id, word).ok()) {
            return Some(client);
        }
        let mut bound = self.registry.iter().filter(|conn| conn.bound_to(id));
        match (bound.next(), bound.next()) {
            (Some(only), None) => Some(only.id()),
            _ => None,
        }
    }

    fn reject(&mut self, id: ListenerId, err: DispatchError, claimed: Option<Word>) -> Result<(), DispatchError> {
        self.stats.rejected += 1;
        let target = err.wire_detail().and_then(|detail| Some((self.rejection_target(id, claimed)?, detail)));
        match target {
            Some((client, detail)) => {
                debug!(target: "init::dispatch", "{id}: rejecting for {client}: {err}");
                self.park(id, Continuation::Fresh(PendingResponse::Rejected { client, detail }));
            }
            None => {
                debug!(target: "init::dispatch", "{id}: dropping request: {err}");
                let _ = self.rearm(id);
            }
        }
        Err(err)
    }

    fn park(&mut self, id: ListenerId, continuation: Continuation) {
        if let Some(displaced) = self.scheduler.park(id, continuation) {
            warn!(target: "init::dispatch", "{id}: displaced response for {}", displaced.client());
        }
        self.listeners[id.index()].state = ListenerState::AwaitingSend;
    }

    fn handle_send(&mut self, id: ListenerId) -> Result<(), DispatchError> {
        let Some(continuation) = self.scheduler.take(id) else {
            return self.rearm(id);
        };
        let client = continuation.client();
        let message = continuation.into_message();
        let outcome = match self.registry.lookup(client) {
            Ok(conn) => self.router.try_send(&conn.channel().remote, message),
            Err(_) => Err(SendError { error: IpcError::BadCapability, message }),
        };
        match outcome {
            Ok(()) => {
                trace!(target: "init::dispatch", "{id}: response delivered to {client}");
                self.rearm(id)?;
                debug!(target: "init::dispatch", "stats {:?}", self.stats);
                Ok(())
            }
            Err(SendError { error: IpcError::WouldBlock, message }) => {
                self.park(id, Continuation::Retry { client, message });
                Ok(())
            }
            Err(SendError { error, message }) => {
                warn!(target: "init::dispatch", "{id}: response to {client} dropped: {error}");
                if let Some(region) = message.into_parts().1.and_then(|cap| cap.frame_region()) {
                    self.allocator.release(region);
                }
                // A provisioning failure is logged by `rearm`; the send failure is what the loop sees.
                let _ = self.rearm(id);
                Err(DispatchError::SendFailed { listener: id, client, source: error })
            }
        }
    }

    fn rearm(&mut self, id: ListenerId) -> Result<(), DispatchError> {
        let listener = &mut self.listeners[id.index()];
        match listener.endpoint.alloc_recv_slot() {
            Ok(()) => {
                listener.state = ListenerState::AwaitingRecv;
                Ok(())
            }
            Err(source) => {
                listener.state = ListenerState::Failed;
                error!(target: "init::dispatch", "{id}: cannot provision receive slot: {source}");
                Err(DispatchError::ChannelFailed { listener: id, source })
            }
        }
    }
}
