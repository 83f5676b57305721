//! Channel endpoints
//!
//! A connection is a pair of [`ChannelEnd`]s sharing one `Link`. The link
//! holds both endpoint states and both receive queues behind a single mutex,
//! so every state transition that touches both sides happens atomically.
//!
//! ## Endpoint states
//!
//! ```text
//!   client: Invalid --attach--> Connecting --accept--> Connected
//!              \--no port, WAIT_FOR_PORT--> WaitingForPort --publish--> Connecting
//!   server:                     Accepting  --accept--> Connected
//!   either: any live state --shutdown--> Disconnecting
//! ```
//!
//! Shutting down one side moves both sides to Disconnecting. The peer sees
//! HUP but can still drain the messages already queued for it; the closing
//! side's own receive queue is released immediately.
//!
//! Lock order: port, then link, then wait queues. Handles released from a
//! queue are always dropped after the link lock is gone.

use crate::handle::{HandleOps, HandleRef};
use crate::msg_queue::MsgQueue;
use crate::sync::lock;
use crate::wait::WaitQueue;
use bitflags::bitflags;
use core_types::{AppUuid, MsgId};
use kernel_api::{KernelError, KernelResult, MsgInfo, ReadyFlags, Timeout};
use log::{debug, trace};
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

/// Connection state of one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChanState {
    Invalid,
    Accepting,
    Connecting,
    Connected,
    Disconnecting,
    WaitingForPort,
}

bitflags! {
    /// One-shot conditions tracked beside the endpoint state
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AuxState: u32 {
        /// Last send failed on a full peer queue
        const SEND_BLOCKED = 0x1;
        /// Peer freed a slot after a blocked send
        const SEND_UNBLOCKED = 0x2;
        /// Connection accepted, not yet reported
        const CONNECTED = 0x4;
    }
}

/// Which end of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    fn index(self) -> usize {
        match self {
            Side::Client => 0,
            Side::Server => 1,
        }
    }

    fn peer(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

#[derive(Debug)]
struct EndState {
    state: ChanState,
    aux: AuxState,
    inbox: Option<MsgQueue>,
}

impl EndState {
    fn new() -> Self {
        Self {
            state: ChanState::Invalid,
            aux: AuxState::empty(),
            inbox: None,
        }
    }

    fn poll(&self) -> ReadyFlags {
        let mut ready = ReadyFlags::empty();
        match self.state {
            ChanState::Invalid => return ReadyFlags::ERROR,
            ChanState::Disconnecting => ready |= ReadyFlags::HUP,
            _ => {}
        }
        if self.aux.contains(AuxState::CONNECTED) {
            ready |= ReadyFlags::READY;
        }
        if self.inbox.as_ref().is_some_and(|q| !q.is_empty()) {
            ready |= ReadyFlags::MSG;
        }
        if self.aux.contains(AuxState::SEND_UNBLOCKED) {
            ready |= ReadyFlags::SEND_UNBLOCKED;
        }
        ready
    }

    /// Moves a live endpoint to Disconnecting; returns whether it changed
    fn disconnect(&mut self) -> bool {
        match self.state {
            ChanState::Accepting
            | ChanState::Connecting
            | ChanState::Connected
            | ChanState::WaitingForPort => {
                self.state = ChanState::Disconnecting;
                true
            }
            ChanState::Invalid | ChanState::Disconnecting => false,
        }
    }
}

#[derive(Debug)]
struct LinkState {
    ends: [EndState; 2],
}

/// State shared by both ends of one connection
pub(crate) struct Link {
    path: String,
    client_uuid: AppUuid,
    server_uuid: OnceLock<AppUuid>,
    state: Mutex<LinkState>,
    waitqs: [Arc<WaitQueue>; 2],
}

/// One endpoint of a connection
pub struct ChannelEnd {
    link: Arc<Link>,
    side: Side,
}

impl ChannelEnd {
    /// Creates the client end of a connection that is not yet attached
    pub(crate) fn new_client(client_uuid: AppUuid, path: &str) -> Arc<Self> {
        let link = Link {
            path: path.to_string(),
            client_uuid,
            server_uuid: OnceLock::new(),
            state: Mutex::new(LinkState {
                ends: [EndState::new(), EndState::new()],
            }),
            waitqs: [Arc::new(WaitQueue::new()), Arc::new(WaitQueue::new())],
        };
        Arc::new(Self {
            link: Arc::new(link),
            side: Side::Client,
        })
    }

    /// Pairs this client with a new server end owned by `server_uuid`
    ///
    /// Both ends get a receive queue of `num_bufs` slots of `buf_size`
    /// bytes. The client moves to Connecting and the server to Accepting.
    pub(crate) fn attach_server(
        self: &Arc<Self>,
        server_uuid: AppUuid,
        num_bufs: usize,
        buf_size: usize,
        max_msg_handles: usize,
    ) -> KernelResult<Arc<ChannelEnd>> {
        debug_assert_eq!(self.side, Side::Client);
        let mut st = lock(&self.link.state);
        let client = Side::Client.index();
        let server = Side::Server.index();
        match st.ends[client].state {
            ChanState::Invalid | ChanState::WaitingForPort => {}
            _ => return Err(KernelError::PeerClosed),
        }
        let client_inbox = MsgQueue::new(num_bufs, buf_size, max_msg_handles)?;
        let server_inbox = MsgQueue::new(num_bufs, buf_size, max_msg_handles)?;
        // a link is attached at most once, so the server uuid is unset here
        let _ = self.link.server_uuid.set(server_uuid);

        st.ends[client].state = ChanState::Connecting;
        st.ends[client].inbox = Some(client_inbox);
        st.ends[server].state = ChanState::Accepting;
        st.ends[server].inbox = Some(server_inbox);
        trace!("channel to '{}' attached", self.link.path);

        Ok(Arc::new(ChannelEnd {
            link: self.link.clone(),
            side: Side::Server,
        }))
    }

    /// Marks a client as parked until its port is published
    pub(crate) fn set_waiting_for_port(&self) {
        lock(&self.link.state).ends[self.side.index()].state = ChanState::WaitingForPort;
    }

    pub(crate) fn is_waiting_for_port(&self) -> bool {
        self.state() == ChanState::WaitingForPort
    }

    /// Completes a pending connection on the server side
    ///
    /// Fails with [`KernelError::PeerClosed`] if either side was shut down
    /// while the connection waited in the port's queue.
    pub(crate) fn complete_accept(&self) -> KernelResult<()> {
        debug_assert_eq!(self.side, Side::Server);
        let released = {
            let mut st = lock(&self.link.state);
            let server = Side::Server.index();
            let client = Side::Client.index();
            if st.ends[server].state == ChanState::Accepting
                && st.ends[client].state == ChanState::Connecting
            {
                st.ends[server].state = ChanState::Connected;
                st.ends[client].state = ChanState::Connected;
                st.ends[client].aux |= AuxState::CONNECTED;
                self.link.waitqs[client].notify();
                return Ok(());
            }
            debug!(
                "dropping connection to '{}': client {:?}, server {:?}",
                self.link.path, st.ends[client].state, st.ends[server].state
            );
            self.shutdown_locked(&mut st)
        };
        drop(released);
        Err(KernelError::PeerClosed)
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Path of the port this connection was made to
    pub fn path(&self) -> &str {
        &self.link.path
    }

    pub fn state(&self) -> ChanState {
        lock(&self.link.state).ends[self.side.index()].state
    }

    pub fn aux_state(&self) -> AuxState {
        lock(&self.link.state).ends[self.side.index()].aux
    }

    /// Identity of the application owning this end
    pub fn own_uuid(&self) -> Option<AppUuid> {
        match self.side {
            Side::Client => Some(self.link.client_uuid),
            Side::Server => self.link.server_uuid.get().copied(),
        }
    }

    /// Identity of the application owning the other end, once attached
    pub fn peer_uuid(&self) -> Option<AppUuid> {
        match self.side {
            Side::Client => self.link.server_uuid.get().copied(),
            Side::Server => Some(self.link.client_uuid),
        }
    }

    /// Queues a message for the peer
    ///
    /// The handles in `handles` move into the message on success and stay
    /// with the caller on failure. A full peer queue fails with
    /// [`KernelError::QueueFull`] and arms SEND_UNBLOCKED for this end.
    pub fn send_msg(&self, segments: &[&[u8]], handles: &mut Vec<HandleRef>) -> KernelResult<usize> {
        let mut st = lock(&self.link.state);
        let own = self.side.index();
        let peer = self.side.peer().index();
        match st.ends[own].state {
            ChanState::Connected => {}
            ChanState::Disconnecting => return Err(KernelError::PeerClosed),
            _ => return Err(KernelError::NotReady),
        }
        let inbox = st.ends[peer].inbox.as_mut().ok_or(KernelError::NotReady)?;
        match inbox.enqueue(segments, handles) {
            Ok(len) => {
                st.ends[own]
                    .aux
                    .remove(AuxState::SEND_BLOCKED | AuxState::SEND_UNBLOCKED);
                self.link.waitqs[peer].notify();
                Ok(len)
            }
            Err(KernelError::QueueFull) => {
                st.ends[own].aux |= AuxState::SEND_BLOCKED;
                Err(KernelError::QueueFull)
            }
            Err(err) => Err(err),
        }
    }

    /// Queues a message, waiting for the peer to free a slot if needed
    ///
    /// Returns [`KernelError::TimedOut`] if no slot frees up in time and
    /// [`KernelError::PeerClosed`] if the connection goes away meanwhile.
    pub fn send_msg_blocking(
        &self,
        segments: &[&[u8]],
        handles: &mut Vec<HandleRef>,
        timeout: Timeout,
    ) -> KernelResult<usize> {
        let deadline = timeout.start();
        let event = self.wait_queue().event().clone();
        loop {
            let seen = event.sequence();
            match self.send_msg(segments, handles) {
                Err(KernelError::QueueFull) => {}
                other => return other,
            }
            trace!("send to '{}' blocked on full queue", self.link.path);
            event.wait_since(seen, &deadline)?;
        }
    }

    fn with_inbox<T>(&self, f: impl FnOnce(&mut MsgQueue) -> KernelResult<T>) -> KernelResult<T> {
        let mut st = lock(&self.link.state);
        let inbox = st.ends[self.side.index()]
            .inbox
            .as_mut()
            .ok_or(KernelError::NotReady)?;
        f(inbox)
    }

    /// Describes the next waiting message without retrieving it
    pub fn peek_msg(&self) -> KernelResult<MsgInfo> {
        self.with_inbox(|q| q.peek_next())
    }

    /// Retrieves the next waiting message
    pub fn get_msg(&self) -> KernelResult<MsgInfo> {
        self.with_inbox(|q| q.get_next())
    }

    /// Copies payload of a retrieved message
    pub fn read_msg(&self, id: MsgId, offset: usize, dst: &mut [&mut [u8]]) -> KernelResult<usize> {
        self.with_inbox(|q| q.read(id, offset, dst))
    }

    /// Takes the handles attached to a retrieved message
    pub fn take_msg_handles(&self, id: MsgId) -> KernelResult<Vec<HandleRef>> {
        self.with_inbox(|q| q.take_handles(id))
    }

    /// Returns handles to a retrieved message after a failed install
    pub fn restore_msg_handles(&self, id: MsgId, handles: Vec<HandleRef>) -> KernelResult<()> {
        self.with_inbox(|q| q.restore_handles(id, handles))
    }

    /// Releases a retrieved message
    ///
    /// Frees the slot, drops any handles the receiver did not take, and
    /// raises SEND_UNBLOCKED on the peer if its last send hit a full queue.
    pub fn put_msg(&self, id: MsgId) -> KernelResult<()> {
        let released = {
            let mut st = lock(&self.link.state);
            let own = self.side.index();
            let peer = self.side.peer().index();
            let inbox = st.ends[own].inbox.as_mut().ok_or(KernelError::NotReady)?;
            let released = inbox.consume(id)?;
            let peer_end = &mut st.ends[peer];
            if peer_end.aux.contains(AuxState::SEND_BLOCKED) {
                peer_end.aux.remove(AuxState::SEND_BLOCKED);
                peer_end.aux |= AuxState::SEND_UNBLOCKED;
                self.link.waitqs[peer].notify();
            }
            released
        };
        drop(released);
        Ok(())
    }

    /// Disconnects both sides and releases this side's queued messages
    fn shutdown_locked(&self, st: &mut LinkState) -> Vec<HandleRef> {
        let own = self.side.index();
        let peer = self.side.peer().index();
        if st.ends[own].disconnect() {
            self.link.waitqs[own].notify();
        }
        if st.ends[peer].disconnect() {
            self.link.waitqs[peer].notify();
        }
        st.ends[own]
            .inbox
            .as_mut()
            .map(MsgQueue::clear)
            .unwrap_or_default()
    }

    fn shutdown_end(&self) {
        let released = {
            let mut st = lock(&self.link.state);
            self.shutdown_locked(&mut st)
        };
        if !released.is_empty() {
            debug!(
                "channel to '{}' closed with {} queued handles",
                self.link.path,
                released.len()
            );
        }
        drop(released);
    }
}

impl HandleOps for ChannelEnd {
    fn poll(&self) -> ReadyFlags {
        lock(&self.link.state).ends[self.side.index()].poll()
    }

    fn finalize_event(&self, event: ReadyFlags) {
        let mut st = lock(&self.link.state);
        let aux = &mut st.ends[self.side.index()].aux;
        if event.contains(ReadyFlags::READY) {
            aux.remove(AuxState::CONNECTED);
        }
        if event.contains(ReadyFlags::SEND_UNBLOCKED) {
            aux.remove(AuxState::SEND_UNBLOCKED);
        }
    }

    fn shutdown(&self) {
        self.shutdown_end();
    }

    fn destroy(&self) {
        trace!("destroying {:?} end of '{}'", self.side, self.link.path);
        self.shutdown_end();
    }

    fn wait_queue(&self) -> &Arc<WaitQueue> {
        &self.link.waitqs[self.side.index()]
    }
}

impl fmt::Debug for ChannelEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelEnd")
            .field("path", &self.link.path)
            .field("side", &self.side)
            .field("state", &self.state())
            .finish()
    }
}
