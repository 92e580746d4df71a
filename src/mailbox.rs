//! The mailbox demultiplexing incoming packets to waiting consumers.
//!
//! Packets are partitioned by their sender. Consumers either wait for a packet
//! with an exact [`Header`] ([`Mailbox::take`]) or for the oldest packet of a
//! sender regardless of its header ([`Mailbox::take_from`]). Both retrieval
//! modes operate on the same per-sender queue, guarded by a single mutex per
//! mailbox, so a packet is always delivered exactly once.
//!
//! # Handoff
//!
//! A consumer that finds no matching packet registers itself as a waiter of the
//! partition and suspends on a oneshot channel. [`Mailbox::put`] then hands the
//! packet directly to the first matching waiter instead of queueing it:
//!
//! - waiters for the exact header of the packet are served before wildcard
//!   waiters of the same sender,
//! - among waiters of the same kind, the one registered first is served first.
//!
//! Waiting is cancellation safe: dropping a waiting future removes its
//! registration, and a packet that was handed to it but never observed is
//! dispatched again at the front of its partition.
use std::{
    collections::{HashMap, HashSet, VecDeque},
    iter,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    header::{Header, PartyId},
    namespace::SessionId,
    packet::Packet,
    registry::SYNC_PROTOCOL_ID,
};

/// Maximum number of aborted namespaces remembered at once, the oldest is
/// forgotten first.
pub const MAX_TOMBSTONES: usize = 1024;

/// Errors raised while waiting for a packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MailboxError {
    /// The partition of the sender was closed and holds no matching packet.
    #[error("no more packets can arrive from {0}")]
    Closed(PartyId),
    /// No matching packet arrived within the timeout.
    #[error("timed out waiting for a packet")]
    TimedOut,
    /// The wait was cancelled through its cancellation token.
    #[error("waiting for a packet was cancelled")]
    Cancelled,
}

/// Describes which packet a consumer is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    /// The packet with exactly this header.
    Exact(Header),
    /// The oldest packet of this sender.
    Any(PartyId),
}

impl Selector {
    /// The sender whose partition the selector refers to.
    pub fn sender(&self) -> PartyId {
        match self {
            Selector::Exact(header) => header.sender(),
            Selector::Any(sender) => *sender,
        }
    }
}

/// A concurrent store of undelivered packets, see the [module docs](self).
#[derive(Debug, Default)]
pub struct Mailbox {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    partitions: HashMap<PartyId, Partition>,
    aborted: HashSet<SessionId>,
    aborted_order: VecDeque<SessionId>,
    closed: bool,
    next_waiter: u64,
}

#[derive(Debug, Default)]
struct Partition {
    queue: VecDeque<Packet>,
    waiters: Vec<Waiter>,
    closed: bool,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    selector: Selector,
    tx: oneshot::Sender<Packet>,
}

impl Partition {
    fn pop_matching(&mut self, selector: &Selector) -> Option<Packet> {
        match selector {
            Selector::Any(_) => self.queue.pop_front(),
            Selector::Exact(header) => {
                let i = self.queue.iter().position(|p| p.header() == header)?;
                self.queue.remove(i)
            }
        }
    }

    /// Hands `packet` to the first eligible waiter or queues it.
    fn dispatch(&mut self, mut packet: Packet, at_front: bool) {
        loop {
            let exact = self.waiters.iter().position(
                |w| matches!(w.selector, Selector::Exact(header) if header == *packet.header()),
            );
            let any = || {
                self.waiters
                    .iter()
                    .position(|w| matches!(w.selector, Selector::Any(_)))
            };
            let Some(i) = exact.or_else(any) else {
                if at_front {
                    self.queue.push_front(packet);
                } else {
                    self.queue.push_back(packet);
                }
                return;
            };
            let waiter = self.waiters.remove(i);
            match waiter.tx.send(packet) {
                Ok(()) => return,
                // the receiving side is gone, try the next waiter
                Err(returned) => packet = returned,
            }
        }
    }
}

impl State {
    /// Whether `header` belongs to an aborted namespace. Barrier markers never do.
    fn is_aborted(&self, header: &Header) -> bool {
        if header.protocol_id() == SYNC_PROTOCOL_ID || self.aborted.is_empty() {
            return false;
        }
        iter::successors(Some(header.session_id()), |id| id.parent())
            .any(|id| self.aborted.contains(&id))
    }

    fn tombstone(&mut self, session: SessionId) {
        if !self.aborted.insert(session) {
            return;
        }
        self.aborted_order.push_back(session);
        while self.aborted_order.len() > MAX_TOMBSTONES {
            if let Some(oldest) = self.aborted_order.pop_front() {
                self.aborted.remove(&oldest);
            }
        }
    }

    fn is_closed(&self, sender: PartyId) -> bool {
        self.closed || self.partitions.get(&sender).is_some_and(|p| p.closed)
    }
}

impl Mailbox {
    /// Creates an empty mailbox.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // the state is never left inconsistent while the lock is held
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a packet, waking the consumer waiting for it. Never blocks.
    ///
    /// Packets of aborted sessions (see [`Mailbox::purge_session`]) are dropped.
    pub fn put(&self, packet: Packet) {
        let mut state = self.lock();
        let header = *packet.header();
        if state.is_aborted(&header) {
            warn!(%header, "dropping packet of aborted session");
            return;
        }
        debug!(%header, blocks = packet.block_count(), "mailbox put");
        state
            .partitions
            .entry(header.sender())
            .or_default()
            .dispatch(packet, false);
    }

    /// Waits for the packet with exactly the given header and removes it.
    ///
    /// If several packets share the header, they are returned in the order in
    /// which they were put. Other packets of the sender keep their order.
    pub async fn take(&self, header: &Header) -> Result<Packet, MailboxError> {
        self.wait(Selector::Exact(*header)).await
    }

    /// Waits for the oldest packet of `sender` and removes it.
    pub async fn take_from(&self, sender: PartyId) -> Result<Packet, MailboxError> {
        self.wait(Selector::Any(sender)).await
    }

    /// Like [`Mailbox::take`] or [`Mailbox::take_from`], but gives up after `timeout`.
    pub async fn take_timeout(
        &self,
        selector: Selector,
        timeout: Duration,
    ) -> Result<Packet, MailboxError> {
        tokio::time::timeout(timeout, self.wait(selector))
            .await
            .map_err(|_| MailboxError::TimedOut)?
    }

    /// Like [`Mailbox::take`] or [`Mailbox::take_from`], but gives up once
    /// `cancel` is cancelled.
    pub async fn take_until(
        &self,
        selector: Selector,
        cancel: &CancellationToken,
    ) -> Result<Packet, MailboxError> {
        tokio::select! {
            biased;
            packet = self.wait(selector) => packet,
            _ = cancel.cancelled() => Err(MailboxError::Cancelled),
        }
    }

    /// Waits for a packet matching `selector` and removes it.
    pub async fn wait(&self, selector: Selector) -> Result<Packet, MailboxError> {
        let registration = {
            let mut state = self.lock();
            let closed = state.is_closed(selector.sender());
            let id = state.next_waiter;
            let partition = state.partitions.entry(selector.sender()).or_default();
            if let Some(packet) = partition.pop_matching(&selector) {
                return Ok(packet);
            }
            if closed {
                return Err(MailboxError::Closed(selector.sender()));
            }
            let (tx, rx) = oneshot::channel();
            partition.waiters.push(Waiter { id, selector, tx });
            state.next_waiter += 1;
            Registration {
                mailbox: self,
                sender: selector.sender(),
                id,
                rx,
                done: false,
            }
        };
        registration.recv().await
    }

    /// Fails all current and future waits on `sender` that find no matching packet.
    ///
    /// Packets that are already queued can still be taken.
    pub fn close(&self, sender: PartyId) {
        let mut state = self.lock();
        let partition = state.partitions.entry(sender).or_default();
        partition.closed = true;
        // dropping the senders wakes the waiters with an error
        partition.waiters.clear();
    }

    /// Closes the partitions of all senders, including ones not seen yet.
    pub fn close_all(&self) {
        let mut state = self.lock();
        state.closed = true;
        for partition in state.partitions.values_mut() {
            partition.closed = true;
            partition.waiters.clear();
        }
    }

    /// Reverts [`Mailbox::close`] and [`Mailbox::close_all`].
    pub fn reopen_all(&self) {
        let mut state = self.lock();
        state.closed = false;
        for partition in state.partitions.values_mut() {
            partition.closed = false;
        }
    }

    /// Removes all queued packets of `session` and its sub-sessions and drops
    /// packets of them that arrive later, until the namespace is claimed again
    /// through [`Mailbox::release_session`].
    ///
    /// Barrier markers of [`crate::rpc::Rpc::synchronize`] are never affected.
    /// At most [`MAX_TOMBSTONES`] namespaces are remembered.
    ///
    /// Returns the number of removed packets.
    pub fn purge_session(&self, session: SessionId) -> usize {
        let mut state = self.lock();
        state.tombstone(session);
        let mut purged = 0;
        for partition in state.partitions.values_mut() {
            let before = partition.queue.len();
            partition.queue.retain(|p| {
                let header = p.header();
                header.protocol_id() == SYNC_PROTOCOL_ID
                    || !session.contains(header.session_id())
            });
            purged += before - partition.queue.len();
        }
        purged
    }

    /// Accepts packets of `session` and its sub-sessions again after an
    /// earlier [`Mailbox::purge_session`].
    ///
    /// Tombstones of enclosing sessions stay in place.
    pub fn release_session(&self, session: SessionId) {
        let mut state = self.lock();
        if state.aborted.is_empty() {
            return;
        }
        let State {
            aborted,
            aborted_order,
            ..
        } = &mut *state;
        aborted.retain(|id| !session.contains(*id));
        aborted_order.retain(|id| !session.contains(*id));
    }

    /// Number of queued, undelivered packets.
    pub fn pending(&self) -> usize {
        self.lock().partitions.values().map(|p| p.queue.len()).sum()
    }

    /// Number of queued packets sent by `sender`.
    pub fn pending_from(&self, sender: PartyId) -> usize {
        self.lock()
            .partitions
            .get(&sender)
            .map_or(0, |p| p.queue.len())
    }

    /// Number of queued packets of `session` and its sub-sessions.
    pub fn pending_in(&self, session: SessionId) -> usize {
        self.lock()
            .partitions
            .values()
            .flat_map(|p| p.queue.iter())
            .filter(|p| session.contains(p.header().session_id()))
            .count()
    }

    /// Whether no packets are queued.
    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        self.lock().partitions.values().map(|p| p.waiters.len()).sum()
    }

    #[cfg(test)]
    fn tombstone_count(&self) -> usize {
        self.lock().aborted.len()
    }
}

/// A registered waiter, deregisters itself when dropped before completion.
struct Registration<'a> {
    mailbox: &'a Mailbox,
    sender: PartyId,
    id: u64,
    rx: oneshot::Receiver<Packet>,
    done: bool,
}

impl Registration<'_> {
    async fn recv(mut self) -> Result<Packet, MailboxError> {
        let received = (&mut self.rx).await;
        self.done = true;
        received.map_err(|_| MailboxError::Closed(self.sender))
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut state = self.mailbox.lock();
        let Some(partition) = state.partitions.get_mut(&self.sender) else {
            return;
        };
        partition.waiters.retain(|w| w.id != self.id);
        // a packet may have been handed over after the last poll
        if let Ok(packet) = self.rx.try_recv() {
            partition.dispatch(packet, true);
        }
    }
}
