//! Protocol sessions: lifecycle, namespacing and aborts.
//!
//! Every running protocol instance owns a [`Session`]. The session knows the
//! instance's [`SessionId`], builds the headers of its messages and allocates
//! the namespaces of the sub-protocols the instance composes. A parent must
//! allocate every sub-session through [`Session::add_sub_session`], exactly
//! once per sub-protocol instance; this is what keeps concurrently running
//! instances on one [`Rpc`] from producing equal headers.
//!
//! # Lifecycle
//!
//! ```text
//! Created -> InitBegin -> InitStep(1..n) -> InitEnd -> PtoBegin -> PtoStep(1..n) -> PtoEnd
//!                                                         ^                            |
//!                                                         +----------------------------+
//! ```
//!
//! Each pass through `PtoBegin` starts a new invocation. The invocation number
//! is part of every header's `sequence`, so repeated invocations of the same
//! protocol never collide.
//!
//! # Aborts
//!
//! Invalid data from another party aborts the session with
//! [`Error::Abort`]. The session's queued packets (and those of its
//! sub-sessions) are purged from the mailbox and packets that arrive later are
//! discarded, so the [`Rpc`] can be reused by other protocol runs.
use std::{collections::HashMap, fmt, num::NonZero, sync::Arc, thread};

use futures::future::try_join_all;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use crate::{
    Error,
    error::AbortReason,
    header::{Header, PartyId},
    namespace::SessionId,
    packet::Packet,
    registry::ProtocolDescription,
    rpc::Rpc,
    transport::Transport,
};

/// The lifecycle phase of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// The session was created but not initialized.
    Created,
    /// Initialization started.
    InitBegin,
    /// The n-th initialization step is running.
    InitStep(u32),
    /// Initialization finished.
    InitEnd,
    /// An invocation of the protocol started.
    PtoBegin,
    /// The n-th step of the current invocation is running.
    PtoStep(u32),
    /// The current invocation finished.
    PtoEnd,
    /// The session was aborted and cannot be used anymore.
    Aborted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Created => f.write_str("CREATED"),
            Phase::InitBegin => f.write_str("INIT_BEGIN"),
            Phase::InitStep(n) => write!(f, "INIT_STEP({n})"),
            Phase::InitEnd => f.write_str("INIT_END"),
            Phase::PtoBegin => f.write_str("PTO_BEGIN"),
            Phase::PtoStep(n) => write!(f, "PTO_STEP({n})"),
            Phase::PtoEnd => f.write_str("PTO_END"),
            Phase::Aborted => f.write_str("ABORTED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Direction {
    Outgoing,
    Incoming,
}

/// The state of one protocol instance, see the [module docs](self).
pub struct Session<T: Transport> {
    rpc: Arc<Rpc<T>>,
    protocol: ProtocolDescription,
    id: SessionId,
    phase: Phase,
    invocation: u32,
    next_child: u32,
    parallel: bool,
    rounds: HashMap<(Direction, u32, PartyId), u32>,
}

impl<T: Transport> Session<T> {
    /// Creates the session of a root protocol run.
    ///
    /// Claiming the id of an earlier, aborted session lifts its tombstone, so
    /// the peers' packets of this run are accepted again. The peers must have
    /// stopped sending in the aborted run by then.
    pub fn new(rpc: Arc<Rpc<T>>, protocol: ProtocolDescription, id: SessionId) -> Self {
        rpc.mailbox().release_session(id);
        Self {
            rpc,
            protocol,
            id,
            phase: Phase::Created,
            invocation: 0,
            next_child: 0,
            parallel: false,
            rounds: HashMap::new(),
        }
    }

    /// Allocates the session of the next sub-protocol composed by this one.
    ///
    /// The sub-session inherits the parallelism setting of its parent.
    pub fn add_sub_session(&mut self, protocol: ProtocolDescription) -> Result<Self, Error> {
        let ordinal = self.next_child;
        let id = self
            .id
            .child(ordinal)
            .ok_or(Error::NamespaceExhausted {
                parent: self.id,
                ordinal,
            })?;
        self.next_child += 1;
        debug!(parent = %self.id, child = %id, protocol = protocol.name(), "sub-session");
        let mut child = Self::new(self.rpc.clone(), protocol, id);
        child.parallel = self.parallel;
        Ok(child)
    }

    /// The namespace of this session.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The protocol this session runs.
    pub fn protocol(&self) -> &ProtocolDescription {
        &self.protocol
    }

    /// The current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The number of the current invocation, `0` during initialization.
    pub fn invocation(&self) -> u32 {
        self.invocation
    }

    /// The channel this session communicates over.
    pub fn rpc(&self) -> &Arc<Rpc<T>> {
        &self.rpc
    }

    /// The party running this session.
    pub fn own_party(&self) -> PartyId {
        self.rpc.own_party()
    }

    /// Whether [`Session::map_rows`] distributes work over a worker pool.
    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    /// Enables or disables distributing [`Session::map_rows`] over a worker pool.
    pub fn set_parallel(&mut self, parallel: bool) {
        self.parallel = parallel;
    }

    fn transition(&mut self, next: Phase) {
        let valid = matches!(
            (self.phase, next),
            (Phase::Created, Phase::InitBegin)
                | (Phase::InitBegin | Phase::InitStep(_), Phase::InitStep(_))
                | (Phase::InitBegin | Phase::InitStep(_), Phase::InitEnd)
                | (Phase::InitEnd | Phase::PtoEnd, Phase::PtoBegin)
                | (Phase::PtoBegin | Phase::PtoStep(_), Phase::PtoStep(_))
                | (Phase::PtoBegin | Phase::PtoStep(_), Phase::PtoEnd)
        );
        assert!(
            valid,
            "session {} of {} cannot go from {} to {next}",
            self.id,
            self.protocol.name(),
            self.phase
        );
        debug!(session = %self.id, from = %self.phase, to = %next, "phase");
        self.phase = next;
    }

    /// Starts the initialization.
    ///
    /// # Panics
    /// - If this and the following phase methods are called out of order.
    pub fn init_begin(&mut self) {
        self.transition(Phase::InitBegin);
        self.rounds.clear();
    }

    /// Advances to the next initialization step and returns its number.
    pub fn init_step(&mut self) -> u32 {
        let n = match self.phase {
            Phase::InitStep(n) => n + 1,
            _ => 1,
        };
        self.transition(Phase::InitStep(n));
        n
    }

    /// Finishes the initialization.
    pub fn init_end(&mut self) {
        self.transition(Phase::InitEnd);
    }

    /// Starts a new invocation of the protocol.
    pub fn pto_begin(&mut self) {
        self.transition(Phase::PtoBegin);
        self.invocation += 1;
        self.rounds.clear();
    }

    /// Advances to the next step of the current invocation and returns its number.
    pub fn pto_step(&mut self) -> u32 {
        let n = match self.phase {
            Phase::PtoStep(n) => n + 1,
            _ => 1,
        };
        self.transition(Phase::PtoStep(n));
        n
    }

    /// Finishes the current invocation.
    ///
    /// Packets of this session that are still in the mailbox at this point
    /// were never received, which hints at a bug in the protocol.
    pub fn pto_end(&mut self) {
        self.transition(Phase::PtoEnd);
        let leftover = self.rpc.mailbox().pending_in(self.id);
        if leftover > 0 {
            warn!(
                session = %self.id,
                protocol = self.protocol.name(),
                leftover,
                "unconsumed packets at end of invocation"
            );
        }
    }

    /// The sequence number of `round` in the current invocation.
    fn sequence(&self, round: u32) -> u64 {
        (u64::from(self.invocation) << 32) | u64::from(round)
    }

    /// The header of the `round`-th message of `step` this party sends to `receiver`.
    pub fn header(&self, step: u32, round: u32, receiver: PartyId) -> Header {
        Header::new(
            self.id,
            &self.protocol,
            step,
            self.sequence(round),
            self.own_party(),
            receiver,
        )
    }

    /// The header of the `round`-th message of `step` this party expects from `sender`.
    pub fn expect(&self, step: u32, round: u32, sender: PartyId) -> Header {
        Header::new(
            self.id,
            &self.protocol,
            step,
            self.sequence(round),
            sender,
            self.own_party(),
        )
    }

    fn round(&self, direction: Direction, step: u32, party: PartyId) -> u32 {
        self.rounds
            .get(&(direction, step, party))
            .copied()
            .unwrap_or_default()
    }

    /// Moves past a round once its message was sent or received.
    fn advance(&mut self, direction: Direction, step: u32, party: PartyId) {
        *self.rounds.entry((direction, step, party)).or_default() += 1;
    }

    fn assert_usable(&self) {
        assert_ne!(
            self.phase,
            Phase::Aborted,
            "session {} was aborted",
            self.id
        );
    }

    /// Sends the next message of `step` to `to`.
    ///
    /// Consecutive messages of the same step to the same party use consecutive
    /// rounds, matching consecutive calls of [`Session::receive`] on the other side.
    /// A failed send does not use up its round.
    pub async fn send(
        &mut self,
        step: u32,
        to: PartyId,
        blocks: Vec<Vec<u8>>,
    ) -> Result<(), Error> {
        self.assert_usable();
        let round = self.round(Direction::Outgoing, step, to);
        let header = self.header(step, round, to);
        self.rpc.send(Packet::new(header, blocks)).await?;
        self.advance(Direction::Outgoing, step, to);
        Ok(())
    }

    /// Receives the next message of `step` from `from`.
    ///
    /// If the receive times out, fails or is dropped, the next call waits for
    /// the same message again.
    pub async fn receive(&mut self, step: u32, from: PartyId) -> Result<Packet, Error> {
        self.assert_usable();
        let round = self.round(Direction::Incoming, step, from);
        let header = self.expect(step, round, from);
        let packet = self.rpc.receive(&header).await?;
        self.advance(Direction::Incoming, step, from);
        Ok(packet)
    }

    /// Receives the next message of `step` from `from`, aborting unless it
    /// contains exactly `count` blocks.
    pub async fn receive_blocks(
        &mut self,
        step: u32,
        from: PartyId,
        count: usize,
    ) -> Result<Vec<Vec<u8>>, Error> {
        let packet = self.receive(step, from).await?;
        if packet.block_count() != count {
            return Err(self.abort(AbortReason::BlockCount {
                from,
                expected: count,
                actual: packet.block_count(),
            }));
        }
        Ok(packet.into_payload())
    }

    /// Serializes `value` with `bincode` and sends it as a single block.
    pub async fn send_value<V: Serialize>(
        &mut self,
        step: u32,
        to: PartyId,
        value: &V,
    ) -> Result<(), Error> {
        let block = bincode::serialize(value).map_err(|e| Error::Serialize(format!("{e:?}")))?;
        self.send(step, to, vec![block]).await
    }

    /// Receives a single block and deserializes it, aborting if that fails.
    pub async fn receive_value<V: DeserializeOwned>(
        &mut self,
        step: u32,
        from: PartyId,
    ) -> Result<V, Error> {
        let mut blocks = self.receive_blocks(step, from, 1).await?;
        let block = blocks.pop().unwrap_or_default();
        bincode::deserialize(&block).map_err(|e| {
            self.abort(AbortReason::Malformed {
                from,
                detail: format!("{e:?}"),
            })
        })
    }

    /// Aborts unless `condition` holds.
    pub fn ensure(
        &mut self,
        condition: bool,
        reason: impl FnOnce() -> AbortReason,
    ) -> Result<(), Error> {
        if condition {
            Ok(())
        } else {
            Err(self.abort(reason()))
        }
    }

    /// Aborts the session because another party misbehaved.
    ///
    /// Purges all queued packets of this session and its sub-sessions and
    /// returns the error to propagate to the caller.
    pub fn abort(&mut self, reason: AbortReason) -> Error {
        let purged = self.rpc.mailbox().purge_session(self.id);
        warn!(session = %self.id, protocol = self.protocol.name(), %reason, purged, "aborting session");
        self.phase = Phase::Aborted;
        Error::Abort(reason)
    }

    /// Applies `f` to every row, on the blocking worker pool if the session is
    /// parallel. The order of the results matches the order of the rows.
    pub async fn map_rows<I, O, F>(&self, rows: Vec<I>, f: F) -> Result<Vec<O>, Error>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(I) -> O + Send + Sync + 'static,
    {
        if !self.parallel || rows.len() < 2 {
            return Ok(rows.into_iter().map(f).collect());
        }
        let workers = thread::available_parallelism()
            .map_or(1, NonZero::get)
            .min(rows.len());
        let chunk_size = rows.len().div_ceil(workers);
        let f = Arc::new(f);
        let mut rows = rows.into_iter();
        let mut tasks = vec![];
        loop {
            let chunk: Vec<I> = rows.by_ref().take(chunk_size).collect();
            if chunk.is_empty() {
                break;
            }
            let f = f.clone();
            tasks.push(tokio::task::spawn_blocking(move || {
                chunk.into_iter().map(&*f).collect::<Vec<O>>()
            }));
        }
        let results = try_join_all(tasks).await.map_err(|e| {
            if e.is_panic() {
                std::panic::resume_unwind(e.into_panic());
            }
            Error::Worker(format!("{e:?}"))
        })?;
        Ok(results.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{rpc::RpcConfig, transport::MemoryTransport};

    fn protocol() -> ProtocolDescription {
        ProtocolDescription::register(0x5e55_0001, "session.test", 3).unwrap()
    }

    fn session() -> Session<MemoryTransport> {
        let rpc = Rpc::simulated(&[PartyId(0), PartyId(1)], RpcConfig::default()).remove(0);
        Session::new(Arc::new(rpc), protocol(), SessionId::root(11))
    }

    #[test]
    fn full_lifecycle() {
        let mut session = session();
        assert_eq!(session.phase(), Phase::Created);
        session.init_begin();
        assert_eq!(session.init_step(), 1);
        assert_eq!(session.init_step(), 2);
        session.init_end();
        for invocation in 1..=2 {
            session.pto_begin();
            assert_eq!(session.invocation(), invocation);
            assert_eq!(session.pto_step(), 1);
            session.pto_end();
        }
        assert_eq!(session.phase(), Phase::PtoEnd);
    }

    #[test]
    #[should_panic(expected = "cannot go from CREATED to PTO_BEGIN")]
    fn pto_before_init_panics() {
        session().pto_begin();
    }

    #[test]
    #[should_panic(expected = "cannot go from INIT_END to INIT_STEP(1)")]
    fn init_step_after_init_end_panics() {
        let mut session = session();
        session.init_begin();
        session.init_end();
        session.init_step();
    }

    #[test]
    fn sub_sessions_get_distinct_namespaces() {
        let mut parent = session();
        parent.set_parallel(true);
        let a = parent.add_sub_session(protocol()).unwrap();
        let b = parent.add_sub_session(protocol()).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().parent(), Some(parent.id()));
        assert_eq!(b.id().ordinal(), Some(1));
        assert!(a.is_parallel());
    }

    #[test]
    fn invocations_change_sequences() {
        let mut session = session();
        session.init_begin();
        let init = session.header(0, 0, PartyId(1));
        session.init_end();
        session.pto_begin();
        let first = session.header(0, 0, PartyId(1));
        session.pto_end();
        session.pto_begin();
        let second = session.header(0, 0, PartyId(1));
        assert_ne!(init, first);
        assert_ne!(first, second);
        assert_eq!(second.sequence(), 2 << 32);
        assert_eq!(session.expect(0, 0, PartyId(1)).sender(), PartyId(1));
    }

    #[test]
    fn namespace_exhaustion_is_an_error() {
        let mut parent = session();
        for _ in 0..=crate::namespace::MAX_ORDINAL {
            parent.add_sub_session(protocol()).unwrap();
        }
        assert!(matches!(
            parent.add_sub_session(protocol()),
            Err(Error::NamespaceExhausted { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn map_rows_keeps_order() {
        let mut session = session();
        let rows: Vec<u64> = (0..1000).collect();
        let sequential = session.map_rows(rows.clone(), |x| x * x).await.unwrap();
        session.set_parallel(true);
        let parallel = session.map_rows(rows, |x| x * x).await.unwrap();
        assert_eq!(sequential, parallel);
        assert_eq!(parallel[999], 999 * 999);
    }

    #[test]
    fn ensure_aborts() {
        let mut session = session();
        session.init_begin();
        assert!(session.ensure(true, || unreachable!()).is_ok());
        let err = session
            .ensure(false, || AbortReason::OutOfRange("x > 3".into()))
            .unwrap_err();
        assert!(err.is_abort());
        assert_eq!(session.phase(), Phase::Aborted);
    }
}
