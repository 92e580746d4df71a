//! The communication endpoint of one party.
//!
//! An [`Rpc`] connects its party to all other parties through a
//! [`Transport`]. Outgoing packets are encoded and written as frames, incoming
//! frames are decoded by one reader task per peer and put into the party's
//! [`Mailbox`], from which protocol code receives them.
use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, info, instrument, warn};

use crate::{
    Error,
    codec,
    header::{Header, PartyId},
    mailbox::{Mailbox, Selector},
    namespace::SessionId,
    packet::Packet,
    registry::SYNC_PROTOCOL,
    transport::{FrameReader, FrameWriter, MemoryTransport, Transport},
};

/// Configuration of an [`Rpc`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// How long [`Rpc::receive`] and [`Rpc::receive_from`] wait for a packet,
    /// `None` waits forever.
    pub receive_timeout: Option<Duration>,
    /// Incoming frames larger than this are dropped.
    pub max_frame_len: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            receive_timeout: Some(Duration::from_secs(10 * 60)),
            max_frame_len: 1 << 30,
        }
    }
}

impl RpcConfig {
    /// Sets the timeout of receive operations.
    pub fn with_receive_timeout(mut self, receive_timeout: Option<Duration>) -> Self {
        self.receive_timeout = receive_timeout;
        self
    }

    /// Sets the maximum accepted frame length.
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }
}

/// A snapshot of the traffic sent by an [`Rpc`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficStats {
    /// Number of packets sent.
    pub sent_packets: u64,
    /// Sum of the payload lengths of all sent packets.
    pub sent_payload_bytes: u64,
    /// Sum of the sizes (header and payload) of all sent packets.
    pub sent_total_bytes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    packets: AtomicU64,
    payload_bytes: AtomicU64,
    total_bytes: AtomicU64,
}

impl Counters {
    fn record(&self, packet: &Packet) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.payload_bytes
            .fetch_add(packet.payload_len() as u64, Ordering::Relaxed);
        self.total_bytes
            .fetch_add(packet.size() as u64, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.packets.store(0, Ordering::Relaxed);
        self.payload_bytes.store(0, Ordering::Relaxed);
        self.total_bytes.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TrafficStats {
        TrafficStats {
            sent_packets: self.packets.load(Ordering::Relaxed),
            sent_payload_bytes: self.payload_bytes.load(Ordering::Relaxed),
            sent_total_bytes: self.total_bytes.load(Ordering::Relaxed),
        }
    }
}

struct Link<W> {
    writer: Mutex<W>,
    reader: JoinHandle<()>,
}

impl<W> Drop for Link<W> {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// The endpoint a party uses to exchange packets with all other parties.
///
/// An `Rpc` is shared between concurrently running protocol instances, usually
/// behind an [`Arc`]. All methods take `&self`.
pub struct Rpc<T: Transport> {
    own: PartyId,
    parties: Vec<PartyId>,
    transport: T,
    config: RpcConfig,
    mailbox: Arc<Mailbox>,
    links: RwLock<HashMap<PartyId, Arc<Link<T::Writer>>>>,
    lifecycle: Mutex<()>,
    connected: AtomicBool,
    counters: Counters,
    barrier_round: AtomicU64,
}

impl Rpc<MemoryTransport> {
    /// Creates unconnected endpoints for parties running in this process.
    ///
    /// The endpoint of `parties[i]` is returned at index `i`.
    pub fn simulated(parties: &[PartyId], config: RpcConfig) -> Vec<Self> {
        MemoryTransport::network(parties)
            .into_iter()
            .zip(parties)
            .map(|(transport, own)| Rpc::new(*own, parties.to_vec(), transport, config.clone()))
            .collect()
    }
}

impl<T: Transport> Rpc<T> {
    /// Creates an unconnected endpoint for party `own`.
    ///
    /// # Panics
    /// - If `own` is not one of `parties` or `parties` contains duplicates.
    pub fn new(own: PartyId, parties: Vec<PartyId>, transport: T, config: RpcConfig) -> Self {
        assert!(parties.contains(&own), "{own} is not one of the parties");
        let unique: HashSet<_> = parties.iter().collect();
        assert_eq!(unique.len(), parties.len(), "parties must be unique");
        Self {
            own,
            parties,
            transport,
            config,
            mailbox: Arc::new(Mailbox::new()),
            links: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(()),
            connected: AtomicBool::new(false),
            counters: Counters::default(),
            barrier_round: AtomicU64::new(0),
        }
    }

    /// The party this endpoint belongs to.
    pub fn own_party(&self) -> PartyId {
        self.own
    }

    /// All parties of the computation, including the own party.
    pub fn parties(&self) -> &[PartyId] {
        &self.parties
    }

    /// All parties except the own party.
    pub fn peers(&self) -> impl Iterator<Item = PartyId> + '_ {
        self.parties.iter().copied().filter(|p| *p != self.own)
    }

    /// The configuration this endpoint was created with.
    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// The mailbox holding packets received but not yet consumed.
    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Whether [`Rpc::connect`] was called more recently than [`Rpc::disconnect`].
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Opens connections to all peers. Does nothing if already connected.
    #[instrument(level = Level::DEBUG, skip_all, fields(party = %self.own), err)]
    pub async fn connect(&self) -> Result<(), Error> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        self.mailbox.reopen_all();
        let mut links = HashMap::new();
        for peer in self.peers() {
            let (writer, reader) = self
                .transport
                .open_connection(peer)
                .await
                .map_err(|e| Error::transport(format!("connecting to {peer}"), e))?;
            let reader = tokio::spawn(read_frames(
                self.own,
                peer,
                reader,
                self.mailbox.clone(),
                self.config.max_frame_len,
            ));
            links.insert(
                peer,
                Arc::new(Link {
                    writer: Mutex::new(writer),
                    reader,
                }),
            );
        }
        *self.links.write().unwrap_or_else(PoisonError::into_inner) = links;
        self.connected.store(true, Ordering::Release);
        info!(party = %self.own, peers = self.parties.len() - 1, "connected");
        Ok(())
    }

    /// Closes all connections. Does nothing if not connected.
    ///
    /// Pending receives fail with [`crate::mailbox::MailboxError::Closed`],
    /// packets already in the mailbox are kept.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.is_connected() {
            return;
        }
        self.connected.store(false, Ordering::Release);
        self.links
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.mailbox.close_all();
        info!(party = %self.own, "disconnected");
    }

    fn assert_connected(&self) {
        assert!(
            self.is_connected(),
            "{} used its channel before connect()",
            self.own
        );
    }

    fn link(&self, party: PartyId) -> Arc<Link<T::Writer>> {
        self.assert_connected();
        self.links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&party)
            .cloned()
            .unwrap_or_else(|| panic!("No connection from {} to {party}", self.own))
    }

    /// Sends a packet to the receiver named in its header.
    ///
    /// # Panics
    /// - If the channel is not connected.
    /// - If the packet's sender is not the own party.
    pub async fn send(&self, packet: Packet) -> Result<(), Error> {
        assert_eq!(
            packet.header().sender(),
            self.own,
            "packets must be sent by the own party"
        );
        self.write(&packet).await?;
        self.counters.record(&packet);
        Ok(())
    }

    async fn write(&self, packet: &Packet) -> Result<(), Error> {
        let link = self.link(packet.header().receiver());
        let frame = codec::encode(packet)?;
        debug!(header = %packet.header(), bytes = frame.len(), "sending packet");
        link.writer
            .lock()
            .await
            .write_frame(frame)
            .await
            .map_err(|e| Error::transport(format!("sending {}", packet.header()), e))
    }

    /// Waits for the packet with exactly this header, bounded by the
    /// configured receive timeout.
    ///
    /// # Panics
    /// - If the channel is not connected.
    /// - If the header is not addressed to the own party.
    pub async fn receive(&self, header: &Header) -> Result<Packet, Error> {
        assert_eq!(
            header.receiver(),
            self.own,
            "can only receive packets addressed to the own party"
        );
        self.take(Selector::Exact(*header)).await
    }

    /// Waits for the next packet of `sender`, regardless of its header.
    pub async fn receive_from(&self, sender: PartyId) -> Result<Packet, Error> {
        self.take(Selector::Any(sender)).await
    }

    /// Waits for a packet until `cancel` is cancelled, ignoring the configured timeout.
    pub async fn receive_until(
        &self,
        selector: Selector,
        cancel: &CancellationToken,
    ) -> Result<Packet, Error> {
        self.assert_connected();
        Ok(self.mailbox.take_until(selector, cancel).await?)
    }

    async fn take(&self, selector: Selector) -> Result<Packet, Error> {
        self.assert_connected();
        let packet = match self.config.receive_timeout {
            Some(timeout) => self.mailbox.take_timeout(selector, timeout).await?,
            None => self.mailbox.wait(selector).await?,
        };
        Ok(packet)
    }

    /// Waits until every peer has called `synchronize` as often as this party.
    ///
    /// The barrier markers are not counted in the [`TrafficStats`].
    #[instrument(level = Level::DEBUG, skip_all, fields(party = %self.own), err)]
    pub async fn synchronize(&self) -> Result<(), Error> {
        let round = self.barrier_round.fetch_add(1, Ordering::Relaxed);
        let marker = |sender, receiver| {
            Header::new(
                SessionId::root(0),
                &SYNC_PROTOCOL,
                0,
                round,
                sender,
                receiver,
            )
        };
        try_join_all(
            self.peers()
                .map(|peer| async move { self.write(&Packet::empty(marker(self.own, peer))).await }),
        )
        .await?;
        try_join_all(
            self.peers()
                .map(|peer| self.take(Selector::Exact(marker(peer, self.own)))),
        )
        .await?;
        debug!(round, "synchronized");
        Ok(())
    }

    /// The traffic sent since creation or the last [`Rpc::reset`].
    pub fn stats(&self) -> TrafficStats {
        self.counters.snapshot()
    }

    /// Zeroes the traffic counters.
    pub fn reset(&self) {
        self.counters.reset();
    }
}

async fn read_frames<R: FrameReader>(
    own: PartyId,
    peer: PartyId,
    mut reader: R,
    mailbox: Arc<Mailbox>,
    max_frame_len: usize,
) {
    loop {
        let frame = match reader.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!(party = %own, %peer, "connection closed by peer");
                break;
            }
            Err(err) => {
                error!(party = %own, %peer, ?err, "reading from connection failed");
                break;
            }
        };
        if frame.len() > max_frame_len {
            warn!(party = %own, %peer, len = frame.len(), "dropping oversized frame");
            continue;
        }
        match codec::decode(&frame) {
            Ok(packet) if packet.header().sender() != peer || packet.header().receiver() != own => {
                warn!(party = %own, %peer, header = %packet.header(), "dropping misaddressed packet");
            }
            Ok(packet) => mailbox.put(packet),
            Err(err) => warn!(party = %own, %peer, %err, "dropping undecodable frame"),
        }
    }
    mailbox.close(peer);
}
