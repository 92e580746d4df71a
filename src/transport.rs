//! The byte transport between parties.
//!
//! The bus only needs ordered, reliable delivery of whole frames between each
//! pair of parties. How these frames travel (TCP, TLS, HTTP, QUIC, ...) is up
//! to the [`Transport`] implementation. [`MemoryTransport`] connects parties
//! running in the same process and is used for simulations and tests.
use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use thiserror::Error;
use tokio::sync::{
    Mutex,
    mpsc::{Receiver, Sender, channel},
};

use crate::header::PartyId;

/// Opens connections to other parties.
pub trait Transport: Send + Sync + 'static {
    /// The error that can occur opening connections or exchanging frames.
    type Error: fmt::Debug + Send + Sync + 'static;
    /// The sending half of a connection.
    type Writer: FrameWriter<Error = Self::Error>;
    /// The receiving half of a connection.
    type Reader: FrameReader<Error = Self::Error>;

    /// Opens a connection to `party`, returning its sending and receiving half.
    fn open_connection(
        &self,
        party: PartyId,
    ) -> impl Future<Output = Result<(Self::Writer, Self::Reader), Self::Error>> + Send;
}

/// Writes frames to one other party.
pub trait FrameWriter: Send + 'static {
    /// The error that can occur writing a frame.
    type Error: fmt::Debug + Send + Sync + 'static;

    /// Writes a frame, frames must arrive in the order they were written.
    fn write_frame(&mut self, frame: Vec<u8>)
    -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Reads frames from one other party.
pub trait FrameReader: Send + 'static {
    /// The error that can occur reading a frame.
    type Error: fmt::Debug + Send + Sync + 'static;

    /// Reads the next frame, `None` once the connection has been closed.
    fn read_frame(&mut self) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>> + Send;
}

/// Errors of the [`MemoryTransport`].
#[derive(Debug, Error)]
pub enum MemoryError {
    /// There is no connection to the party in this network.
    #[error("party {0} is not part of the network")]
    UnknownParty(PartyId),
    /// The other side of the connection has been dropped.
    #[error("connection to {0} is closed")]
    Closed(PartyId),
}

/// An in-process transport based on [`tokio::sync::mpsc`] channels.
///
/// Connections can be opened repeatedly; frames that were not yet read by a
/// previous connection are delivered to the next one.
#[derive(Debug)]
pub struct MemoryTransport {
    links: HashMap<PartyId, MemoryLink>,
}

#[derive(Debug)]
struct MemoryLink {
    to: Sender<Vec<u8>>,
    from: Arc<Mutex<Receiver<Vec<u8>>>>,
}

impl MemoryTransport {
    /// Creates transports for the given parties to communicate with each other.
    ///
    /// The transport of `parties[i]` is returned at index `i`.
    pub fn network(parties: &[PartyId]) -> Vec<Self> {
        let buffer_capacity = 1024;
        let mut transports: Vec<_> = parties
            .iter()
            .map(|_| MemoryTransport {
                links: HashMap::new(),
            })
            .collect();
        for (a, &party_a) in parties.iter().enumerate() {
            for (b, &party_b) in parties.iter().enumerate().skip(a + 1) {
                let (send_a_to_b, recv_a_to_b) = channel(buffer_capacity);
                let (send_b_to_a, recv_b_to_a) = channel(buffer_capacity);
                transports[a].links.insert(
                    party_b,
                    MemoryLink {
                        to: send_a_to_b,
                        from: Arc::new(Mutex::new(recv_b_to_a)),
                    },
                );
                transports[b].links.insert(
                    party_a,
                    MemoryLink {
                        to: send_b_to_a,
                        from: Arc::new(Mutex::new(recv_a_to_b)),
                    },
                );
            }
        }
        transports
    }
}

/// Sending half of a [`MemoryTransport`] connection.
#[derive(Debug)]
pub struct MemoryWriter {
    party: PartyId,
    to: Sender<Vec<u8>>,
}

/// Receiving half of a [`MemoryTransport`] connection.
#[derive(Debug)]
pub struct MemoryReader {
    from: Arc<Mutex<Receiver<Vec<u8>>>>,
}

impl Transport for MemoryTransport {
    type Error = MemoryError;
    type Writer = MemoryWriter;
    type Reader = MemoryReader;

    async fn open_connection(
        &self,
        party: PartyId,
    ) -> Result<(MemoryWriter, MemoryReader), MemoryError> {
        let link = self
            .links
            .get(&party)
            .ok_or(MemoryError::UnknownParty(party))?;
        Ok((
            MemoryWriter {
                party,
                to: link.to.clone(),
            },
            MemoryReader {
                from: link.from.clone(),
            },
        ))
    }
}

impl FrameWriter for MemoryWriter {
    type Error = MemoryError;

    async fn write_frame(&mut self, frame: Vec<u8>) -> Result<(), MemoryError> {
        self.to
            .send(frame)
            .await
            .map_err(|_| MemoryError::Closed(self.party))
    }
}

impl FrameReader for MemoryReader {
    type Error = MemoryError;

    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, MemoryError> {
        Ok(self.from.lock().await.recv().await)
    }
}
