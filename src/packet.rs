//! Immutable message envelopes.
use crate::header::Header;

/// Bytes every packet contributes to the traffic statistics for its header.
pub const HEADER_SIZE: usize = 8 + 4 + 4 + 8 + 4 + 4;

/// A [`Header`] together with an ordered list of opaque payload blocks.
///
/// A packet without blocks is an explicit empty message, which is different
/// from not receiving a packet at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    header: Header,
    payload: Vec<Vec<u8>>,
}

impl Packet {
    /// Creates a packet carrying the given payload blocks.
    pub fn new(header: Header, payload: Vec<Vec<u8>>) -> Self {
        Self { header, payload }
    }

    /// Creates a packet without payload blocks.
    pub fn empty(header: Header) -> Self {
        Self::new(header, vec![])
    }

    /// The routing key of the packet.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// The payload blocks in order.
    pub fn payload(&self) -> &[Vec<u8>] {
        &self.payload
    }

    /// Consumes the packet, returning its payload blocks.
    pub fn into_payload(self) -> Vec<Vec<u8>> {
        self.payload
    }

    /// Number of payload blocks.
    pub fn block_count(&self) -> usize {
        self.payload.len()
    }

    /// Sum of the lengths of all payload blocks.
    pub fn payload_len(&self) -> usize {
        self.payload.iter().map(Vec::len).sum()
    }

    /// The size accounted for this packet: [`HEADER_SIZE`] plus the payload length.
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload_len()
    }
}
