//! Byte-level framing of packets.
//!
//! Every packet is written as one frame, all integers big-endian:
//!
//! ```text
//! Message := Header Payload
//! Header  := sessionId:int64, protocolId:int32, stepId:int32,
//!            sequence:int64, senderId:int32, receiverId:int32
//! Payload := blockCount:int32, { blockLength:int32, blockBytes:[blockLength] } * blockCount
//! ```
//!
//! Counts and lengths are non-negative 32-bit signed integers.
use thiserror::Error;

use crate::{
    header::{Header, PartyId},
    namespace::SessionId,
    packet::{HEADER_SIZE, Packet},
    registry,
};

const LEN_SIZE: usize = 4;
const MAX_LEN: usize = i32::MAX as usize;

/// Errors raised while encoding or decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The frame ended before the announced data.
    #[error("frame truncated: needed {needed} more bytes, {remaining} left")]
    Truncated {
        /// Bytes required by the next field.
        needed: usize,
        /// Bytes left in the frame.
        remaining: usize,
    },
    /// The frame contained bytes after the last payload block.
    #[error("{0} trailing bytes after the last payload block")]
    TrailingBytes(usize),
    /// A block count or block length was negative.
    #[error("negative length field {0}")]
    NegativeLength(i32),
    /// A block or the number of blocks does not fit into a length field.
    #[error("length {0} does not fit into a frame")]
    TooLarge(usize),
    /// The header refers to a protocol that is not registered.
    #[error("unknown protocol id {0}")]
    UnknownProtocol(u32),
    /// The header addresses its own sender.
    #[error("header addresses its own sender {0}")]
    SelfAddressed(PartyId),
    /// The step id is not a step of the protocol.
    #[error("step {step} is out of range for protocol {protocol_id}")]
    UnknownStep {
        /// The protocol of the header.
        protocol_id: u32,
        /// The rejected step id.
        step: u32,
    },
}

/// Number of bytes [`encode`] produces for `packet`.
pub fn encoded_len(packet: &Packet) -> usize {
    HEADER_SIZE + LEN_SIZE + packet.block_count() * LEN_SIZE + packet.payload_len()
}

/// Serializes a packet into a single frame.
pub fn encode(packet: &Packet) -> Result<Vec<u8>, CodecError> {
    let header = packet.header();
    let mut frame = Vec::with_capacity(encoded_len(packet));
    frame.extend(header.session_id().as_u64().to_be_bytes());
    frame.extend(header.protocol_id().to_be_bytes());
    frame.extend(header.step_id().to_be_bytes());
    frame.extend(header.sequence().to_be_bytes());
    frame.extend(header.sender().0.to_be_bytes());
    frame.extend(header.receiver().0.to_be_bytes());
    frame.extend(length_field(packet.block_count())?);
    for block in packet.payload() {
        frame.extend(length_field(block.len())?);
        frame.extend(block);
    }
    Ok(frame)
}

fn length_field(len: usize) -> Result<[u8; LEN_SIZE], CodecError> {
    if len > MAX_LEN {
        return Err(CodecError::TooLarge(len));
    }
    Ok((len as i32).to_be_bytes())
}

/// Parses a frame produced by [`encode`].
///
/// Frames come from other parties, so every field is validated: the protocol
/// id must be registered, the step must belong to it and the header must not
/// be addressed to its own sender.
pub fn decode(frame: &[u8]) -> Result<Packet, CodecError> {
    let mut r = Cursor { rest: frame };
    let session_id = SessionId::from_raw(u64::from_be_bytes(r.array()?));
    let protocol_id = u32::from_be_bytes(r.array()?);
    let step_id = u32::from_be_bytes(r.array()?);
    let sequence = u64::from_be_bytes(r.array()?);
    let sender = PartyId(u32::from_be_bytes(r.array()?));
    let receiver = PartyId(u32::from_be_bytes(r.array()?));

    let protocol = registry::lookup(protocol_id).ok_or(CodecError::UnknownProtocol(protocol_id))?;
    if step_id >= protocol.step_count() {
        return Err(CodecError::UnknownStep {
            protocol_id,
            step: step_id,
        });
    }
    if sender == receiver {
        return Err(CodecError::SelfAddressed(sender));
    }
    let header = Header::from_parts(session_id, protocol_id, step_id, sequence, sender, receiver);

    let block_count = r.len()?;
    // the count is untrusted, never reserve more than the frame could hold
    let mut payload = Vec::with_capacity(block_count.min(r.rest.len() / LEN_SIZE));
    for _ in 0..block_count {
        let len = r.len()?;
        payload.push(r.bytes(len)?.to_vec());
    }
    if !r.rest.is_empty() {
        return Err(CodecError::TrailingBytes(r.rest.len()));
    }
    Ok(Packet::new(header, payload))
}

struct Cursor<'a> {
    rest: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.rest.len() < n {
            return Err(CodecError::Truncated {
                needed: n,
                remaining: self.rest.len(),
            });
        }
        let (head, rest) = self.rest.split_at(n);
        self.rest = rest;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut array = [0; N];
        array.copy_from_slice(self.bytes(N)?);
        Ok(array)
    }

    fn len(&mut self) -> Result<usize, CodecError> {
        let len = i32::from_be_bytes(self.array()?);
        usize::try_from(len).map_err(|_| CodecError::NegativeLength(len))
    }
}
