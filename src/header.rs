//! Routing keys of messages exchanged between parties.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{namespace::SessionId, registry::ProtocolDescription};

/// Identifies a party participating in a computation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartyId(pub u32);

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// The routing key of one logical message.
///
/// Two headers are equal iff all six fields are equal. Protocol code must not
/// emit two different logical messages under equal headers within one session,
/// the [`crate::mailbox::Mailbox`] serves such duplicates in FIFO order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Header {
    session_id: SessionId,
    protocol_id: u32,
    step_id: u32,
    sequence: u64,
    sender: PartyId,
    receiver: PartyId,
}

impl Header {
    /// Creates a header for a step of a registered protocol.
    ///
    /// # Panics
    /// - If `sender == receiver`.
    /// - If `step_id` is not a step of `protocol`.
    pub fn new(
        session_id: SessionId,
        protocol: &ProtocolDescription,
        step_id: u32,
        sequence: u64,
        sender: PartyId,
        receiver: PartyId,
    ) -> Self {
        assert_ne!(sender, receiver, "a header must not address its own sender");
        assert!(
            step_id < protocol.step_count(),
            "step {step_id} is not a step of {} ({} steps)",
            protocol.name(),
            protocol.step_count()
        );
        Self::from_parts(
            session_id,
            protocol.id(),
            step_id,
            sequence,
            sender,
            receiver,
        )
    }

    /// Assembles a header without validation, callers check the fields.
    pub(crate) fn from_parts(
        session_id: SessionId,
        protocol_id: u32,
        step_id: u32,
        sequence: u64,
        sender: PartyId,
        receiver: PartyId,
    ) -> Self {
        Self {
            session_id,
            protocol_id,
            step_id,
            sequence,
            sender,
            receiver,
        }
    }

    /// The session (protocol instance) the message belongs to.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// The id of the registered protocol description.
    pub fn protocol_id(&self) -> u32 {
        self.protocol_id
    }

    /// The step of the protocol this message belongs to.
    pub fn step_id(&self) -> u32 {
        self.step_id
    }

    /// Disambiguates repeated rounds of the same step.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// The party that sends the message.
    pub fn sender(&self) -> PartyId {
        self.sender
    }

    /// The party the message is addressed to.
    pub fn receiver(&self) -> PartyId {
        self.receiver
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} pto {} step {} seq {}: {} -> {}]",
            self.session_id,
            self.protocol_id,
            self.step_id,
            self.sequence,
            self.sender,
            self.receiver
        )
    }
}
