//! Process-wide registry of protocol descriptions.
//!
//! Every protocol that exchanges messages through the bus registers a
//! [`ProtocolDescription`] under a stable numeric id. Registering a different
//! description under an id that is already taken fails, which catches two
//! independently written protocols that accidentally picked the same id before
//! either of them can put a message on the wire.
use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{LazyLock, Mutex, PoisonError},
};

use thiserror::Error;

/// Protocol id reserved for the barrier markers sent by [`crate::rpc::Rpc::synchronize`].
pub const SYNC_PROTOCOL_ID: u32 = 0;

pub(crate) static SYNC_PROTOCOL: ProtocolDescription = ProtocolDescription {
    id: SYNC_PROTOCOL_ID,
    name: "rpc.synchronize",
    step_count: 1,
};

static REGISTRY: LazyLock<Mutex<HashMap<u32, ProtocolDescription>>> = LazyLock::new(|| {
    Mutex::new(HashMap::from([(SYNC_PROTOCOL.id, SYNC_PROTOCOL)]))
});

/// Errors raised when registering a protocol description.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The id is already registered for a different description.
    #[error("protocol id {id} is already taken by {existing:?}, cannot register {requested:?}")]
    IdTaken {
        /// The contested id.
        id: u32,
        /// The name of the description currently registered under `id`.
        existing: &'static str,
        /// The name of the description that was rejected.
        requested: &'static str,
    },
}

/// The stable identity of a protocol: its id, its name and the number of
/// distinct steps (message shapes) it uses.
///
/// A description can only be obtained through [`ProtocolDescription::register`]
/// or [`lookup`], so every [`crate::header::Header`] built locally refers to a
/// registered protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolDescription {
    id: u32,
    name: &'static str,
    step_count: u32,
}

impl ProtocolDescription {
    /// Registers a protocol description.
    ///
    /// Registering the exact same description twice is allowed and returns the
    /// already registered description.
    pub fn register(
        id: u32,
        name: &'static str,
        step_count: u32,
    ) -> Result<Self, RegistryError> {
        let requested = Self {
            id,
            name,
            step_count,
        };
        let mut registry = REGISTRY.lock().unwrap_or_else(PoisonError::into_inner);
        match registry.entry(id) {
            Entry::Occupied(entry) if *entry.get() == requested => Ok(requested),
            Entry::Occupied(entry) => Err(RegistryError::IdTaken {
                id,
                existing: entry.get().name,
                requested: name,
            }),
            Entry::Vacant(entry) => {
                entry.insert(requested);
                Ok(requested)
            }
        }
    }

    /// The numeric protocol id as written into headers.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The human readable name of the protocol.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The number of steps, valid step ids are `0..step_count`.
    pub fn step_count(&self) -> u32 {
        self.step_count
    }
}

/// Looks up the description registered under `id`.
pub fn lookup(id: u32) -> Option<ProtocolDescription> {
    REGISTRY
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&id)
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let desc = ProtocolDescription::register(0x5e61_0001, "registry.test.lookup", 3).unwrap();
        assert_eq!(lookup(0x5e61_0001), Some(desc));
        assert_eq!(desc.name(), "registry.test.lookup");
        assert_eq!(desc.step_count(), 3);
        assert_eq!(lookup(0x5e61_00ff), None);
    }

    #[test]
    fn identical_registration_is_idempotent() {
        let a = ProtocolDescription::register(0x5e61_0002, "registry.test.twice", 1).unwrap();
        let b = ProtocolDescription::register(0x5e61_0002, "registry.test.twice", 1).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn reserved_sync_id_is_taken() {
        let err = ProtocolDescription::register(SYNC_PROTOCOL_ID, "not.sync", 1).unwrap_err();
        assert_eq!(
            err,
            RegistryError::IdTaken {
                id: SYNC_PROTOCOL_ID,
                existing: "rpc.synchronize",
                requested: "not.sync",
            }
        );
    }

    #[test]
    fn same_name_different_steps_is_a_collision() {
        ProtocolDescription::register(0x5e61_0003, "registry.test.steps", 2).unwrap();
        assert!(ProtocolDescription::register(0x5e61_0003, "registry.test.steps", 4).is_err());
    }
}
