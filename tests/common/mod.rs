// The module is built separately for each integration test, so if some items
// are only used in one test but not the other, this will result in warnings
#![allow(dead_code)]

use std::{
    env,
    sync::{Arc, LazyLock, Mutex, MutexGuard},
};

use mpc_bus::{
    header::{Header, PartyId},
    namespace::SessionId,
    packet::Packet,
    registry::ProtocolDescription,
    rpc::{Rpc, RpcConfig},
    transport::MemoryTransport,
};
use rand::{SeedableRng, rngs::StdRng};
use tracing::{info, subscriber::DefaultGuard};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

static TEST_RNG: LazyLock<Mutex<StdRng>> = LazyLock::new(|| {
    let seed: u64 = if let Ok(var) = env::var("MPC_BUS_TEST_SEED") {
        var.parse().expect("MPC_BUS_TEST_SEED is invalid u64")
    } else {
        rand::random()
    };
    info!(seed, "testing seed");
    Mutex::new(StdRng::seed_from_u64(seed))
});

pub(crate) fn test_rng() -> MutexGuard<'static, StdRng> {
    TEST_RNG.lock().expect("TEST_RNG poisoned")
}

pub(crate) fn init_tracing() -> DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .set_default()
}

/// A protocol with `steps` steps, registered under an id unique to the test.
pub(crate) fn protocol(id: u32, name: &'static str, steps: u32) -> ProtocolDescription {
    ProtocolDescription::register(id, name, steps).expect("test protocol ids are unique")
}

/// Connected in-memory endpoints, the endpoint of `PartyId(i)` at index `i`.
pub(crate) async fn connected(parties: u32, config: RpcConfig) -> Vec<Arc<Rpc<MemoryTransport>>> {
    let parties: Vec<_> = (0..parties).map(PartyId).collect();
    let rpcs: Vec<_> = Rpc::simulated(&parties, config)
        .into_iter()
        .map(Arc::new)
        .collect();
    for rpc in &rpcs {
        rpc.connect().await.expect("connect");
    }
    rpcs
}

/// A packet carrying `value` as its only block.
pub(crate) fn value_packet(
    protocol: &ProtocolDescription,
    session: SessionId,
    sequence: u64,
    sender: PartyId,
    receiver: PartyId,
    value: u32,
) -> Packet {
    let header = Header::new(session, protocol, 0, sequence, sender, receiver);
    Packet::new(header, vec![value.to_be_bytes().to_vec()])
}

pub(crate) fn decode_value(packet: &Packet) -> u32 {
    let block: [u8; 4] = packet.payload()[0]
        .as_slice()
        .try_into()
        .expect("4 byte block");
    u32::from_be_bytes(block)
}
