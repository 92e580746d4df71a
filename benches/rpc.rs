use std::{sync::Arc, time::Instant};

use criterion::{BenchmarkId, Criterion, Throughput};
use mpc_bus::{
    header::PartyId,
    namespace::SessionId,
    registry::ProtocolDescription,
    rpc::{Rpc, RpcConfig},
    session::Session,
    transport::MemoryTransport,
};
use tokio::runtime::Runtime;

async fn ping_pong(
    mut session: Session<MemoryTransport>,
    peer: PartyId,
    rounds: u64,
    block_len: usize,
) {
    let block = vec![0u8; block_len];
    for _ in 0..rounds {
        session
            .send(0, peer, vec![block.clone()])
            .await
            .expect("send failed");
        session
            .receive_blocks(0, peer, 1)
            .await
            .expect("receive failed");
    }
}

pub fn rpc_benchmarks(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let pto = ProtocolDescription::register(0xbe7c_0002, "bench.ping-pong", 1)
        .expect("bench protocol id is free");
    let rounds = 100;

    let mut g = c.benchmark_group("rpc");
    for block_len in [32, 64 * 1024] {
        g.throughput(Throughput::Bytes(2 * rounds * block_len as u64));
        g.bench_function(BenchmarkId::new("ping-pong", block_len), |b| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let parties = [PartyId(0), PartyId(1)];
                let [rpc0, rpc1]: [Rpc<MemoryTransport>; 2] =
                    Rpc::simulated(&parties, RpcConfig::default())
                        .try_into()
                        .expect("parties is 2");
                let (rpc0, rpc1) = (Arc::new(rpc0), Arc::new(rpc1));
                rpc0.connect().await.expect("connect failed");
                rpc1.connect().await.expect("connect failed");

                let now = Instant::now();
                for iter in 0..iters {
                    let id = SessionId::root((iter % u64::from(u16::MAX)) as u16);
                    let s0 = Session::new(rpc0.clone(), pto, id);
                    let s1 = Session::new(rpc1.clone(), pto, id);
                    tokio::join!(
                        ping_pong(s0, PartyId(1), rounds, block_len),
                        ping_pong(s1, PartyId(0), rounds, block_len),
                    );
                }
                now.elapsed()
            })
        });
    }
}
