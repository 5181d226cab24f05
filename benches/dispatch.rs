//! Dispatch benchmark suite.
//!
//! Measures call round trips through the dispatcher against an in-memory
//! echo peer:
//! - Sequential calls on the root and on a session
//! - Concurrent calls in flight: 1, 16, 128
//!
//! Run with: cargo bench --bench dispatch
//! Results saved to: target/criterion/

use std::sync::Arc;
use std::time::Duration;

use browser_session::{
    Connection, ConnectionOptions, MemoryPeer, MemoryTransport, Protocol, Session, SessionId,
};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use futures_util::future::join_all;
use serde_json::json;
use tokio::runtime::Runtime;

// ============================================================================
// Benchmark Parameters
// ============================================================================

const IN_FLIGHT: &[usize] = &[1, 16, 128];

// ============================================================================
// Setup
// ============================================================================

/// Opens a connection whose peer answers every request with its params.
fn echo_connection(rt: &Runtime) -> Connection {
    rt.block_on(async {
        let (transport, inbound, peer) = MemoryTransport::pair();
        let connection = Connection::new(
            "memory://bench",
            transport,
            inbound,
            Protocol::Cdp,
            ConnectionOptions::new(),
        )
        .expect("connection");

        let peer = Arc::new(peer);
        tokio::spawn(echo(Arc::clone(&peer)));
        connection
    })
}

async fn echo(peer: Arc<MemoryPeer>) {
    while let Some(request) = peer.recv_json().await {
        let mut response = json!({"id": request["id"], "result": request["params"]});
        if let Some(session) = request.get("sessionId") {
            response["sessionId"] = session.clone();
        }
        peer.deliver_json(&response);
    }
}

fn attached_session(rt: &Runtime, connection: &Connection) -> Session {
    rt.block_on(async {
        connection
            .attach_session(None, SessionId::from("bench"), Default::default())
            .await
            .expect("attach")
    })
}

// ============================================================================
// Benchmark: Sequential Round Trip
// ============================================================================

fn bench_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let connection = echo_connection(&rt);
    let session = attached_session(&rt, &connection);

    let mut group = c.benchmark_group("round_trip");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("root", |b| {
        b.to_async(&rt).iter(|| async {
            connection
                .send_and_wait("Bench.echo", json!({"n": 1}), None)
                .await
                .expect("echo")
        });
    });

    group.bench_function("session", |b| {
        b.to_async(&rt).iter(|| async {
            session
                .send_and_wait("Bench.echo", json!({"n": 1}))
                .await
                .expect("echo")
        });
    });

    group.finish();
}

// ============================================================================
// Benchmark: Concurrent Calls
// ============================================================================

fn bench_in_flight(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let connection = echo_connection(&rt);

    let mut group = c.benchmark_group("in_flight");

    for &count in IN_FLIGHT {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("calls", count), &count, |b, &calls| {
            b.to_async(&rt).iter(|| async {
                let pending = (0..calls).map(|n| {
                    connection.send_and_wait("Bench.echo", json!({ "n": n }), None)
                });
                for outcome in join_all(pending).await {
                    outcome.expect("echo");
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_round_trip, bench_in_flight);
criterion_main!(benches);
