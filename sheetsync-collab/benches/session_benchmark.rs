use criterion::{criterion_group, criterion_main, Criterion};
use sheetsync_collab::broadcast::{BroadcastGroup, ConnectionId};
use sheetsync_collab::cells::CellStore;
use sheetsync_collab::protocol::{FrameLimits, FrameReader, Request, Response};
use sheetsync_collab::session::Session;
use sheetsync_collab::storage::{decode_spreadsheet, encode_spreadsheet, Document, MemoryStore};
use std::hint::black_box;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

fn sheet(cells: usize) -> CellStore {
    (0..cells)
        .map(|i| (format!("A{i}"), format!("=B{i}*{i}")))
        .collect()
}

fn bench_change_fanout_10_peers(c: &mut Criterion) {
    let document = Document {
        name: "bench".into(),
        password: String::new(),
        path: PathBuf::from("bench.xml"),
    };
    let mut session = Session::new(document, CellStore::new(), Arc::new(MemoryStore::new()));

    let mut receivers = Vec::new();
    let origin = ConnectionId::new();
    for _ in 0..10 {
        let (tx, rx) = mpsc::unbounded_channel();
        session.join(ConnectionId::new(), tx).unwrap();
        receivers.push(rx);
    }
    let (tx, mut origin_rx) = mpsc::unbounded_channel();
    session.join(origin, tx).unwrap();

    c.bench_function("change_fanout_10_peers", |b| {
        b.iter(|| {
            let version = session.version();
            black_box(session.apply_change(&origin, version, "A1".into(), "=SUM(B1:B9)".into()));
            for rx in &mut receivers {
                while rx.try_recv().is_ok() {}
            }
            while origin_rx.try_recv().is_ok() {}
        })
    });
}

fn bench_broadcast_1k_msgs_100_peers(c: &mut Criterion) {
    c.bench_function("broadcast_1k_msgs_100_peers", |b| {
        b.iter(|| {
            let mut group = BroadcastGroup::new();
            let mut receivers = Vec::with_capacity(100);
            for _ in 0..100 {
                let (tx, rx) = mpsc::unbounded_channel();
                group.add_peer(ConnectionId::new(), tx);
                receivers.push(rx);
            }
            let origin = ConnectionId::new();
            let frame = Response::Update {
                name: "bench".into(),
                version: 1,
                cell: "A1".into(),
                content: "42".into(),
            }
            .frame();
            for _ in 0..1000 {
                black_box(group.broadcast_except(&origin, &frame));
            }
        })
    });
}

fn bench_request_parse(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let mut wire = Vec::new();
    for version in 0..100 {
        wire.extend(
            Request::Change {
                name: "bench".into(),
                version,
                cell: format!("C{version}"),
                content: "=A1+B1\nwith a second line".into(),
            }
            .encode(),
        );
    }

    c.bench_function("parse_100_change_frames", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let mut frames = FrameReader::new(black_box(wire.as_slice()), FrameLimits::default());
                while let Some(request) = frames.next_request().await.unwrap() {
                    black_box(request);
                }
            })
        })
    });
}

fn bench_xml_1k_cells(c: &mut Criterion) {
    let cells = sheet(1000);
    let xml = encode_spreadsheet(&cells).unwrap();

    c.bench_function("xml_encode_1k_cells", |b| {
        b.iter(|| black_box(encode_spreadsheet(black_box(&cells)).unwrap()))
    });
    c.bench_function("xml_decode_1k_cells", |b| {
        b.iter(|| black_box(decode_spreadsheet(black_box(&xml)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_change_fanout_10_peers,
    bench_broadcast_1k_msgs_100_peers,
    bench_request_parse,
    bench_xml_1k_cells,
);
criterion_main!(benches);
