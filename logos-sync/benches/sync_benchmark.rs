use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use logos_sync::broadcast::BroadcastGroup;
use logos_sync::codec::{decode_payload, encode_payload, BroadcastMessage, Frame};
use logos_sync::{OriginTag, Presence, SharedDocument};
use uuid::Uuid;

/// A document with `edits` appended chunks.
fn edited_document(edits: usize) -> SharedDocument {
    let doc = SharedDocument::with_replica_id(1);
    for i in 0..edits {
        doc.push_text("content", &format!("line {i} of a reasonably long paragraph\n"));
    }
    doc
}

fn bench_full_state_encode(c: &mut Criterion) {
    let doc = edited_document(1000);

    c.bench_function("full_state_encode_1000_edits", |b| {
        b.iter(|| black_box(doc.encode_full_state()))
    });
}

fn bench_full_state_merge(c: &mut Criterion) {
    let state = edited_document(1000).encode_full_state();
    let origin = OriginTag::new("bench");

    c.bench_function("full_state_merge_1000_edits", |b| {
        b.iter(|| {
            let doc = SharedDocument::with_replica_id(2);
            doc.apply_encoded_update(black_box(&state), &origin).unwrap();
            black_box(doc);
        })
    });
}

fn bench_payload_codec(c: &mut Criterion) {
    let state = edited_document(1000).encode_full_state();
    let encoded = encode_payload(&state);

    c.bench_function("payload_encode", |b| {
        b.iter(|| black_box(encode_payload(black_box(&state))))
    });
    c.bench_function("payload_decode", |b| {
        b.iter(|| black_box(decode_payload(black_box(&encoded)).unwrap()))
    });
}

fn bench_frame_codec(c: &mut Criterion) {
    let frame = Frame::Broadcast {
        from: Uuid::new_v4(),
        message: BroadcastMessage::update(&[0u8; 64]),
    };
    let encoded = frame.encode().unwrap();

    c.bench_function("frame_encode_64B", |b| {
        b.iter(|| black_box(black_box(&frame).encode().unwrap()))
    });
    c.bench_function("frame_decode_64B", |b| {
        b.iter(|| black_box(Frame::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_presence_delta(c: &mut Criterion) {
    let presence = Presence::new(1);
    presence.set_local_field("name", "bench".into());
    presence.set_local_field("cursor", serde_json::json!({ "anchor": 10, "head": 24 }));
    let delta = presence.encode_delta(&[1]).unwrap();
    let origin = OriginTag::new("bench");
    let ids: [u64; 1] = [1];

    c.bench_function("presence_encode_delta", |b| {
        b.iter(|| black_box(presence.encode_delta(black_box(&ids[..])).unwrap()))
    });
    c.bench_function("presence_apply_delta", |b| {
        b.iter(|| {
            let remote = Presence::new(2);
            black_box(remote.apply_delta(black_box(&delta), &origin).unwrap());
        })
    });
}

fn bench_room_fanout(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("room_fanout_100_members", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(1024);
                let mut receivers = Vec::new();
                for _ in 0..100 {
                    receivers.push(group.join(Uuid::new_v4()).await);
                }
                let reached = group.send(black_box(Arc::new(vec![0u8; 64])));
                black_box(reached);
            });
        })
    });
}

criterion_group!(
    benches,
    bench_full_state_encode,
    bench_full_state_merge,
    bench_payload_codec,
    bench_frame_codec,
    bench_presence_delta,
    bench_room_fanout,
);
criterion_main!(benches);
