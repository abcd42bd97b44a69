mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{FakeBio, Pair, RecordingNotify, TestItem, TestSerialiser};
use peernet::streamer::ItemClass;
use peernet::{BinTcp, NullNotify, Streamer, TcpConfig};

fn exact_read_cfg() -> TcpConfig {
    TcpConfig {
        no_partial_read: true,
        ..TcpConfig::default()
    }
}

#[test]
fn items_cross_a_real_stream() {
    common::init_logging();
    let pair = Pair::with_config(exact_read_cfg(), exact_read_cfg());
    pair.connect();

    let heard = Arc::new(AtomicUsize::new(0));
    let heard_cb = heard.clone();

    let sender = Streamer::new(
        TestSerialiser::default(),
        Box::new(BinTcp::new(pair.a.clone())),
        "peer-b",
        pair.clock.clone(),
        Arc::new(NullNotify),
    );
    let mut receiver = Streamer::new(
        TestSerialiser::default(),
        Box::new(BinTcp::new(pair.b.clone())),
        "peer-a",
        pair.clock.clone(),
        Arc::new(NullNotify),
    );
    receiver.set_heard_from(Box::new(move |_| {
        heard_cb.fetch_add(1, Ordering::SeqCst);
    }));

    // no throttling in this test
    sender.set_max_rate(false, 0.0);
    sender.set_max_rate(true, 0.0);
    receiver.set_max_rate(false, 0.0);
    receiver.set_max_rate(true, 0.0);

    // a file chunk queued before a control message still arrives after it
    sender.send_item(TestItem::file_data(&vec![0xAB; 2000]));
    sender.send_item(TestItem::control(b"status ping"));

    let mut got = Vec::new();
    for _ in 0..50 {
        sender.tick();
        receiver.tick();
        pair.pump();
        while let Some(item) = receiver.get_item() {
            got.push(item);
        }
        if got.len() == 2 {
            break;
        }
        pair.clock.advance(0.001);
    }

    assert_eq!(got.len(), 2, "both items must arrive");
    assert_eq!(got[0].class, ItemClass::Control);
    assert_eq!(got[0].payload, b"status ping");
    assert_eq!(got[1].class, ItemClass::FileData);
    assert_eq!(got[1].payload, vec![0xAB; 2000]);

    // the receiving streamer tags every item with its peer
    assert!(got.iter().all(|item| item.peer == "peer-a"));
    assert_eq!(heard.load(Ordering::SeqCst), 2);
}

#[test]
fn serialise_roundtrip_is_identity() {
    use peernet::streamer::Serialiser;

    let serialiser = TestSerialiser::default();
    for item in [
        TestItem::control(b""),
        TestItem::control(b"short"),
        TestItem::file_data(&vec![0x5A; 4096]),
    ] {
        let mut buf = vec![0u8; serialiser.size(&item)];
        let len = serialiser.serialise(&item, &mut buf).unwrap();
        let back = serialiser.deserialise(&buf[..len]).unwrap();
        assert_eq!(back.class, item.class);
        assert_eq!(back.payload, item.payload);
    }
}

#[test]
fn pending_packet_retries_the_same_bytes() {
    common::init_logging();
    let bio = FakeBio::active();
    bio.set_block_writes(true);

    let streamer = Streamer::new(
        TestSerialiser::default(),
        Box::new(bio.clone()),
        "peer",
        Arc::new(peernet::ManualClock::new()),
        Arc::new(RecordingNotify::default()),
    );
    streamer.set_max_rate(false, 0.0);

    streamer.send_item(TestItem::control(b"must not shift"));
    let queued = streamer.queued_bytes();
    assert!(queued > 0);

    // blocked: the packet stays pending, byte for byte
    streamer.tick();
    assert_eq!(bio.tx_len(), 0);
    assert_eq!(streamer.queued_bytes(), queued);

    streamer.tick();
    assert_eq!(bio.tx_len(), 0);

    // unblocked: exactly one copy goes out
    bio.set_block_writes(false);
    streamer.tick();
    let tx = bio.take_tx();
    assert_eq!(tx.len(), queued);
    assert_eq!(streamer.queued_bytes(), 0);

    use peernet::streamer::PKT_BASE_SIZE;
    assert_eq!(&tx[PKT_BASE_SIZE..], b"must not shift");
}

#[test]
fn inactive_interface_short_circuits_the_tick() {
    common::init_logging();
    let bio = FakeBio::active();
    let streamer = Streamer::new(
        TestSerialiser::default(),
        Box::new(bio.clone()),
        "peer",
        Arc::new(peernet::ManualClock::new()),
        Arc::new(RecordingNotify::default()),
    );
    streamer.set_max_rate(false, 0.0);
    streamer.send_item(TestItem::control(b"waiting for a link"));

    bio.0.lock().unwrap().active = false;
    assert!(!streamer.tick());
    assert_eq!(bio.tx_len(), 0);
}
