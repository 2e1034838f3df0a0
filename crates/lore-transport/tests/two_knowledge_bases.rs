use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lore_core::{Record, RecordType};
use lore_engine::{EvalSettings, KnowledgeBase, WaitSettings};
use lore_transport::{
    BusAdapter, FilterError, FilterOutput, InMemoryBus, QosConfig, ReceiveOutcome, Transport,
    TransportRunner, TransportSettings,
};

fn peer(
    bus: &InMemoryBus,
    id: &str,
    qos: QosConfig,
) -> (KnowledgeBase, Arc<Transport<BusAdapter>>) {
    let kb = KnowledgeBase::with_id(id);
    let settings = TransportSettings {
        id: id.to_string(),
        poll_interval_secs: 0.002,
        qos,
        ..TransportSettings::default()
    };
    let transport = Transport::new(&kb, settings, bus.join(id)).expect("transport should build");
    (kb, transport)
}

#[test]
fn writes_propagate_between_peers() {
    let bus = InMemoryBus::default();
    let (kb_a, _ta) = peer(&bus, "a", QosConfig::default());
    let (kb_b, tb) = peer(&bus, "b", QosConfig::default());

    kb_a.set("position.x", 12.5).expect("set should succeed");
    kb_a.set(".scratch", 1_i64).expect("local set should succeed");
    assert_eq!(tb.pump(16), Ok(1));

    let x = kb_b.get("position.x").expect("get should succeed");
    assert_eq!(x.to_double(), Ok(12.5));
    assert_eq!(x.clock, 1);
    assert!(!kb_b.exists(".scratch").expect("exists should succeed"));
    assert_eq!(tb.stats().merged_records, 1);
}

#[test]
fn send_filter_doubles_count_before_peer_sees_it() {
    let bus = InMemoryBus::default();
    let (kb_a, ta) = peer(&bus, "a", QosConfig::default());
    let (kb_b, tb) = peer(&bus, "b", QosConfig::default());
    let aggregate_saw = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&aggregate_saw);
    ta.update_qos(|qos| {
        qos.add_send_filter(&[RecordType::Integer], |args, _| {
            Ok(FilterOutput::replace(args.record.to_integer()? * 2))
        });
        qos.add_send_aggregate_filter(move |updates, _, _| {
            let count = updates
                .get("count")
                .map(|record| record.to_integer())
                .transpose()?
                .unwrap_or_default();
            seen.store(count as usize, Ordering::SeqCst);
            Ok(())
        });
    });

    kb_a.set("count", 4_i64).expect("set should succeed");
    tb.pump(16).expect("pump should succeed");
    assert_eq!(aggregate_saw.load(Ordering::SeqCst), 8);
    assert_eq!(kb_b.get("count").map(|r| r.to_integer()), Ok(Ok(8)));
    assert_eq!(kb_a.get("count").map(|r| r.to_integer()), Ok(Ok(4)));
}

#[test]
fn ttl_zero_never_reaches_rebroadcast_filters() {
    let bus = InMemoryBus::default();
    let (kb_a, ta) = peer(&bus, "a", QosConfig::default());
    let (_kb_b, tb) = peer(
        &bus,
        "b",
        QosConfig {
            participant_ttl: 5,
            ..QosConfig::default()
        },
    );
    let (kb_c, tc) = peer(&bus, "c", QosConfig::default());
    let relayed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&relayed);
    tb.update_qos(|qos| {
        qos.add_rebroadcast_aggregate_filter(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    });

    kb_a.set("x", 1_i64).expect("set should succeed");
    assert_eq!(tb.pump(16), Ok(1));
    assert_eq!(relayed.load(Ordering::SeqCst), 0);
    assert_eq!(tb.stats().rebroadcasts, 0);

    ta.update_qos(|qos| qos.config.rebroadcast_ttl = 2);
    kb_a.set("y", 2_i64).expect("set should succeed");
    tb.pump(16).expect("pump should succeed");
    assert_eq!(relayed.load(Ordering::SeqCst), 1);
    assert_eq!(tb.stats().rebroadcasts, 1);

    // c hears x and y from a, then the relay of y from b.
    assert_eq!(tc.pump(16), Ok(3));
    assert_eq!(kb_c.get("y").map(|r| r.to_integer()), Ok(Ok(2)));
    assert_eq!(tc.stats().stale_records, 1);
    // the relay carries a as originator, so a ignores it.
    assert_eq!(ta.pump(16), Ok(1));
    assert_eq!(ta.stats().dropped_self, 1);
}

#[test]
fn older_remote_update_is_stale() {
    let bus = InMemoryBus::default();
    let (kb_a, _ta) = peer(&bus, "a", QosConfig::default());
    let (kb_b, tb) = peer(&bus, "b", QosConfig::default());

    for value in 0..3_i64 {
        kb_b.set("x", value).expect("set should succeed");
    }
    kb_a.set("x", 99_i64).expect("set should succeed");
    let outcome = tb
        .pump_once()
        .expect("pump should succeed")
        .expect("a packet should be waiting");
    assert_eq!(
        outcome,
        ReceiveOutcome::Merged {
            applied: 0,
            stale: 1,
            rebroadcast: false,
        }
    );
    assert_eq!(kb_b.get("x").map(|r| r.to_integer()), Ok(Ok(2)));
    assert_eq!(kb_b.stats().stale, 1);
}

#[test]
fn failing_receive_filter_does_not_block_merge() {
    let bus = InMemoryBus::default();
    let (kb_a, _ta) = peer(&bus, "a", QosConfig::default());
    let (kb_b, tb) = peer(&bus, "b", QosConfig::default());
    tb.update_qos(|qos| {
        qos.add_receive_filter(&[RecordType::String], |_, _| {
            Err(FilterError::new("cannot parse"))
        });
        qos.add_receive_aggregate_filter(|updates, transport, _| {
            transport.add_record("last_sender", Record::string(transport.originator.clone()).with_clock(1));
            updates.remove("noise");
            Ok(())
        });
    });

    kb_a.set_with("status", "ready", &EvalSettings::delayed())
        .expect("set should succeed");
    kb_a.set_with("noise", 1_i64, &EvalSettings::delayed())
        .expect("set should succeed");
    kb_a.send_modifieds().expect("send should succeed");
    tb.pump(16).expect("pump should succeed");

    assert_eq!(
        kb_b.get("status").map(|r| r.to_string_value()),
        Ok("ready".to_string())
    );
    assert!(!kb_b.exists("noise").expect("exists should succeed"));
    assert_eq!(
        kb_b.get("last_sender").map(|r| r.to_string_value()),
        Ok("a".to_string())
    );
    assert_eq!(tb.stats().filter_failures, 1);
}

#[test]
fn untrusted_originator_is_ignored() {
    let bus = InMemoryBus::default();
    let (kb_a, _ta) = peer(&bus, "a", QosConfig::default());
    let (kb_b, tb) = peer(
        &bus,
        "b",
        QosConfig {
            trusted_peers: vec!["c".to_string()],
            ..QosConfig::default()
        },
    );
    kb_a.set("x", 1_i64).expect("set should succeed");
    tb.pump(16).expect("pump should succeed");
    assert!(!kb_b.exists("x").expect("exists should succeed"));
    assert_eq!(tb.stats().dropped_untrusted, 1);
}

#[test]
fn waiter_wakes_when_runner_merges_remote_write() {
    let bus = InMemoryBus::default();
    let (kb_a, ta) = peer(&bus, "a", QosConfig::default());
    let (kb_b, tb) = peer(&bus, "b", QosConfig::default());
    let _runner_a = TransportRunner::spawn(ta);
    let _runner_b = TransportRunner::spawn(tb);

    let writer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        kb_a.evaluate("ready = 1", &EvalSettings::default())
            .expect("evaluate should succeed");
    });
    let outcome = kb_b
        .wait("ready == 1", &WaitSettings::with_timeout(Duration::from_secs(5)))
        .expect("wait should succeed");
    writer.join().expect("writer thread should finish");
    assert!(!outcome.timed_out);
    assert!(outcome.record.is_true());
}
