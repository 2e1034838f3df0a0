//! Send, receive, and rebroadcast paths between a knowledge base and a
//! byte adapter.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use lore_codec::{decode_message_cbor, encode_message_cbor, Message, MessageHeader};
use lore_core::{is_local_name, Record};
use lore_engine::{CompiledExpression, Disseminator, EvalSettings, KbError, KnowledgeBase};
use tracing::{debug, info, warn};

use crate::adapter::{AdapterHealth, TransportAdapter};
use crate::bandwidth::BandwidthMonitor;
use crate::context::{Operation, TransportContext};
use crate::error::TransportError;
use crate::filters::{FilterChain, FilterReport};
use crate::qos::QosTransportSettings;
use crate::scheduler::PacketScheduler;
use crate::settings::TransportSettings;

/// Why an inbound packet was ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Oversized,
    Malformed,
    SelfOriginated,
    Untrusted,
    WrongDomain,
    Expired,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::Oversized => "oversized",
            DropReason::Malformed => "malformed",
            DropReason::SelfOriginated => "self-originated",
            DropReason::Untrusted => "untrusted",
            DropReason::WrongDomain => "wrong domain",
            DropReason::Expired => "expired",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of handing one inbound packet to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Merged {
        applied: usize,
        stale: usize,
        rebroadcast: bool,
    },
    Dropped(DropReason),
}

/// Result of one outbound emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { records: usize, bytes: usize },
    /// Filters left nothing to send.
    Empty,
    /// The packet scheduler dropped the packet.
    Scheduled,
}

/// Counters kept by one transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub sent_packets: usize,
    pub sent_records: usize,
    pub sent_bytes: usize,
    pub received_packets: usize,
    pub received_bytes: usize,
    pub merged_records: usize,
    pub stale_records: usize,
    pub rebroadcasts: usize,
    pub filter_failures: usize,
    pub throttled_sends: usize,
    pub dropped_by_scheduler: usize,
    pub dropped_oversized: usize,
    pub dropped_malformed: usize,
    pub dropped_self: usize,
    pub dropped_untrusted: usize,
    pub dropped_domain: usize,
    pub dropped_expired: usize,
    pub on_receive_errors: usize,
}

impl TransportStats {
    fn record_drop(&mut self, reason: DropReason) {
        let counter = match reason {
            DropReason::Oversized => &mut self.dropped_oversized,
            DropReason::Malformed => &mut self.dropped_malformed,
            DropReason::SelfOriginated => &mut self.dropped_self,
            DropReason::Untrusted => &mut self.dropped_untrusted,
            DropReason::WrongDomain => &mut self.dropped_domain,
            DropReason::Expired => &mut self.dropped_expired,
        };
        *counter += 1;
    }

    pub fn dropped_total(&self) -> usize {
        self.dropped_oversized
            + self.dropped_malformed
            + self.dropped_self
            + self.dropped_untrusted
            + self.dropped_domain
            + self.dropped_expired
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Links one knowledge base to one adapter.
///
/// Created through [`Transport::new`], which attaches the transport to the
/// knowledge base so `send_modifieds` reaches it.
pub struct Transport<A: TransportAdapter> {
    kb: KnowledgeBase,
    settings: TransportSettings,
    originator: String,
    qos: RwLock<QosTransportSettings>,
    adapter: Mutex<A>,
    send_monitor: Mutex<BandwidthMonitor>,
    receive_monitor: Mutex<BandwidthMonitor>,
    scheduler: Mutex<PacketScheduler>,
    stats: Mutex<TransportStats>,
    on_data_received: Option<CompiledExpression>,
}

impl<A: TransportAdapter> fmt::Debug for Transport<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("originator", &self.originator)
            .field("domain", &self.settings.domain)
            .finish()
    }
}

impl<A: TransportAdapter + 'static> Transport<A> {
    /// Builds a transport with no filters and attaches it to `kb`.
    pub fn new(
        kb: &KnowledgeBase,
        settings: TransportSettings,
        adapter: A,
    ) -> Result<Arc<Self>, TransportError> {
        let qos = QosTransportSettings::new(settings.qos.clone());
        Self::with_qos(kb, settings, qos, adapter)
    }

    /// Builds a transport with pre-registered filters. `qos.config` wins
    /// over `settings.qos`.
    pub fn with_qos(
        kb: &KnowledgeBase,
        settings: TransportSettings,
        qos: QosTransportSettings,
        adapter: A,
    ) -> Result<Arc<Self>, TransportError> {
        let on_data_received = settings
            .on_data_received_logic
            .as_deref()
            .map(|logic| kb.compile(logic))
            .transpose()?;
        let originator = if settings.id.is_empty() {
            kb.id().to_string()
        } else {
            settings.id.clone()
        };
        let scheduler = PacketScheduler::new(qos.config.drop_rate, qos.config.drop_burst);
        let transport = Arc::new(Self {
            kb: kb.clone(),
            settings,
            originator,
            qos: RwLock::new(qos),
            adapter: Mutex::new(adapter),
            send_monitor: Mutex::new(BandwidthMonitor::default()),
            receive_monitor: Mutex::new(BandwidthMonitor::default()),
            scheduler: Mutex::new(scheduler),
            stats: Mutex::new(TransportStats::default()),
            on_data_received,
        });
        kb.attach(&transport);
        info!(
            "transport: {} attached to domain {}",
            transport.originator, transport.settings.domain
        );
        Ok(transport)
    }
}

impl<A: TransportAdapter> Transport<A> {
    pub fn knowledge_base(&self) -> &KnowledgeBase {
        &self.kb
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    pub fn originator(&self) -> &str {
        &self.originator
    }

    pub fn stats(&self) -> TransportStats {
        lock(&self.stats).clone()
    }

    pub fn health(&self) -> AdapterHealth {
        lock(&self.adapter).health_snapshot()
    }

    /// Snapshot of the current QoS settings.
    pub fn qos(&self) -> QosTransportSettings {
        self.qos
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Mutates QoS settings and filter lists in place. Packets already in
    /// flight keep the settings they started with.
    pub fn update_qos<R>(&self, update: impl FnOnce(&mut QosTransportSettings) -> R) -> R {
        let mut qos = self.qos.write().unwrap_or_else(PoisonError::into_inner);
        let result = update(&mut qos);
        let mut scheduler = lock(&self.scheduler);
        *scheduler = PacketScheduler::new(qos.config.drop_rate, qos.config.drop_burst);
        result
    }

    /// Replaces the packet scheduler, e.g. with a seeded one.
    pub fn set_scheduler(&self, scheduler: PacketScheduler) {
        *lock(&self.scheduler) = scheduler;
    }

    /// Runs `f` against the adapter.
    pub fn with_adapter<R>(&self, f: impl FnOnce(&mut A) -> R) -> R {
        f(&mut lock(&self.adapter))
    }

    pub fn send_bandwidth(&self) -> u64 {
        lock(&self.send_monitor).bytes_per_second()
    }

    pub fn receive_bandwidth(&self) -> u64 {
        lock(&self.receive_monitor).bytes_per_second()
    }

    /// Filters, encodes, and broadcasts one batch of local updates.
    pub fn send_updates(
        &self,
        updates: BTreeMap<String, Record>,
    ) -> Result<SendOutcome, TransportError> {
        let qos = self.qos();
        let now = unix_now();
        let mut transport = self.transport_context(Operation::Send, &self.originator, now, now);
        let updates = self.run_filters(qos.send_filters(), updates, &mut transport)?;
        let updates = strip_locals(updates);
        if updates.is_empty() {
            debug!("transport: send filters left nothing to send");
            return Ok(SendOutcome::Empty);
        }

        let mut header = MessageHeader::new(self.settings.domain.clone(), self.originator.clone());
        header.clock = self.kb.clock()?;
        header.quality = updates.values().map(|record| record.quality).max().unwrap_or(0);
        header.ttl = qos.config.rebroadcast_ttl;
        header.timestamp = now;
        self.emit(Message::new(header, updates), &qos)
    }

    /// Receives and handles at most one packet.
    pub fn pump_once(&self) -> Result<Option<ReceiveOutcome>, TransportError> {
        let inbound = {
            let mut adapter = lock(&self.adapter);
            if !adapter.can_recv() {
                return Ok(None);
            }
            adapter.recv()
        };
        let Some((peer, bytes)) = inbound else {
            return Ok(None);
        };
        self.process_received(&peer, &bytes).map(Some)
    }

    /// Drains up to `max_packets` inbound packets. Returns how many were
    /// handled.
    pub fn pump(&self, max_packets: usize) -> Result<usize, TransportError> {
        let mut handled = 0;
        while handled < max_packets {
            if self.pump_once()?.is_none() {
                break;
            }
            handled += 1;
        }
        Ok(handled)
    }

    /// Runs one inbound packet through the receive pipeline.
    pub fn process_received(
        &self,
        peer: &str,
        bytes: &[u8],
    ) -> Result<ReceiveOutcome, TransportError> {
        {
            let mut stats = lock(&self.stats);
            stats.received_packets += 1;
            stats.received_bytes += bytes.len();
        }
        lock(&self.receive_monitor).record(bytes.len());

        if bytes.len() > self.settings.queue_length {
            return Ok(self.drop_packet(peer, DropReason::Oversized));
        }
        let message = match decode_message_cbor(bytes) {
            Ok(message) => message,
            Err(err) => {
                debug!("transport: undecodable packet from {peer}: {err}");
                return Ok(self.drop_packet(peer, DropReason::Malformed));
            }
        };
        let header = message.header.clone();
        if header.originator == self.originator {
            return Ok(self.drop_packet(peer, DropReason::SelfOriginated));
        }

        let qos = self.qos();
        if !qos.is_trusted(peer) || !qos.is_trusted(&header.originator) {
            return Ok(self.drop_packet(peer, DropReason::Untrusted));
        }
        if header.domain != self.settings.domain {
            return Ok(self.drop_packet(peer, DropReason::WrongDomain));
        }
        let now = unix_now();
        if let Some(deadline) = qos.config.deadline() {
            if Duration::from_secs(now.saturating_sub(header.timestamp)) > deadline {
                return Ok(self.drop_packet(peer, DropReason::Expired));
            }
        }

        let mut rebroadcast = false;
        if header.ttl > 0 && qos.config.participant_ttl > 0 {
            match self.rebroadcast(&message, &qos, now) {
                Ok(SendOutcome::Sent { .. }) => rebroadcast = true,
                Ok(_) => {}
                Err(err) => warn!("transport: rebroadcast from {peer} failed: {err}"),
            }
        }

        let mut transport =
            self.transport_context(Operation::Receive, &header.originator, header.timestamp, now);
        let (merge, report) =
            self.kb
                .merge_remote(header.clock, &EvalSettings::delayed(), |vars| {
                    qos.receive_filters()
                        .apply(message.updates, &mut transport, vars)
                })?;
        self.note_filter_report(report);
        {
            let mut stats = lock(&self.stats);
            stats.merged_records += merge.applied;
            stats.stale_records += merge.stale;
        }
        debug!(
            "transport: merged {} records from {} ({} stale)",
            merge.applied, header.originator, merge.stale
        );

        // Runs for every accepted packet, even when filters emptied it.
        if let Some(logic) = &self.on_data_received {
            if let Err(err) = self.kb.evaluate_compiled(logic, &EvalSettings::DEFAULT) {
                warn!("transport: on_data_received_logic failed: {err}");
                lock(&self.stats).on_receive_errors += 1;
            }
        }

        Ok(ReceiveOutcome::Merged {
            applied: merge.applied,
            stale: merge.stale,
            rebroadcast,
        })
    }

    fn rebroadcast(
        &self,
        message: &Message,
        qos: &QosTransportSettings,
        now: u64,
    ) -> Result<SendOutcome, TransportError> {
        let header = &message.header;
        let mut transport = self.transport_context(
            Operation::Rebroadcast,
            &header.originator,
            header.timestamp,
            now,
        );
        let updates =
            self.run_filters(qos.rebroadcast_filters(), message.updates.clone(), &mut transport)?;
        let updates = strip_locals(updates);
        if updates.is_empty() {
            return Ok(SendOutcome::Empty);
        }
        let mut header = header.clone();
        header.ttl = header.ttl.saturating_sub(1).min(qos.config.participant_ttl);
        let outcome = self.emit(Message::new(header, updates), qos)?;
        if matches!(outcome, SendOutcome::Sent { .. }) {
            lock(&self.stats).rebroadcasts += 1;
        }
        Ok(outcome)
    }

    fn run_filters(
        &self,
        chain: &FilterChain,
        updates: BTreeMap<String, Record>,
        transport: &mut TransportContext,
    ) -> Result<BTreeMap<String, Record>, TransportError> {
        if chain.is_empty() {
            return Ok(updates);
        }
        let (updates, report) = self
            .kb
            .run_exclusive(&EvalSettings::delayed(), |vars| {
                chain.apply(updates, transport, vars)
            })?;
        self.note_filter_report(report);
        Ok(updates)
    }

    fn emit(
        &self,
        message: Message,
        qos: &QosTransportSettings,
    ) -> Result<SendOutcome, TransportError> {
        if !lock(&self.scheduler).admit() {
            debug!("transport: scheduler dropped outbound packet");
            lock(&self.stats).dropped_by_scheduler += 1;
            return Ok(SendOutcome::Scheduled);
        }
        let records = message.updates.len();
        let bytes = encode_message_cbor(&message)?;
        if bytes.len() > self.settings.queue_length {
            return Err(TransportError::Oversized {
                size: bytes.len(),
                limit: self.settings.queue_length,
            });
        }

        let delay = self.throttle_delay(bytes.len(), qos);
        if !delay.is_zero() {
            debug!("transport: throttling send for {delay:?}");
            lock(&self.stats).throttled_sends += 1;
            thread::sleep(delay);
        }

        lock(&self.adapter)
            .send(&bytes)
            .map_err(|err| TransportError::Adapter(err.to_string()))?;
        lock(&self.send_monitor).record(bytes.len());
        let mut stats = lock(&self.stats);
        stats.sent_packets += 1;
        stats.sent_records += records;
        stats.sent_bytes += bytes.len();
        Ok(SendOutcome::Sent {
            records,
            bytes: bytes.len(),
        })
    }

    /// Pause needed to keep the send rate under the send limit and the
    /// combined rate under the total limit.
    fn throttle_delay(&self, next: usize, qos: &QosTransportSettings) -> Duration {
        let send_limit = qos.config.send_bandwidth_limit;
        let total_limit = qos.config.total_bandwidth_limit;
        if send_limit == 0 && total_limit == 0 {
            return Duration::ZERO;
        }
        let now = Instant::now();
        let mut limit = if send_limit == 0 { u64::MAX } else { send_limit };
        if total_limit > 0 {
            let received = lock(&self.receive_monitor).bytes_per_second_at(now);
            limit = limit.min(total_limit.saturating_sub(received).max(1));
        }
        lock(&self.send_monitor).throttle_delay_at(now, next, limit)
    }

    fn transport_context(
        &self,
        operation: Operation,
        originator: &str,
        message_time: u64,
        now: u64,
    ) -> TransportContext {
        let mut transport =
            TransportContext::new(operation, self.settings.domain.clone(), originator);
        transport.send_bandwidth = self.send_bandwidth();
        transport.receive_bandwidth = self.receive_bandwidth();
        transport.message_time = message_time;
        transport.current_time = now;
        transport
    }

    fn note_filter_report(&self, report: FilterReport) {
        if report.failures > 0 {
            lock(&self.stats).filter_failures += report.failures;
        }
    }

    fn drop_packet(&self, peer: &str, reason: DropReason) -> ReceiveOutcome {
        debug!("transport: dropped packet from {peer}: {reason}");
        lock(&self.stats).record_drop(reason);
        ReceiveOutcome::Dropped(reason)
    }
}

fn strip_locals(updates: BTreeMap<String, Record>) -> BTreeMap<String, Record> {
    updates
        .into_iter()
        .filter(|(name, _)| !name.is_empty() && !is_local_name(name))
        .collect()
}

impl<A: TransportAdapter> Disseminator for Transport<A> {
    fn send_modifieds(&self, updates: &BTreeMap<String, Record>) -> Result<(), KbError> {
        match self.send_updates(updates.clone()) {
            Ok(_) => Ok(()),
            Err(TransportError::Engine(err)) => Err(err),
            Err(err) => Err(KbError::Dissemination(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use lore_codec::{decode_message_cbor, encode_message_cbor, Message, MessageHeader};
    use lore_core::{Record, RecordType};
    use lore_engine::{EvalSettings, KbError, KnowledgeBase};

    use super::{unix_now, DropReason, ReceiveOutcome, SendOutcome, Transport};
    use crate::adapter::InMemoryAdapter;
    use crate::error::TransportError;
    use crate::filters::FilterOutput;
    use crate::scheduler::PacketScheduler;
    use crate::settings::{QosConfig, TransportSettings};

    fn settings(id: &str) -> TransportSettings {
        TransportSettings {
            id: id.to_string(),
            ..TransportSettings::default()
        }
    }

    fn packet(originator: &str, ttl: u8, updates: &[(&str, Record)]) -> Vec<u8> {
        let mut header = MessageHeader::new("lore", originator);
        header.ttl = ttl;
        header.timestamp = unix_now();
        let updates: BTreeMap<String, Record> = updates
            .iter()
            .map(|(name, record)| (name.to_string(), record.clone()))
            .collect();
        encode_message_cbor(&Message::new(header, updates)).expect("packet should encode")
    }

    #[test]
    fn local_writes_reach_the_adapter() {
        let kb = KnowledgeBase::with_id("agent.0");
        let transport = Transport::new(&kb, settings("agent.0"), InMemoryAdapter::default())
            .expect("transport should build");

        kb.set("x", 5_i64).expect("set should succeed");
        kb.set(".hidden", 1_i64).expect("local set should succeed");

        let outbound = transport.with_adapter(InMemoryAdapter::take_outbound);
        assert_eq!(outbound.len(), 1);
        let message = decode_message_cbor(&outbound[0]).expect("outbound should decode");
        assert_eq!(message.header.originator, "agent.0");
        assert_eq!(message.header.domain, "lore");
        assert_eq!(message.updates.len(), 1);
        assert_eq!(message.updates["x"].to_integer(), Ok(5));
        assert_eq!(transport.stats().sent_packets, 1);
    }

    #[test]
    fn send_filter_runs_before_aggregate_filter() {
        let kb = KnowledgeBase::new();
        let transport = Transport::new(&kb, settings("agent.0"), InMemoryAdapter::default())
            .expect("transport should build");
        transport.update_qos(|qos| {
            qos.add_send_filter(&[RecordType::Integer], |args, _| {
                Ok(FilterOutput::replace(args.record.to_integer()? * 2))
            });
            qos.add_send_aggregate_filter(|updates, _, vars| {
                let count = updates.get("count").cloned().unwrap_or_default();
                vars.set(".aggregate_saw", count.into_value());
                Ok(())
            });
        });

        kb.set("count", 4_i64).expect("set should succeed");
        assert_eq!(kb.get(".aggregate_saw").map(|r| r.to_integer()), Ok(Ok(8)));
        let outbound = transport.with_adapter(InMemoryAdapter::take_outbound);
        let message = decode_message_cbor(&outbound[0]).expect("outbound should decode");
        assert_eq!(message.updates["count"].to_integer(), Ok(8));
        assert_eq!(kb.get("count"), Ok(Record::integer(4).with_clock(1)));
    }

    #[test]
    fn discarding_everything_sends_nothing() {
        let kb = KnowledgeBase::new();
        let transport = Transport::new(&kb, settings("agent.0"), InMemoryAdapter::default())
            .expect("transport should build");
        transport.update_qos(|qos| {
            qos.add_send_aggregate_filter(|updates, _, _| {
                updates.clear();
                Ok(())
            })
        });
        let outcome = transport
            .send_updates(BTreeMap::from([("x".to_string(), Record::integer(1))]))
            .expect("send should succeed");
        assert_eq!(outcome, SendOutcome::Empty);
        assert!(transport.with_adapter(InMemoryAdapter::take_outbound).is_empty());
    }

    #[test]
    fn oversized_packets_are_rejected_on_send() {
        let kb = KnowledgeBase::new();
        let transport = Transport::new(
            &kb,
            TransportSettings {
                queue_length: 16,
                ..settings("agent.0")
            },
            InMemoryAdapter::default(),
        )
        .expect("transport should build");
        let err = transport
            .send_updates(BTreeMap::from([(
                "blob".to_string(),
                Record::binary(vec![0_u8; 256]),
            )]))
            .expect_err("oversized packet should fail");
        assert!(matches!(err, TransportError::Oversized { limit: 16, .. }));

        kb.set_with("blob", vec![0_u8; 256], &EvalSettings::delayed())
            .expect("delayed set should succeed");
        assert!(matches!(kb.send_modifieds(), Err(KbError::Dissemination(_))));
    }

    #[test]
    fn inbound_packets_merge_and_drop_by_policy() {
        let kb = KnowledgeBase::new();
        let transport = Transport::new(&kb, settings("agent.0"), InMemoryAdapter::default())
            .expect("transport should build");
        transport.update_qos(|qos| qos.add_banned_peer("agent.9"));

        let merged = transport
            .process_received("agent.1", &packet("agent.1", 0, &[("x", Record::integer(3).with_clock(4))]))
            .expect("receive should succeed");
        assert_eq!(
            merged,
            ReceiveOutcome::Merged {
                applied: 1,
                stale: 0,
                rebroadcast: false,
            }
        );
        assert_eq!(kb.get("x"), Ok(Record::integer(3).with_clock(4)));
        assert!(kb.clock().expect("clock should read") >= 4);

        let drops = [
            (transport.process_received("agent.1", b"not cbor"), DropReason::Malformed),
            (
                transport.process_received("agent.1", &packet("agent.0", 0, &[("y", Record::integer(1))])),
                DropReason::SelfOriginated,
            ),
            (
                transport.process_received("agent.9", &packet("agent.1", 0, &[("y", Record::integer(1))])),
                DropReason::Untrusted,
            ),
        ];
        for (outcome, reason) in drops {
            assert_eq!(outcome, Ok(ReceiveOutcome::Dropped(reason)));
        }
        assert!(!kb.exists("y").expect("exists should succeed"));
        assert_eq!(transport.stats().dropped_total(), 3);
    }

    #[test]
    fn wrong_domain_and_expired_packets_are_dropped() {
        let kb = KnowledgeBase::new();
        let transport = Transport::new(
            &kb,
            TransportSettings {
                qos: QosConfig {
                    deadline_secs: 5.0,
                    ..QosConfig::default()
                },
                ..settings("agent.0")
            },
            InMemoryAdapter::default(),
        )
        .expect("transport should build");

        let mut header = MessageHeader::new("other", "agent.1");
        header.timestamp = unix_now();
        let foreign = encode_message_cbor(&Message::new(
            header,
            BTreeMap::from([("x".to_string(), Record::integer(1))]),
        ))
        .expect("packet should encode");
        assert_eq!(
            transport.process_received("agent.1", &foreign),
            Ok(ReceiveOutcome::Dropped(DropReason::WrongDomain))
        );

        let mut header = MessageHeader::new("lore", "agent.1");
        header.timestamp = unix_now().saturating_sub(60);
        let old = encode_message_cbor(&Message::new(
            header,
            BTreeMap::from([("x".to_string(), Record::integer(1))]),
        ))
        .expect("packet should encode");
        assert_eq!(
            transport.process_received("agent.1", &old),
            Ok(ReceiveOutcome::Dropped(DropReason::Expired))
        );
        assert!(!kb.exists("x").expect("exists should succeed"));
    }

    #[test]
    fn rebroadcast_decrements_ttl_and_keeps_originator() {
        let kb = KnowledgeBase::new();
        let transport = Transport::new(
            &kb,
            TransportSettings {
                qos: QosConfig {
                    participant_ttl: 1,
                    ..QosConfig::default()
                },
                ..settings("agent.0")
            },
            InMemoryAdapter::default(),
        )
        .expect("transport should build");

        let outcome = transport
            .process_received("agent.1", &packet("agent.2", 3, &[("x", Record::integer(1).with_clock(1))]))
            .expect("receive should succeed");
        assert!(matches!(outcome, ReceiveOutcome::Merged { rebroadcast: true, .. }));

        let outbound = transport.with_adapter(InMemoryAdapter::take_outbound);
        assert_eq!(outbound.len(), 1);
        let relayed = decode_message_cbor(&outbound[0]).expect("relay should decode");
        assert_eq!(relayed.header.originator, "agent.2");
        assert_eq!(relayed.header.ttl, 1);
        assert_eq!(transport.stats().rebroadcasts, 1);
    }

    #[test]
    fn scheduler_drops_are_counted() {
        let kb = KnowledgeBase::new();
        let transport = Transport::new(&kb, settings("agent.0"), InMemoryAdapter::default())
            .expect("transport should build");
        transport.set_scheduler(PacketScheduler::seeded(1.0, 0, 3));
        let outcome = transport
            .send_updates(BTreeMap::from([("x".to_string(), Record::integer(1))]))
            .expect("send should succeed");
        assert_eq!(outcome, SendOutcome::Scheduled);
        assert_eq!(transport.stats().dropped_by_scheduler, 1);
    }

    #[test]
    fn on_data_received_logic_runs_after_merge() {
        let kb = KnowledgeBase::new();
        let transport = Transport::new(
            &kb,
            TransportSettings {
                on_data_received_logic: Some(".seen = x * 10".to_string()),
                ..settings("agent.0")
            },
            InMemoryAdapter::default(),
        )
        .expect("transport should build");
        transport
            .process_received("agent.1", &packet("agent.1", 0, &[("x", Record::integer(7).with_clock(2))]))
            .expect("receive should succeed");
        assert_eq!(kb.get(".seen").map(|r| r.to_integer()), Ok(Ok(70)));
    }

    #[test]
    fn on_data_received_logic_runs_even_when_filters_empty_the_batch() {
        let kb = KnowledgeBase::new();
        let transport = Transport::new(
            &kb,
            TransportSettings {
                on_data_received_logic: Some("++.packets".to_string()),
                ..settings("agent.0")
            },
            InMemoryAdapter::default(),
        )
        .expect("transport should build");
        transport.update_qos(|qos| {
            qos.add_receive_aggregate_filter(|updates, _, _| {
                updates.clear();
                Ok(())
            })
        });

        for clock in 1..=2 {
            let outcome = transport
                .process_received(
                    "agent.1",
                    &packet("agent.1", 0, &[("x", Record::integer(7).with_clock(clock))]),
                )
                .expect("receive should succeed");
            assert_eq!(
                outcome,
                ReceiveOutcome::Merged {
                    applied: 0,
                    stale: 0,
                    rebroadcast: false,
                }
            );
        }
        assert_eq!(kb.get(".packets").map(|r| r.to_integer()), Ok(Ok(2)));
        assert!(!kb.exists("x").expect("exists should succeed"));

        transport
            .process_received("agent.1", b"not cbor")
            .expect("receive should succeed");
        assert_eq!(kb.get(".packets").map(|r| r.to_integer()), Ok(Ok(2)));
    }

    #[test]
    fn bad_on_data_received_logic_fails_construction() {
        let kb = KnowledgeBase::new();
        let err = Transport::new(
            &kb,
            TransportSettings {
                on_data_received_logic: Some("x = (".to_string()),
                ..settings("agent.0")
            },
            InMemoryAdapter::default(),
        )
        .expect_err("syntax error should fail");
        assert!(matches!(err, TransportError::Engine(KbError::Syntax { .. })));
    }
}
