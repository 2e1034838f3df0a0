use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Coarse per-adapter health counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterHealth {
    pub outbound_send_ok: u64,
    pub outbound_send_err: u64,
    pub inbound_received: u64,
    pub inbound_dropped: u64,
    pub last_error: Option<String>,
}

/// Byte-oriented broadcast contract. Concrete socket transports live
/// outside this crate.
pub trait TransportAdapter: Send {
    /// Adapter-specific send error.
    type Error: fmt::Display;

    /// Best-effort delivery of one encoded packet to every reachable host.
    fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;
    /// Returns the next inbound packet and the host it came from.
    fn recv(&mut self) -> Option<(String, Vec<u8>)>;

    /// Optional maximum payload hint.
    fn max_payload_hint(&self) -> Option<usize> {
        None
    }

    fn can_send(&self) -> bool {
        true
    }

    fn can_recv(&self) -> bool {
        true
    }

    fn health_snapshot(&self) -> AdapterHealth {
        AdapterHealth::default()
    }
}

/// In-memory adapter for tests: captures outbound packets and replays
/// queued inbound ones.
#[derive(Debug, Clone)]
pub struct InMemoryAdapter {
    inbound: VecDeque<(String, Vec<u8>)>,
    outbound: Vec<Vec<u8>>,
    payload_hint: Option<usize>,
    max_send_bytes: usize,
    drop_outbound: bool,
    allow_send: bool,
    allow_recv: bool,
    health: AdapterHealth,
}

impl Default for InMemoryAdapter {
    fn default() -> Self {
        Self {
            inbound: VecDeque::new(),
            outbound: Vec::new(),
            payload_hint: None,
            max_send_bytes: usize::MAX,
            drop_outbound: false,
            allow_send: true,
            allow_recv: true,
            health: AdapterHealth::default(),
        }
    }
}

impl InMemoryAdapter {
    /// Creates an adapter that rejects sends larger than `max_send_bytes`.
    pub fn with_max_send_bytes(max_send_bytes: usize) -> Self {
        Self {
            max_send_bytes,
            payload_hint: Some(max_send_bytes),
            ..Self::default()
        }
    }

    /// Queues bytes as inbound traffic from `host`.
    pub fn enqueue_inbound(&mut self, host: impl Into<String>, bytes: Vec<u8>) {
        self.inbound.push_back((host.into(), bytes));
    }

    /// Drains and returns all outbound packets captured so far.
    pub fn take_outbound(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbound)
    }

    /// If enabled, outbound sends are silently dropped.
    pub fn set_drop_outbound(&mut self, drop_outbound: bool) {
        self.drop_outbound = drop_outbound;
    }

    pub fn set_allow_send(&mut self, allow_send: bool) {
        self.allow_send = allow_send;
    }

    pub fn set_allow_recv(&mut self, allow_recv: bool) {
        self.allow_recv = allow_recv;
    }
}

impl TransportAdapter for InMemoryAdapter {
    type Error = &'static str;

    fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        if !self.allow_send {
            self.health.outbound_send_err += 1;
            return Err("send disabled");
        }
        if bytes.len() > self.max_send_bytes {
            self.health.outbound_send_err += 1;
            self.health.last_error = Some("payload exceeds max_send_bytes".to_string());
            return Err("payload exceeds max_send_bytes");
        }
        if self.drop_outbound {
            self.health.outbound_send_err += 1;
            return Ok(());
        }
        self.outbound.push(bytes.to_vec());
        self.health.outbound_send_ok += 1;
        Ok(())
    }

    fn recv(&mut self) -> Option<(String, Vec<u8>)> {
        if !self.allow_recv {
            return None;
        }
        let msg = self.inbound.pop_front();
        if msg.is_some() {
            self.health.inbound_received += 1;
        }
        msg
    }

    fn max_payload_hint(&self) -> Option<usize> {
        self.payload_hint
    }

    fn can_send(&self) -> bool {
        self.allow_send
    }

    fn can_recv(&self) -> bool {
        self.allow_recv
    }

    fn health_snapshot(&self) -> AdapterHealth {
        self.health.clone()
    }
}

/// Moves every captured outbound packet from one in-memory adapter into
/// another's inbound queue, tagged as sent by `from_host`.
pub fn route_in_memory_outbound(
    from_adapter: &mut InMemoryAdapter,
    to_adapter: &mut InMemoryAdapter,
    from_host: impl Into<String>,
) -> usize {
    let from_host = from_host.into();
    let outbound = from_adapter.take_outbound();
    let moved = outbound.len();
    for bytes in outbound {
        to_adapter.enqueue_inbound(from_host.clone(), bytes);
    }
    moved
}

type Inboxes = BTreeMap<String, VecDeque<(String, Vec<u8>)>>;

/// Shared broadcast medium linking several in-process hosts.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBus {
    inboxes: Arc<Mutex<Inboxes>>,
}

impl InMemoryBus {
    /// Registers `host` and returns its adapter.
    pub fn join(&self, host: impl Into<String>) -> BusAdapter {
        let host = host.into();
        self.inboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(host.clone())
            .or_default();
        BusAdapter {
            bus: self.clone(),
            host,
            health: AdapterHealth::default(),
        }
    }

    /// Packets waiting for `host`.
    pub fn pending(&self, host: &str) -> usize {
        self.inboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(host)
            .map_or(0, VecDeque::len)
    }
}

/// One host's view of an `InMemoryBus`. Sends reach every other host.
#[derive(Debug)]
pub struct BusAdapter {
    bus: InMemoryBus,
    host: String,
    health: AdapterHealth,
}

impl BusAdapter {
    pub fn host(&self) -> &str {
        &self.host
    }
}

impl TransportAdapter for BusAdapter {
    type Error = &'static str;

    fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        let mut inboxes = self
            .bus
            .inboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for (host, inbox) in inboxes.iter_mut() {
            if host != &self.host {
                inbox.push_back((self.host.clone(), bytes.to_vec()));
            }
        }
        self.health.outbound_send_ok += 1;
        Ok(())
    }

    fn recv(&mut self) -> Option<(String, Vec<u8>)> {
        let msg = self
            .bus
            .inboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&self.host)
            .and_then(VecDeque::pop_front);
        if msg.is_some() {
            self.health.inbound_received += 1;
        }
        msg
    }

    fn health_snapshot(&self) -> AdapterHealth {
        self.health.clone()
    }
}
