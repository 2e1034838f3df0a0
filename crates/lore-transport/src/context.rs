use std::collections::BTreeMap;

use lore_core::Record;

/// Pipeline stage currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Operation {
    #[default]
    Idle,
    Send,
    Receive,
    Rebroadcast,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Idle => "idle",
            Operation::Send => "send",
            Operation::Receive => "receive",
            Operation::Rebroadcast => "rebroadcast",
        }
    }
}

/// Metadata about the packet being filtered, handed to aggregate filters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportContext {
    pub operation: Operation,
    /// Measured outbound bytes per second.
    pub send_bandwidth: u64,
    /// Measured inbound bytes per second.
    pub receive_bandwidth: u64,
    /// UNIX seconds the packet was first emitted.
    pub message_time: u64,
    /// UNIX seconds now.
    pub current_time: u64,
    pub domain: String,
    pub originator: String,
    staged: BTreeMap<String, Record>,
}

impl TransportContext {
    pub fn new(operation: Operation, domain: impl Into<String>, originator: impl Into<String>) -> Self {
        Self {
            operation,
            domain: domain.into(),
            originator: originator.into(),
            ..Self::default()
        }
    }

    /// Stages an extra record to travel with the current batch. Staging a
    /// name twice keeps the latest record.
    pub fn add_record(&mut self, name: impl Into<String>, record: Record) {
        self.staged.insert(name.into(), record);
    }

    pub fn staged(&self) -> &BTreeMap<String, Record> {
        &self.staged
    }

    pub(crate) fn take_staged(&mut self) -> BTreeMap<String, Record> {
        std::mem::take(&mut self.staged)
    }

    /// Seconds between emission and now, zero when the sender's clock is
    /// ahead.
    pub fn message_age(&self) -> u64 {
        self.current_time.saturating_sub(self.message_time)
    }
}
