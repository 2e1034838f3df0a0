//! LORE transport layer.
//!
//! Moves modified records between knowledge bases: filter pipelines per
//! stage, QoS policy, byte adapters, and a background runner.

pub mod adapter;
pub mod bandwidth;
pub mod context;
pub mod error;
pub mod filters;
pub mod qos;
pub mod runner;
pub mod scheduler;
pub mod settings;
pub mod transport;

pub use adapter::{
    route_in_memory_outbound, AdapterHealth, BusAdapter, InMemoryAdapter, InMemoryBus,
    TransportAdapter,
};
pub use bandwidth::BandwidthMonitor;
pub use context::{Operation, TransportContext};
pub use error::{FilterError, TransportError};
pub use filters::{
    AggregateFilter, FilterArgs, FilterChain, FilterOutput, FilterReport, RecordFilter,
};
pub use qos::QosTransportSettings;
pub use runner::TransportRunner;
pub use scheduler::PacketScheduler;
pub use settings::{QosConfig, TransportSettings};
pub use transport::{DropReason, ReceiveOutcome, SendOutcome, Transport, TransportStats};
