use std::collections::BTreeMap;
use std::sync::Arc;

use lore_core::{Record, RecordType};
use lore_engine::Variables;

use crate::context::{Operation, TransportContext};
use crate::error::FilterError;
use crate::filters::{AggregateFilter, FilterArgs, FilterChain, FilterOutput, RecordFilter};
use crate::settings::QosConfig;

/// QoS policy plus the filter chain of each pipeline stage.
#[derive(Debug, Clone, Default)]
pub struct QosTransportSettings {
    pub config: QosConfig,
    send: FilterChain,
    receive: FilterChain,
    rebroadcast: FilterChain,
}

impl QosTransportSettings {
    pub fn new(config: QosConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Chain for `operation`. Idle has no chain.
    pub fn chain(&self, operation: Operation) -> Option<&FilterChain> {
        match operation {
            Operation::Send => Some(&self.send),
            Operation::Receive => Some(&self.receive),
            Operation::Rebroadcast => Some(&self.rebroadcast),
            Operation::Idle => None,
        }
    }

    pub fn send_filters(&self) -> &FilterChain {
        &self.send
    }

    pub fn receive_filters(&self) -> &FilterChain {
        &self.receive
    }

    pub fn rebroadcast_filters(&self) -> &FilterChain {
        &self.rebroadcast
    }

    pub fn add_send_filter<F>(&mut self, types: &[RecordType], filter: F)
    where
        F: Fn(&FilterArgs<'_>, &mut Variables<'_>) -> Result<FilterOutput, FilterError>
            + Send
            + Sync
            + 'static,
    {
        self.send.add_record_filter(types, filter);
    }

    pub fn add_receive_filter<F>(&mut self, types: &[RecordType], filter: F)
    where
        F: Fn(&FilterArgs<'_>, &mut Variables<'_>) -> Result<FilterOutput, FilterError>
            + Send
            + Sync
            + 'static,
    {
        self.receive.add_record_filter(types, filter);
    }

    pub fn add_rebroadcast_filter<F>(&mut self, types: &[RecordType], filter: F)
    where
        F: Fn(&FilterArgs<'_>, &mut Variables<'_>) -> Result<FilterOutput, FilterError>
            + Send
            + Sync
            + 'static,
    {
        self.rebroadcast.add_record_filter(types, filter);
    }

    pub fn add_send_aggregate_filter<F>(&mut self, filter: F)
    where
        F: Fn(
                &mut BTreeMap<String, Record>,
                &mut TransportContext,
                &mut Variables<'_>,
            ) -> Result<(), FilterError>
            + Send
            + Sync
            + 'static,
    {
        self.send.add_aggregate_filter(filter);
    }

    pub fn add_receive_aggregate_filter<F>(&mut self, filter: F)
    where
        F: Fn(
                &mut BTreeMap<String, Record>,
                &mut TransportContext,
                &mut Variables<'_>,
            ) -> Result<(), FilterError>
            + Send
            + Sync
            + 'static,
    {
        self.receive.add_aggregate_filter(filter);
    }

    pub fn add_rebroadcast_aggregate_filter<F>(&mut self, filter: F)
    where
        F: Fn(
                &mut BTreeMap<String, Record>,
                &mut TransportContext,
                &mut Variables<'_>,
            ) -> Result<(), FilterError>
            + Send
            + Sync
            + 'static,
    {
        self.rebroadcast.add_aggregate_filter(filter);
    }

    /// Registers a trait-object record filter on one stage.
    pub fn add_record_filter_arc(
        &mut self,
        operation: Operation,
        types: &[RecordType],
        filter: Arc<dyn RecordFilter>,
    ) {
        if let Some(chain) = self.chain_mut(operation) {
            chain.add_record_filter_arc(types, filter);
        }
    }

    pub fn add_aggregate_filter_arc(&mut self, operation: Operation, filter: Arc<dyn AggregateFilter>) {
        if let Some(chain) = self.chain_mut(operation) {
            chain.add_aggregate_filter_arc(filter);
        }
    }

    /// Removes every filter from one stage.
    pub fn clear_filters(&mut self, operation: Operation) {
        if let Some(chain) = self.chain_mut(operation) {
            *chain = FilterChain::default();
        }
    }

    pub fn add_trusted_peer(&mut self, peer: impl Into<String>) {
        let peer = peer.into();
        self.config.banned_peers.retain(|banned| banned != &peer);
        if !self.config.trusted_peers.contains(&peer) {
            self.config.trusted_peers.push(peer);
        }
    }

    pub fn add_banned_peer(&mut self, peer: impl Into<String>) {
        let peer = peer.into();
        self.config.trusted_peers.retain(|trusted| trusted != &peer);
        if !self.config.banned_peers.contains(&peer) {
            self.config.banned_peers.push(peer);
        }
    }

    /// Banned peers are never trusted. With no trusted list every other
    /// peer is.
    pub fn is_trusted(&self, peer: &str) -> bool {
        if self.config.banned_peers.iter().any(|banned| banned == peer) {
            return false;
        }
        self.config.trusted_peers.is_empty()
            || self.config.trusted_peers.iter().any(|trusted| trusted == peer)
    }

    fn chain_mut(&mut self, operation: Operation) -> Option<&mut FilterChain> {
        match operation {
            Operation::Send => Some(&mut self.send),
            Operation::Receive => Some(&mut self.receive),
            Operation::Rebroadcast => Some(&mut self.rebroadcast),
            Operation::Idle => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use lore_core::RecordType;

    use super::QosTransportSettings;
    use crate::context::Operation;
    use crate::filters::{FilterOutput, RecordFilter};
    use crate::settings::QosConfig;

    #[test]
    fn trust_follows_lists() {
        let mut qos = QosTransportSettings::default();
        assert!(qos.is_trusted("anyone"));

        qos.add_banned_peer("mallory");
        assert!(!qos.is_trusted("mallory"));
        assert!(qos.is_trusted("alice"));

        qos.add_trusted_peer("alice");
        assert!(qos.is_trusted("alice"));
        assert!(!qos.is_trusted("bob"));

        qos.add_trusted_peer("mallory");
        assert!(qos.is_trusted("mallory"));
        assert!(qos.config.banned_peers.is_empty());
    }

    #[test]
    fn filters_land_on_their_stage() {
        let mut qos = QosTransportSettings::new(QosConfig {
            rebroadcast_ttl: 2,
            ..QosConfig::default()
        });
        qos.add_send_filter(&[RecordType::Integer], |_, _| Ok(FilterOutput::Unchanged));
        qos.add_rebroadcast_aggregate_filter(|_, _, _| Ok(()));

        struct Passthrough;
        impl RecordFilter for Passthrough {
            fn filter(
                &self,
                _: &crate::filters::FilterArgs<'_>,
                _: &mut lore_engine::Variables<'_>,
            ) -> Result<FilterOutput, crate::error::FilterError> {
                Ok(FilterOutput::Unchanged)
            }
        }
        qos.add_record_filter_arc(Operation::Receive, &[RecordType::String], Arc::new(Passthrough));

        assert_eq!(qos.send_filters().record_filter_count(RecordType::Integer), 1);
        assert_eq!(qos.receive_filters().record_filter_count(RecordType::String), 1);
        assert_eq!(qos.rebroadcast_filters().aggregate_filter_count(), 1);
        assert!(qos.chain(Operation::Idle).is_none());

        qos.clear_filters(Operation::Send);
        assert!(qos.send_filters().is_empty());
        assert_eq!(qos.config.rebroadcast_ttl, 2);
    }
}
