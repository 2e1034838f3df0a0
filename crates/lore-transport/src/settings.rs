use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Default knowledge domain.
pub const DEFAULT_DOMAIN: &str = "lore";
/// Default maximum encoded packet size in bytes.
pub const DEFAULT_QUEUE_LENGTH: usize = 64_000;

/// Per-transport configuration, read-only once the transport is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Originator id announced on the wire. Empty means the knowledge
    /// base id.
    pub id: String,
    pub domain: String,
    /// Largest encoded packet the transport will emit or accept.
    pub queue_length: usize,
    /// Expression evaluated after every merged inbound batch.
    pub on_data_received_logic: Option<String>,
    /// Background runner period in seconds.
    pub poll_interval_secs: f64,
    pub qos: QosConfig,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            id: String::new(),
            domain: DEFAULT_DOMAIN.to_string(),
            queue_length: DEFAULT_QUEUE_LENGTH,
            on_data_received_logic: None,
            poll_interval_secs: 0.01,
            qos: QosConfig::default(),
        }
    }
}

impl TransportSettings {
    pub fn from_toml_str(raw: &str) -> Result<Self, TransportError> {
        let settings: Self =
            toml::from_str(raw).map_err(|e| TransportError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects durations that cannot be represented.
    pub fn validate(&self) -> Result<(), TransportError> {
        check_secs("poll_interval_secs", self.poll_interval_secs)?;
        check_secs("qos.deadline_secs", self.qos.deadline_secs)
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| TransportError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    pub fn poll_interval(&self) -> Duration {
        secs_to_duration(self.poll_interval_secs)
    }
}

/// Quality-of-service knobs. Zero limits mean unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QosConfig {
    /// Hops stamped on packets this node originates.
    pub rebroadcast_ttl: u8,
    /// Hops this node is willing to relay for others.
    pub participant_ttl: u8,
    /// Bytes per second this node may send.
    pub send_bandwidth_limit: u64,
    /// Bytes per second of send plus receive traffic.
    pub total_bandwidth_limit: u64,
    /// Maximum packet age in seconds. Zero disables the check.
    pub deadline_secs: f64,
    #[serde(deserialize_with = "deserialize_list")]
    pub trusted_peers: Vec<String>,
    #[serde(deserialize_with = "deserialize_list")]
    pub banned_peers: Vec<String>,
    /// Probability in `[0, 1]` of dropping an outbound packet.
    pub drop_rate: f64,
    /// Extra consecutive packets dropped after a probabilistic drop.
    pub drop_burst: u32,
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            rebroadcast_ttl: 0,
            participant_ttl: 0,
            send_bandwidth_limit: 0,
            total_bandwidth_limit: 0,
            deadline_secs: 0.0,
            trusted_peers: Vec::new(),
            banned_peers: Vec::new(),
            drop_rate: 0.0,
            drop_burst: 0,
        }
    }
}

impl QosConfig {
    pub fn deadline(&self) -> Option<Duration> {
        let deadline = secs_to_duration(self.deadline_secs);
        (!deadline.is_zero()).then_some(deadline)
    }
}

/// Non-positive, non-finite and unrepresentable values read as zero.
fn secs_to_duration(secs: f64) -> Duration {
    if secs > 0.0 {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
    } else {
        Duration::ZERO
    }
}

fn check_secs(field: &str, secs: f64) -> Result<(), TransportError> {
    if secs > 0.0 && Duration::try_from_secs_f64(secs).is_err() {
        return Err(TransportError::Config(format!(
            "{field} = {secs} is not a valid duration"
        )));
    }
    Ok(())
}

/// Accepts either a TOML array or a comma/semicolon separated string.
fn deserialize_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ListVisitor;

    impl<'de> Visitor<'de> for ListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or a sequence of strings")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value
                .split([',', ';'])
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect())
        }

        fn visit_seq<S>(self, mut seq: S) -> Result<Self::Value, S::Error>
        where
            S: de::SeqAccess<'de>,
        {
            let mut items = Vec::new();
            while let Some(element) = seq.next_element::<String>()? {
                items.push(element);
            }
            Ok(items)
        }
    }

    deserializer.deserialize_any(ListVisitor)
}
