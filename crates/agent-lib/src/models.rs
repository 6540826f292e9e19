//! Core data models for the batch agent

use crate::error::{ComputationAnomaly, ConfigError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Declared value type of a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Boolean,
    Integer,
    Float,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Boolean => "boolean",
            ValueType::Integer => "integer",
            ValueType::Float => "float",
        };
        f.write_str(name)
    }
}

/// Identifier part of a node id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeIdentifier {
    Numeric(u32),
    String(String),
}

/// Endpoint node id in textual form `ns=<namespace>;i=<number>` or
/// `ns=<namespace>;s=<string>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId {
    pub namespace: u16,
    pub identifier: NodeIdentifier,
}

impl NodeId {
    pub fn numeric(namespace: u16, id: u32) -> Self {
        Self {
            namespace,
            identifier: NodeIdentifier::Numeric(id),
        }
    }

    pub fn string(namespace: u16, id: impl Into<String>) -> Self {
        Self {
            namespace,
            identifier: NodeIdentifier::String(id.into()),
        }
    }
}

impl FromStr for NodeId {
    type Err = ConfigError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidAddress {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let (ns_part, id_part) = input
            .trim()
            .split_once(';')
            .ok_or_else(|| invalid("expected 'ns=<n>;i=<id>' or 'ns=<n>;s=<id>'"))?;

        let namespace = ns_part
            .strip_prefix("ns=")
            .ok_or_else(|| invalid("missing 'ns=' prefix"))?
            .parse::<u16>()
            .map_err(|_| invalid("namespace is not a number"))?;

        let identifier = if let Some(numeric) = id_part.strip_prefix("i=") {
            NodeIdentifier::Numeric(
                numeric
                    .parse()
                    .map_err(|_| invalid("numeric identifier is not a number"))?,
            )
        } else if let Some(string) = id_part.strip_prefix("s=") {
            if string.is_empty() {
                return Err(invalid("string identifier is empty"));
            }
            NodeIdentifier::String(string.to_string())
        } else {
            return Err(invalid("identifier must start with 'i=' or 's='"));
        };

        Ok(Self {
            namespace,
            identifier,
        })
    }
}

impl TryFrom<String> for NodeId {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeId> for String {
    fn from(node: NodeId) -> Self {
        node.to_string()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identifier {
            NodeIdentifier::Numeric(id) => write!(f, "ns={};i={}", self.namespace, id),
            NodeIdentifier::String(id) => write!(f, "ns={};s={}", self.namespace, id),
        }
    }
}

/// A typed signal on the endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalAddress {
    pub node: NodeId,
    #[serde(rename = "type")]
    pub value_type: ValueType,
}

impl SignalAddress {
    pub fn new(node: NodeId, value_type: ValueType) -> Self {
        Self { node, value_type }
    }

    /// Parse a textual node id and attach a declared type
    pub fn parse(node: &str, value_type: ValueType) -> Result<Self, ConfigError> {
        Ok(Self::new(node.parse()?, value_type))
    }

    pub fn boolean(node: &str) -> Result<Self, ConfigError> {
        Self::parse(node, ValueType::Boolean)
    }
}

impl fmt::Display for SignalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.node.fmt(f)
    }
}

/// Value read from or written to a signal
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl SignalValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            SignalValue::Bool(_) => ValueType::Boolean,
            SignalValue::Int(_) => ValueType::Integer,
            SignalValue::Float(_) => ValueType::Float,
        }
    }

    /// Boolean view; numbers are true when non-zero
    pub fn as_bool(&self) -> bool {
        match *self {
            SignalValue::Bool(b) => b,
            SignalValue::Int(i) => i != 0,
            SignalValue::Float(f) => f != 0.0,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            SignalValue::Bool(b) => {
                if b {
                    1.0
                } else {
                    0.0
                }
            }
            SignalValue::Int(i) => i as f64,
            SignalValue::Float(f) => f,
        }
    }

    /// Convert to the given type, if representable
    pub fn coerce(&self, target: ValueType) -> Option<SignalValue> {
        match (target, *self) {
            (ValueType::Boolean, value) => Some(SignalValue::Bool(value.as_bool())),
            (ValueType::Integer, SignalValue::Bool(b)) => Some(SignalValue::Int(b as i64)),
            (ValueType::Integer, SignalValue::Int(i)) => Some(SignalValue::Int(i)),
            (ValueType::Integer, SignalValue::Float(f)) => {
                let rounded = f.round();
                if rounded.is_finite() && rounded >= i64::MIN as f64 && rounded <= i64::MAX as f64
                {
                    Some(SignalValue::Int(rounded as i64))
                } else {
                    None
                }
            }
            (ValueType::Float, value) => Some(SignalValue::Float(value.as_f64())),
        }
    }

    /// Default value for a freshly declared signal of the given type
    pub fn zero(value_type: ValueType) -> Self {
        match value_type {
            ValueType::Boolean => SignalValue::Bool(false),
            ValueType::Integer => SignalValue::Int(0),
            ValueType::Float => SignalValue::Float(0.0),
        }
    }
}

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalValue::Bool(b) => write!(f, "{}", b),
            SignalValue::Int(i) => write!(f, "{}", i),
            SignalValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// Change notification delivered by a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct DataChange {
    pub address: SignalAddress,
    pub value: SignalValue,
    pub received_at: DateTime<Utc>,
}

/// Transition input for the cycle tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEvent {
    pub timestamp: DateTime<Utc>,
    pub value: bool,
}

impl EdgeEvent {
    pub fn new(timestamp: DateTime<Utc>, value: bool) -> Self {
        Self { timestamp, value }
    }
}

impl From<&DataChange> for EdgeEvent {
    fn from(change: &DataChange) -> Self {
        Self {
            timestamp: change.received_at,
            value: change.value.as_bool(),
        }
    }
}

/// Summary of one completed active period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    /// 1-based position in the tracker's record sequence
    pub sequence: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_secs: f64,
    /// Time between the previous batch end (or tracker start) and this end
    pub interval_secs: f64,
    /// `None` when the record is invalid
    pub predicted_rate: Option<f64>,
    pub anomaly: Option<ComputationAnomaly>,
}

impl CycleRecord {
    pub fn is_valid(&self) -> bool {
        self.predicted_rate.is_some()
    }
}

/// Mean predicted rate over one rolling window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowMean {
    pub size: usize,
    /// Number of valid records the mean was taken over
    pub samples: usize,
    pub mean: Option<f64>,
}

/// Point sample taken by the signal sampler
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalSample {
    pub timestamp: DateTime<Utc>,
    pub value: SignalValue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_numeric_node() {
        let node: NodeId = "ns=4;i=22".parse().unwrap();
        assert_eq!(node, NodeId::numeric(4, 22));
        assert_eq!(node.to_string(), "ns=4;i=22");
    }

    #[test]
    fn test_parse_string_node_keeps_separators() {
        let node: NodeId = "ns=4;s=|var|ECC2100 0.8S 1131.Application.GVL_OPC.aut_mixer"
            .parse()
            .unwrap();
        assert_eq!(node.namespace, 4);
        assert_eq!(
            node.identifier,
            NodeIdentifier::String("|var|ECC2100 0.8S 1131.Application.GVL_OPC.aut_mixer".into())
        );

        let node: NodeId = "ns=3;s=\"Velocity_Jog_left\"".parse().unwrap();
        assert_eq!(node.to_string(), "ns=3;s=\"Velocity_Jog_left\"");
    }

    #[test]
    fn test_parse_invalid_nodes() {
        assert!("i=22".parse::<NodeId>().is_err());
        assert!("ns=x;i=22".parse::<NodeId>().is_err());
        assert!("ns=2;i=abc".parse::<NodeId>().is_err());
        assert!("ns=2;g=abc".parse::<NodeId>().is_err());
        assert!("ns=2;s=".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_signal_address_deserialize() {
        let json = r#"{"node": "ns=2;s=Tags.GECO/MP_Mixer_Run", "type": "boolean"}"#;
        let address: SignalAddress = serde_json::from_str(json).unwrap();
        assert_eq!(address.value_type, ValueType::Boolean);
        assert_eq!(address.node, NodeId::string(2, "Tags.GECO/MP_Mixer_Run"));

        let bad = r#"{"node": "Tags.GECO", "type": "boolean"}"#;
        assert!(serde_json::from_str::<SignalAddress>(bad).is_err());
    }

    #[test]
    fn test_value_coercion() {
        assert_eq!(
            SignalValue::Int(3).coerce(ValueType::Boolean),
            Some(SignalValue::Bool(true))
        );
        assert_eq!(
            SignalValue::Bool(true).coerce(ValueType::Integer),
            Some(SignalValue::Int(1))
        );
        assert_eq!(
            SignalValue::Float(2099.6).coerce(ValueType::Integer),
            Some(SignalValue::Int(2100))
        );
        assert_eq!(SignalValue::Float(f64::NAN).coerce(ValueType::Integer), None);
        assert_eq!(
            SignalValue::Int(51).coerce(ValueType::Float),
            Some(SignalValue::Float(51.0))
        );
    }

    #[test]
    fn test_signal_value_untagged() {
        let values: Vec<SignalValue> = serde_json::from_str("[true, 4200, 2.5]").unwrap();
        assert_eq!(
            values,
            vec![
                SignalValue::Bool(true),
                SignalValue::Int(4200),
                SignalValue::Float(2.5)
            ]
        );
    }

    #[test]
    fn test_edge_event_from_change() {
        let change = DataChange {
            address: SignalAddress::parse("ns=4;i=1", ValueType::Integer).unwrap(),
            value: SignalValue::Int(1),
            received_at: Utc::now(),
        };
        let event = EdgeEvent::from(&change);
        assert!(event.value);
        assert_eq!(event.timestamp, change.received_at);
    }
}
