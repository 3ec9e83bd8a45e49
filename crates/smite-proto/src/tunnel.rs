//! Tunnel data model shared by panel and nodes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum accepted length of a tunnel identifier
pub const MAX_TUNNEL_ID_LEN: usize = 128;

/// Supported tunnel technologies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    /// WireGuard peer rendered as a wg-quick configuration
    Wireguard,
    /// Hysteria2 client configuration
    Hysteria2,
    /// Plain TCP port forward run in-process on the node
    Tcp,
}

impl TunnelType {
    pub const ALL: [TunnelType; 3] = [TunnelType::Wireguard, TunnelType::Hysteria2, TunnelType::Tcp];

    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelType::Wireguard => "wireguard",
            TunnelType::Hysteria2 => "hysteria2",
            TunnelType::Tcp => "tcp",
        }
    }
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a tunnel type string names no supported technology
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported tunnel type '{0}'")]
pub struct UnknownTunnelType(pub String);

impl FromStr for TunnelType {
    type Err = UnknownTunnelType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TunnelType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownTunnelType(s.to_string()))
    }
}

/// Returned when a tunnel identifier is empty, too long, or carries characters
/// that are unsafe in file names and interface names
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid tunnel id '{id}': {reason}")]
pub struct InvalidTunnelId {
    pub id: String,
    pub reason: &'static str,
}

/// Check that a tunnel identifier is usable as a registry key and a file name
pub fn validate_tunnel_id(id: &str) -> Result<(), InvalidTunnelId> {
    let reason = if id.is_empty() {
        Some("must not be empty")
    } else if id.len() > MAX_TUNNEL_ID_LEN {
        Some("too long")
    } else if id.starts_with('.') {
        Some("must not start with '.'")
    } else if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        Some("only ASCII letters, digits, '-', '_' and '.' are allowed")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(InvalidTunnelId {
            id: id.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Opaque per-type tunnel configuration
///
/// Always a JSON object. Self-describing formats (the HTTP API) carry it as a
/// nested object; compact formats (the bincode channel codec) carry it as JSON
/// text, since bincode cannot represent arbitrary JSON values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TunnelSpec(Map<String, Value>);

impl TunnelSpec {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// String field, `None` when absent or not a string
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for TunnelSpec {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

impl TryFrom<Value> for TunnelSpec {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(fields) => Ok(Self(fields)),
            other => Err(format!("tunnel spec must be a JSON object, got {}", other)),
        }
    }
}

impl Serialize for TunnelSpec {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            self.0.serialize(serializer)
        } else {
            let text = serde_json::to_string(&self.0).map_err(serde::ser::Error::custom)?;
            serializer.serialize_str(&text)
        }
    }
}

impl<'de> Deserialize<'de> for TunnelSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            Map::<String, Value>::deserialize(deserializer).map(Self)
        } else {
            let text = String::deserialize(deserializer)?;
            serde_json::from_str(&text)
                .map(Self)
                .map_err(serde::de::Error::custom)
        }
    }
}

/// A request to bring a tunnel to the given configuration
///
/// Immutable once accepted; a later intent with the same `tunnel_id`
/// replaces it entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelIntent {
    pub tunnel_id: String,
    pub tunnel_type: TunnelType,
    pub spec: TunnelSpec,
}

impl TunnelIntent {
    /// Build an intent from untrusted parts, rejecting bad ids and unknown types
    pub fn parse(tunnel_id: &str, tunnel_type: &str, spec: TunnelSpec) -> Result<Self, String> {
        validate_tunnel_id(tunnel_id).map_err(|e| e.to_string())?;
        let tunnel_type = tunnel_type.parse().map_err(|e: UnknownTunnelType| e.to_string())?;
        Ok(Self {
            tunnel_id: tunnel_id.to_string(),
            tunnel_type,
            spec,
        })
    }
}

/// Lifecycle of a tunnel on a node
///
/// Within one generation the state only moves forward:
/// `Pending -> Applying -> Active -> Removing -> Removed`, with `Failed`
/// reachable from `Applying`. A new apply starts a new generation at
/// `Pending`, which is how `Failed -> Pending` retries happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Pending,
    Applying,
    Active,
    Removing,
    Removed,
    Failed,
}

impl TunnelState {
    /// Whether `next` is a legal step from `self` within a generation
    pub fn can_transition_to(self, next: TunnelState) -> bool {
        use TunnelState::*;
        matches!(
            (self, next),
            (Pending, Applying)
                | (Applying, Active)
                | (Applying, Failed)
                | (Pending, Removing)
                | (Applying, Removing)
                | (Active, Removing)
                | (Failed, Removing)
                | (Removing, Removed)
        )
    }

    /// States from which a new apply may start a fresh generation
    pub fn can_restart(self) -> bool {
        matches!(
            self,
            TunnelState::Active | TunnelState::Failed | TunnelState::Removed | TunnelState::Pending
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelState::Pending => "pending",
            TunnelState::Applying => "applying",
            TunnelState::Active => "active",
            TunnelState::Removing => "removing",
            TunnelState::Removed => "removed",
            TunnelState::Failed => "failed",
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The registry's view of one tunnel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TunnelRecord {
    pub tunnel_id: String,
    pub tunnel_type: TunnelType,
    pub current_state: TunnelState,
    /// Failure detail from the last operation, if it failed
    pub last_error: Option<String>,
    /// Spec of the accepted intent for the current generation
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub desired_spec: TunnelSpec,
    /// Spec the adapter confirmed; set only once the tunnel became Active
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub applied_spec: Option<TunnelSpec>,
    /// Incremented on every accepted apply; usage counters restart with it
    pub generation: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TunnelRecord {
    pub fn new(intent: &TunnelIntent) -> Self {
        let now = Utc::now();
        Self {
            tunnel_id: intent.tunnel_id.clone(),
            tunnel_type: intent.tunnel_type,
            current_state: TunnelState::Pending,
            last_error: None,
            desired_spec: intent.spec.clone(),
            applied_spec: None,
            generation: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.current_state == TunnelState::Active
    }
}

/// One usage reading for a tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct UsageSample {
    pub tunnel_id: String,
    pub bytes_used: u64,
    pub sampled_at: DateTime<Utc>,
    /// Generation of the tunnel the reading belongs to
    pub generation: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(value: Value) -> TunnelSpec {
        TunnelSpec::try_from(value).unwrap()
    }

    #[test]
    fn test_tunnel_type_parse() {
        assert_eq!("wireguard".parse::<TunnelType>().unwrap(), TunnelType::Wireguard);
        assert_eq!("hysteria2".parse::<TunnelType>().unwrap(), TunnelType::Hysteria2);
        assert_eq!("tcp".parse::<TunnelType>().unwrap(), TunnelType::Tcp);

        for near_miss in ["Hysteria2", " tcp ", "TCP", "WireGuard"] {
            assert!(near_miss.parse::<TunnelType>().is_err(), "{near_miss:?} accepted");
        }

        let err = "bogus".parse::<TunnelType>().unwrap_err();
        assert_eq!(err, UnknownTunnelType("bogus".to_string()));
    }

    #[test]
    fn test_validate_tunnel_id() {
        assert!(validate_tunnel_id("t1").is_ok());
        assert!(validate_tunnel_id("user-42_wg.main").is_ok());

        assert!(validate_tunnel_id("").is_err());
        assert!(validate_tunnel_id("../etc/passwd").is_err());
        assert!(validate_tunnel_id(".hidden").is_err());
        assert!(validate_tunnel_id("a b").is_err());
        assert!(validate_tunnel_id(&"x".repeat(MAX_TUNNEL_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_intent_parse_rejects_unknown_type() {
        let err = TunnelIntent::parse("unknown-type", "bogus", TunnelSpec::default()).unwrap_err();
        assert!(err.contains("unsupported tunnel type"));
    }

    #[test]
    fn test_spec_must_be_object() {
        assert!(TunnelSpec::try_from(json!([1, 2])).is_err());
        assert!(TunnelSpec::try_from(json!("text")).is_err());
        assert!(TunnelSpec::try_from(json!({})).unwrap().is_empty());
    }

    #[test]
    fn test_spec_json_is_nested_object() {
        let s = spec(json!({"endpoint": "1.2.3.4:51820", "keepalive": 25}));
        let encoded = serde_json::to_value(&s).unwrap();
        assert_eq!(encoded, json!({"endpoint": "1.2.3.4:51820", "keepalive": 25}));
        assert_eq!(s.get_str("endpoint"), Some("1.2.3.4:51820"));
        assert_eq!(s.get_u64("keepalive"), Some(25));
    }

    #[test]
    fn test_spec_survives_bincode() {
        let s = spec(json!({"endpoint": "1.2.3.4:51820", "nested": {"a": [1, true, null]}}));
        let bytes = bincode::serialize(&s).unwrap();
        let decoded: TunnelSpec = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, s);
    }

    #[test]
    fn test_state_transitions() {
        use TunnelState::*;
        assert!(Pending.can_transition_to(Applying));
        assert!(Applying.can_transition_to(Active));
        assert!(Applying.can_transition_to(Failed));
        assert!(Active.can_transition_to(Removing));
        assert!(Removing.can_transition_to(Removed));

        assert!(!Active.can_transition_to(Pending));
        assert!(!Removed.can_transition_to(Active));
        assert!(!Failed.can_transition_to(Active));
        assert!(!Removed.can_transition_to(Removing));

        assert!(Failed.can_restart());
        assert!(!Applying.can_restart());
        assert!(!Removing.can_restart());
    }

    #[test]
    fn test_record_serializes_lowercase_state() {
        let intent = TunnelIntent {
            tunnel_id: "t1".to_string(),
            tunnel_type: TunnelType::Wireguard,
            spec: spec(json!({"endpoint": "1.2.3.4:51820"})),
        };
        let record = TunnelRecord::new(&intent);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["current_state"], "pending");
        assert_eq!(value["tunnel_type"], "wireguard");
        assert_eq!(value["desired_spec"]["endpoint"], "1.2.3.4:51820");
        assert_eq!(value["generation"], 1);
    }
}
