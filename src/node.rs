//! Node identity and the records persisted in the node registry file.
use std::{fmt, path::PathBuf};

use serde_json::{Map, Value};

use crate::error::BridgeError;

const MAX_ID_LEN: usize = 256;

/// A validated node identifier.
///
/// Only ASCII alphanumerics and `@ . - _` are accepted, so an identifier can
/// be handed to `systemctl`, `schtasks` or `launchctl` as a single argument
/// without any quoting concerns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    pub fn parse(raw: &str) -> Result<Self, BridgeError> {
        let raw = raw.trim();
        if raw.is_empty()
            || raw.len() > MAX_ID_LEN
            || !raw.chars().all(|c| c.is_ascii_alphanumeric() || "@.-_".contains(c))
        {
            return Err(BridgeError::InvalidId(raw.to_string()));
        }
        Ok(NodeId(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The trailing "code" component, e.g. `xray-node-jp.schtasks` → `jp`.
    ///
    /// `suffix` is the backend's unit suffix and is stripped first.
    pub fn code(&self, suffix: &str) -> &str {
        let base = self.0.strip_suffix(suffix).unwrap_or(&self.0);
        base.rsplit('-').next().unwrap_or(base)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a backend needs to act on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTarget {
    pub id: NodeId,
    /// OS-level unit name (service, task or launch agent label).
    pub unit: String,
    /// Per-node worker configuration file.
    pub config_path: PathBuf,
}

/// Result of a status query.
///
/// `Unknown` means the native query itself failed; simple callers treat it
/// as not running but it must not be confused with `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Running,
    Stopped,
    Unknown,
}

impl NodeStatus {
    pub fn code(self) -> i32 {
        match self {
            NodeStatus::Running => 1,
            NodeStatus::Stopped => 0,
            NodeStatus::Unknown => -1,
        }
    }
}

/// One entry of the node registry file, kept exactly as the host wrote it.
pub type NodeRecord = Map<String, Value>;

/// The `name` a record is merged on, if it has a non-empty one.
pub fn record_name(record: &NodeRecord) -> Option<&str> {
    record.get("name").and_then(Value::as_str).filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_injection_and_empty_ids() {
        for bad in ["", "bad;name", "$(evil)", "unit with spaces", "a`b`", "../etc"] {
            assert!(NodeId::parse(bad).is_err(), "{bad} should be rejected");
        }
        assert!(NodeId::parse(&"a".repeat(257)).is_err());
    }

    #[test]
    fn accepts_service_style_ids() {
        let id = NodeId::parse("com.xstream.xray-node-jp").unwrap();
        assert_eq!(id.as_str(), "com.xstream.xray-node-jp");
        assert!(NodeId::parse("ray-node-us.schtasks").is_ok());
        assert!(NodeId::parse("xray@jp_1").is_ok());
    }

    #[test]
    fn code_strips_suffix_then_takes_last_component() {
        let id = NodeId::parse("ray-node-jp.schtasks").unwrap();
        assert_eq!(id.code(".schtasks"), "jp");
        let id = NodeId::parse("xray-node-ca").unwrap();
        assert_eq!(id.code(".service"), "ca");
        let id = NodeId::parse("single").unwrap();
        assert_eq!(id.code(""), "single");
    }

    #[test]
    fn status_codes() {
        assert_eq!(NodeStatus::Running.code(), 1);
        assert_eq!(NodeStatus::Stopped.code(), 0);
        assert_eq!(NodeStatus::Unknown.code(), -1);
    }

    #[test]
    fn record_name_ignores_missing_and_non_string_names() {
        let record = |v: serde_json::Value| v.as_object().unwrap().clone();
        assert_eq!(record_name(&record(json!({"name": "jp", "countryCode": null}))), Some("jp"));
        assert_eq!(record_name(&record(json!({"name": ""}))), None);
        assert_eq!(record_name(&record(json!({"name": 7}))), None);
        assert_eq!(record_name(&record(json!({"serviceName": "xray-node-jp"}))), None);
    }
}
