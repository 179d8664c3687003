//! Identifiers minted by the provisioner.
//!
//! Node ids are reserved before any backend resource exists, so they cannot
//! be the provider's instance or job id. Both types are ULID based: sortable
//! by creation time and unique without coordination.

use std::fmt;
use std::str::FromStr;
use std::sync::{LazyLock, Mutex};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use ulid::{Generator, Ulid};

static NODE_IDS: LazyLock<Mutex<Generator>> = LazyLock::new(|| Mutex::new(Generator::new()));

/// Errors from parsing an id string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("expected prefix '{expected}' in '{input}'")]
    WrongPrefix { expected: &'static str, input: String },

    #[error("invalid ULID in '{input}': {reason}")]
    InvalidUlid { input: String, reason: String },
}

/// Registry key of a node: `node_<ulid>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(Ulid);

impl NodeId {
    pub const PREFIX: &'static str = "node";

    /// Mint a node id. Ids minted by this process are strictly increasing.
    #[must_use]
    pub fn new() -> Self {
        Self(crate::lock(&NODE_IDS).generate().unwrap_or_else(|_| Ulid::new()))
    }

    pub fn parse(s: &str) -> Result<Self, IdError> {
        let rest = s
            .strip_prefix(Self::PREFIX)
            .and_then(|r| r.strip_prefix('_'))
            .ok_or_else(|| IdError::WrongPrefix {
                expected: Self::PREFIX,
                input: s.to_string(),
            })?;
        let ulid = Ulid::from_string(rest).map_err(|e| IdError::InvalidUlid {
            input: s.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self(ulid))
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", Self::PREFIX, self.0)
    }
}

impl FromStr for NodeId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Per-run token mixed into remote paths and scheduler job names so that
/// deployments from different runs never collide on a shared host.
///
/// Rendered as lowercase ULID text, which is safe in file names and in
/// scheduler job names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new().to_string().to_lowercase())
    }

    /// Use a caller-chosen token. Only ASCII alphanumerics are kept.
    pub fn from_token(token: &str) -> Self {
        Self(
            token
                .chars()
                .filter(char::is_ascii_alphanumeric)
                .collect::<String>()
                .to_lowercase(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_display_parse() {
        let id = NodeId::new();
        let text = id.to_string();
        assert!(text.starts_with("node_"));
        assert_eq!(text.parse::<NodeId>().unwrap(), id);
    }

    #[test]
    fn test_node_id_wrong_prefix() {
        let err = NodeId::parse("inst_01HV4Z2WQXKJNM8GPQY6VBKC3D").unwrap_err();
        assert!(matches!(err, IdError::WrongPrefix { .. }));
    }

    #[test]
    fn test_node_ids_sort_by_creation() {
        let ids: Vec<NodeId> = (0..64).map(|_| NodeId::new()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_session_id_is_path_safe() {
        let session = SessionId::from_token("Run-42/../x");
        assert_eq!(session.as_str(), "run42x");
        assert!(SessionId::new()
            .as_str()
            .chars()
            .all(|c| c.is_ascii_alphanumeric()));
    }
}
