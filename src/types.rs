//! Shared identifiers and small value types used across components.
//!
//! Cross-component references are always by id ("Ownership"); no
//! component holds a direct handle into another component's state.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable id of a registered `ServiceInstance`. Immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request id for an `ActionRequest`; doubles as its trace id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceId(pub Uuid);

impl TraceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Incident id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IncidentId(pub Uuid);

impl IncidentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for IncidentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IncidentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content-addressed snapshot id (hex-encoded blake3 hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub String);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Id of a proactive `Directive` emitted by the meta loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirectiveId(pub Uuid);

impl DirectiveId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DirectiveId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DirectiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable string id of a registered `Playbook`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlaybookId(pub String);

impl fmt::Display for PlaybookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PlaybookId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Risk classification of a proposed action (see Glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Tier {
    /// Read-only or self-contained idempotent write; auto-approved.
    Tier1 = 1,
    /// User-visible mutation or external side-effect; requires approval unless policy auto-approves.
    Tier2 = 2,
    /// Privileged / irreversible; always requires explicit approval.
    Tier3 = 3,
}

impl Tier {
    pub fn requires_snapshot(self) -> bool {
        self >= Tier::Tier2
    }
}

/// Validates a capability string: non-empty, kebab-case.
pub fn validate_capability(cap: &str) -> Result<(), String> {
    if cap.is_empty() {
        return Err("capability must not be empty".into());
    }
    let valid = cap
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid || cap.starts_with('-') || cap.ends_with('-') || cap.contains("--") {
        return Err(format!("capability '{cap}' must be kebab-case"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_validation() {
        assert!(validate_capability("chat").is_ok());
        assert!(validate_capability("restart-component").is_ok());
        assert!(validate_capability("").is_err());
        assert!(validate_capability("Chat").is_err());
        assert!(validate_capability("-bad").is_err());
        assert!(validate_capability("bad-").is_err());
        assert!(validate_capability("bad--name").is_err());
    }

    #[test]
    fn tier_ordering_and_snapshot_requirement() {
        assert!(Tier::Tier1 < Tier::Tier2);
        assert!(Tier::Tier2 < Tier::Tier3);
        assert!(!Tier::Tier1.requires_snapshot());
        assert!(Tier::Tier2.requires_snapshot());
        assert!(Tier::Tier3.requires_snapshot());
    }
}
