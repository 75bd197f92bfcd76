use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a fixed-term investment project.
///
/// Every NAV record, distribution event, milestone and pool row that is
/// scoped to a project carries one of these.
///
/// # Examples
///
/// ```
/// use settlement_core::core::ids::ProjectId;
///
/// let farm = ProjectId::new("PRJ-SOLAR-FARM");
/// let mill = ProjectId::new("PRJ-RICE-MILL");
/// assert_ne!(farm, mill);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProjectId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of a token holder (an investor account).
///
/// Ordering matters: the allocation calculator breaks remainder ties by
/// ascending holder id, so the rounding cent is reproducible from the
/// recorded inputs alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderId(String);

impl HolderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for HolderId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for HolderId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Who performed a state-changing action, as recorded in the audit trail.
///
/// Convention: `admin:<name>` for operator actions, `system:<job>` for
/// batch jobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Actor(String);

impl Actor {
    pub fn new(actor: impl Into<String>) -> Self {
        Self(actor.into())
    }

    pub fn system(job: &str) -> Self {
        Self(format!("system:{}", job))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Actor {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_equality() {
        let a = ProjectId::new("PRJ-1");
        let b = ProjectId::new("PRJ-1");
        let c = ProjectId::new("PRJ-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_holder_ordering() {
        let a = HolderId::new("holder-a");
        let b = HolderId::new("holder-b");
        assert!(a < b);
    }

    #[test]
    fn test_system_actor() {
        assert_eq!(Actor::system("revenue-batch").as_str(), "system:revenue-batch");
    }
}
