use serde::{Deserialize, Serialize};

/// Severity levels for audit entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Authorization changes: never auto-deleted
    Critical,
    #[default]
    Important,
    Noise,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Important => "important",
            Severity::Noise => "noise",
        }
    }
}

/// Entities that can be written to the audit log.
pub trait Loggable: Serialize + Send + Sync {
    /// Prefix of the event name, e.g. "grant" in "grant.added"
    fn entity_type() -> &'static str;

    fn subject_id(&self) -> i64;

    fn severity(&self) -> Severity {
        Severity::Important
    }

    fn severity_for_action(&self, action: &str) -> Severity {
        match action {
            "deleted" | "removed" | "revoked" => Severity::Critical,
            _ => self.severity(),
        }
    }
}
