//! Best-effort teardown reporting
//!
//! Teardown never stops at the first failure. Each step records an entry and
//! the caller decides what to do with the failures.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Error, Result};

/// Result of one teardown step
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "camelCase")]
pub enum TeardownOutcome {
    /// The resource was removed
    Deleted,
    /// Nothing to remove
    AlreadyAbsent,
    /// Removal failed; the resource may be orphaned
    Failed(String),
}

/// One step of a teardown
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownEntry {
    /// Resource class (e.g. "nat-gateway", "subnet", "role")
    pub resource: String,
    /// Provider id or name
    pub id: String,
    /// What happened
    pub outcome: TeardownOutcome,
}

impl TeardownEntry {
    /// `class/id` label used in logs and errors
    pub fn label(&self) -> String {
        format!("{}/{}", self.resource, self.id)
    }
}

/// Ordered record of every teardown step attempted
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    /// Steps in the order they ran
    pub entries: Vec<TeardownEntry>,
}

impl TeardownReport {
    /// Empty report
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful removal
    pub fn deleted(&mut self, resource: &str, id: impl Into<String>) {
        self.push(resource, id, TeardownOutcome::Deleted);
    }

    /// Record a resource that was already gone
    pub fn absent(&mut self, resource: &str, id: impl Into<String>) {
        self.push(resource, id, TeardownOutcome::AlreadyAbsent);
    }

    /// Record a failed removal and log it
    pub fn failed(&mut self, resource: &str, id: impl Into<String>, reason: impl std::fmt::Display) {
        let id = id.into();
        let reason = reason.to_string();
        warn!(resource = %resource, id = %id, error = %reason, "Teardown step failed, continuing");
        self.push(resource, id, TeardownOutcome::Failed(reason));
    }

    /// Record the result of a delete call, mapping not-found to `AlreadyAbsent`
    pub fn record(&mut self, resource: &str, id: impl Into<String>, result: Result<()>) {
        match result {
            Ok(()) => self.deleted(resource, id),
            Err(Error::NotFound { .. }) => self.absent(resource, id),
            Err(e) => self.failed(resource, id, e),
        }
    }

    fn push(&mut self, resource: &str, id: impl Into<String>, outcome: TeardownOutcome) {
        self.entries.push(TeardownEntry {
            resource: resource.to_string(),
            id: id.into(),
            outcome,
        });
    }

    /// Append another report's entries after this one's
    pub fn extend(&mut self, other: TeardownReport) {
        self.entries.extend(other.entries);
    }

    /// Entries that failed
    pub fn failures(&self) -> impl Iterator<Item = &TeardownEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, TeardownOutcome::Failed(_)))
    }

    /// Whether every step succeeded or found nothing to do
    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }

    /// Resource classes in the order they were first touched
    pub fn resource_order(&self) -> Vec<&str> {
        let mut order: Vec<&str> = Vec::new();
        for entry in &self.entries {
            if order.last() != Some(&entry.resource.as_str()) {
                order.push(&entry.resource);
            }
        }
        order
    }

    /// `Ok` when clean, otherwise a `PartialFailure` naming each failed resource
    pub fn into_result(self, cluster: &str) -> Result<TeardownReport> {
        if self.is_clean() {
            return Ok(self);
        }
        Err(Error::PartialFailure {
            cluster: cluster.to_string(),
            failed: self.failures().map(TeardownEntry::label).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn records_outcomes_in_order() {
        let mut report = TeardownReport::new();
        report.record("nat-gateway", "nat-1", Ok(()));
        report.record(
            "subnet",
            "subnet-1",
            Err(Error::not_found("subnet", "subnet-1")),
        );
        report.record(
            "vpc",
            "vpc-1",
            Err(Error::provider_fatal("aws/ec2", "DeleteVpc", "DependencyViolation")),
        );

        assert_eq!(report.entries[0].outcome, TeardownOutcome::Deleted);
        assert_eq!(report.entries[1].outcome, TeardownOutcome::AlreadyAbsent);
        assert!(matches!(report.entries[2].outcome, TeardownOutcome::Failed(_)));
        assert_eq!(report.resource_order(), vec!["nat-gateway", "subnet", "vpc"]);
        assert!(!report.is_clean());
    }

    #[test]
    fn partial_failure_names_failed_resources() {
        let mut report = TeardownReport::new();
        report.deleted("role", "t1-node-role");
        report.failed("role", "t1-cluster-role", "access denied");

        let err = report.into_result("t1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PartialFailure);
        assert!(err.to_string().contains("role/t1-cluster-role"));
    }

    #[test]
    fn clean_report_is_ok() {
        let mut report = TeardownReport::new();
        report.deleted("vpc", "vpc-1");
        assert!(report.into_result("t1").is_ok());
    }

    #[test]
    fn resource_order_collapses_runs() {
        let mut report = TeardownReport::new();
        report.deleted("subnet", "a");
        report.deleted("subnet", "b");
        report.deleted("security-group", "sg-1");

        let mut other = TeardownReport::new();
        other.deleted("vpc", "vpc-1");
        report.extend(other);

        assert_eq!(report.resource_order(), vec!["subnet", "security-group", "vpc"]);
    }
}
