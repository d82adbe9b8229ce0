//! Security baseline checks over a Terraform change-plan.
//!
//! Every rule in [`RULES`] is evaluated on each run, in table order, and a
//! failing rule never stops the ones after it. The aggregate passes only when
//! no rule fails.

mod baseline;
mod rules;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tfgate_core::ChangeDocument;

pub use baseline::{Baseline, BaselineError, EncryptionBaseline, OidcBaseline};
pub use rules::{normalize_url, Rule, Violation, RULES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyId {
    StorageBucketPresent,
    IamRolePresent,
    VersioningEnabled,
    EncryptionAtRest,
    PublicAccessBlocked,
    OidcProviderConfigured,
    RoleNaming,
}

impl PolicyId {
    pub const ALL: [PolicyId; 7] = [
        PolicyId::StorageBucketPresent,
        PolicyId::IamRolePresent,
        PolicyId::VersioningEnabled,
        PolicyId::EncryptionAtRest,
        PolicyId::PublicAccessBlocked,
        PolicyId::OidcProviderConfigured,
        PolicyId::RoleNaming,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PolicyId::StorageBucketPresent => "storage-bucket-present",
            PolicyId::IamRolePresent => "iam-role-present",
            PolicyId::VersioningEnabled => "versioning-enabled",
            PolicyId::EncryptionAtRest => "encryption-at-rest",
            PolicyId::PublicAccessBlocked => "public-access-blocked",
            PolicyId::OidcProviderConfigured => "oidc-provider-configured",
            PolicyId::RoleNaming => "role-naming",
        }
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pass,
    Fail,
    Skipped,
}

/// Outcome of one rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub id: PolicyId,
    pub title: &'static str,
    pub status: Status,
    /// Address of the record the rule inspected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation: Option<Violation>,
}

impl Verdict {
    pub fn passed(&self) -> bool {
        self.status != Status::Fail
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub passed: bool,
    pub verdicts: Vec<Verdict>,
}

impl Report {
    pub fn failures(&self) -> impl Iterator<Item = &Verdict> {
        self.verdicts.iter().filter(|v| v.status == Status::Fail)
    }

    pub fn verdict(&self, id: PolicyId) -> Option<&Verdict> {
        self.verdicts.iter().find(|v| v.id == id)
    }
}

/// A baseline with its role-name pattern compiled.
#[derive(Debug, Clone)]
pub struct Policy {
    baseline: Baseline,
    role_name: Regex,
}

impl Default for Policy {
    fn default() -> Self {
        let baseline = Baseline::default();
        let role_name = Regex::new(&baseline.role_name_pattern).expect("default role pattern is a literal");
        Self { baseline, role_name }
    }
}

impl Policy {
    pub fn new(mut baseline: Baseline) -> Result<Self, BaselineError> {
        let role_name = Regex::new(&baseline.role_name_pattern)
            .map_err(|source| BaselineError::Pattern { pattern: baseline.role_name_pattern.clone(), source })?;
        baseline.oidc.url = normalize_url(&baseline.oidc.url);
        Ok(Self { baseline, role_name })
    }

    pub fn from_file(path: &Path) -> Result<Self, BaselineError> {
        Self::new(Baseline::from_file(path)?)
    }

    pub fn baseline(&self) -> &Baseline {
        &self.baseline
    }

    pub(crate) fn role_name(&self) -> &Regex {
        &self.role_name
    }

    #[tracing::instrument(skip_all, fields(records = doc.resource_changes().len()))]
    pub fn evaluate(&self, doc: &ChangeDocument) -> Report {
        let mut verdicts = Vec::with_capacity(RULES.len());
        for rule in RULES.iter() {
            if self.baseline.skip.contains(&rule.id) {
                tracing::info!(policy = %rule.id, "policy skipped");
                verdicts.push(Verdict {
                    id: rule.id,
                    title: rule.title,
                    status: Status::Skipped,
                    resource: None,
                    diagnostic: None,
                    violation: None,
                });
                continue;
            }
            let (resource, outcome) = rule.run(self, doc);
            let verdict = match outcome {
                Ok(()) => {
                    tracing::info!(policy = %rule.id, resource = ?resource, "policy passed");
                    Verdict { id: rule.id, title: rule.title, status: Status::Pass, resource, diagnostic: None, violation: None }
                }
                Err(v) => {
                    tracing::warn!(policy = %rule.id, resource = ?resource, diagnostic = %v, "policy failed");
                    Verdict {
                        id: rule.id,
                        title: rule.title,
                        status: Status::Fail,
                        resource,
                        diagnostic: Some(v.to_string()),
                        violation: Some(v),
                    }
                }
            };
            verdicts.push(verdict);
        }
        let passed = verdicts.iter().all(Verdict::passed);
        Report { passed, verdicts }
    }
}
