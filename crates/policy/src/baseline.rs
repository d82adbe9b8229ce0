use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tfgate_aws::{GITHUB_ACTIONS_TOKEN_URL, SSE_AES256, STS_AUDIENCE};
use thiserror::Error;

use crate::PolicyId;

#[derive(Error, Debug)]
pub enum BaselineError {
    #[error("read baseline {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse baseline: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid role_name_pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Expected values for the security baseline. Every field defaults to the
/// stock GitHub Actions / S3 baseline, so an empty file is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Baseline {
    pub oidc: OidcBaseline,
    /// Regex matched against the role name; a plain word means "contains".
    pub role_name_pattern: String,
    pub encryption: EncryptionBaseline,
    /// Policies reported as skipped instead of evaluated.
    pub skip: Vec<PolicyId>,
}

impl Default for Baseline {
    fn default() -> Self {
        Self {
            oidc: OidcBaseline::default(),
            role_name_pattern: "oidc".to_string(),
            encryption: EncryptionBaseline::default(),
            skip: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OidcBaseline {
    pub url: String,
    pub client_id: String,
}

impl Default for OidcBaseline {
    fn default() -> Self {
        Self { url: GITHUB_ACTIONS_TOKEN_URL.to_string(), client_id: STS_AUDIENCE.to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EncryptionBaseline {
    /// Required `sse_algorithm` when no KMS key is planned.
    pub algorithm: String,
    /// With a KMS key planned, also require the default-encryption block to
    /// reference KMS instead of trusting the key's presence alone.
    pub strict_kms: bool,
}

impl Default for EncryptionBaseline {
    fn default() -> Self {
        Self { algorithm: SSE_AES256.to_string(), strict_kms: false }
    }
}

impl Baseline {
    pub fn from_yaml(text: &str) -> Result<Self, BaselineError> {
        // serde_yaml rejects an empty document; treat it as all defaults
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, BaselineError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| BaselineError::Read { path: path.to_path_buf(), source })?;
        let baseline = Self::from_yaml(&text)?;
        tracing::info!(path = %path.display(), skip = baseline.skip.len(), "baseline loaded");
        Ok(baseline)
    }
}
