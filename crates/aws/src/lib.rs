use serde::Serialize;
use std::fmt;

/// Issuer URL of GitHub Actions' OIDC token service.
pub const GITHUB_ACTIONS_TOKEN_URL: &str = "https://token.actions.githubusercontent.com";
/// Audience AWS STS expects in web-identity tokens.
pub const STS_AUDIENCE: &str = "sts.amazonaws.com";
/// SSE-S3 managed encryption.
pub const SSE_AES256: &str = "AES256";
/// SSE-KMS with a customer or AWS managed key.
pub const SSE_KMS: &str = "aws:kms";
/// Dual-layer SSE-KMS.
pub const SSE_KMS_DSSE: &str = "aws:kms:dsse";

/// AWS resource types the security baseline looks for in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResourceKind {
    #[serde(rename="aws_s3_bucket")]
    S3Bucket,
    #[serde(rename="aws_iam_role")]
    IamRole,
    #[serde(rename="aws_s3_bucket_versioning")]
    BucketVersioning,
    #[serde(rename="aws_s3_bucket_server_side_encryption_configuration")]
    BucketEncryption,
    #[serde(rename="aws_s3_bucket_public_access_block")]
    PublicAccessBlock,
    #[serde(rename="aws_iam_openid_connect_provider")]
    OidcProvider,
    #[serde(rename="aws_kms_key")]
    KmsKey,
}

impl ResourceKind {
    /// Terraform resource type name.
    pub fn type_name(self) -> &'static str {
        match self {
            ResourceKind::S3Bucket => "aws_s3_bucket",
            ResourceKind::IamRole => "aws_iam_role",
            ResourceKind::BucketVersioning => "aws_s3_bucket_versioning",
            ResourceKind::BucketEncryption => "aws_s3_bucket_server_side_encryption_configuration",
            ResourceKind::PublicAccessBlock => "aws_s3_bucket_public_access_block",
            ResourceKind::OidcProvider => "aws_iam_openid_connect_provider",
            ResourceKind::KmsKey => "aws_kms_key",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Public-access-block flags; all four must be true for a locked-down bucket.
pub const PUBLIC_ACCESS_FLAGS: [&str; 4] = [
    "block_public_acls",
    "block_public_policy",
    "ignore_public_acls",
    "restrict_public_buckets",
];
