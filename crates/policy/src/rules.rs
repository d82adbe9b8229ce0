use serde::Serialize;
use serde_json::Value as Json;
use tfgate_aws::{ResourceKind, PUBLIC_ACCESS_FLAGS, SSE_KMS, SSE_KMS_DSSE};
use tfgate_core::{first_object, resolve_after_unknown, AfterState, ChangeDocument, ResourceChange};
use thiserror::Error;

use crate::{Policy, PolicyId};

const APPLY_BY_DEFAULT: &str = "apply_server_side_encryption_by_default";

/// Why a policy failed. Each variant points an operator at a different fix.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    #[error("no {resource_type} resource in plan")]
    MissingResource { resource_type: ResourceKind },
    #[error("{address}: block '{block}' missing or malformed")]
    MissingBlock { address: String, block: &'static str },
    #[error("{address}: field '{field}' is absent")]
    MissingField { address: String, field: &'static str },
    #[error("{address}: {field} is {actual}, expected {expected}")]
    WrongValue { address: String, field: &'static str, expected: String, actual: String },
    #[error("{address}: public access not blocked ({})", flags.join(", "))]
    PublicAccessOpen { address: String, flags: Vec<String> },
    #[error("{address}: client_id_list does not contain \"{client_id}\"")]
    MissingClientId { address: String, client_id: String },
    #[error("{address}: role name \"{name}\" does not match /{pattern}/")]
    RoleName { address: String, name: String, pattern: String },
    #[error("{address}: a KMS key is planned but default encryption does not use it")]
    KmsNotReferenced { address: String },
}

type Check = fn(&Policy, &ChangeDocument, &ResourceChange) -> Result<(), Violation>;

/// One entry of the policy table. The subject's first record in the plan is
/// the precondition; its absence fails the rule before `check` runs.
pub struct Rule {
    pub id: PolicyId,
    pub title: &'static str,
    pub subject: ResourceKind,
    check: Check,
}

impl Rule {
    pub(crate) fn run(&self, policy: &Policy, doc: &ChangeDocument) -> (Option<String>, Result<(), Violation>) {
        match doc.first_of_type(self.subject.type_name()) {
            None => (None, Err(Violation::MissingResource { resource_type: self.subject })),
            Some(rc) => (Some(rc.label().to_string()), (self.check)(policy, doc, rc)),
        }
    }
}

/// Evaluation order is the order of this table.
pub static RULES: [Rule; 7] = [
    Rule { id: PolicyId::StorageBucketPresent, title: "storage bucket declared", subject: ResourceKind::S3Bucket, check: present },
    Rule { id: PolicyId::IamRolePresent, title: "IAM role declared", subject: ResourceKind::IamRole, check: present },
    Rule { id: PolicyId::VersioningEnabled, title: "bucket versioning enabled", subject: ResourceKind::BucketVersioning, check: versioning_enabled },
    Rule { id: PolicyId::EncryptionAtRest, title: "server-side encryption configured", subject: ResourceKind::BucketEncryption, check: encryption_at_rest },
    Rule { id: PolicyId::PublicAccessBlocked, title: "public access fully blocked", subject: ResourceKind::PublicAccessBlock, check: public_access_blocked },
    Rule { id: PolicyId::OidcProviderConfigured, title: "GitHub OIDC provider configured", subject: ResourceKind::OidcProvider, check: oidc_provider_configured },
    Rule { id: PolicyId::RoleNaming, title: "IAM role named for OIDC", subject: ResourceKind::IamRole, check: role_naming },
];

fn present(_: &Policy, _: &ChangeDocument, _: &ResourceChange) -> Result<(), Violation> {
    Ok(())
}

fn missing_block(rc: &ResourceChange, block: &'static str) -> Violation {
    Violation::MissingBlock { address: rc.label().to_string(), block }
}

fn string_field<'a>(rc: &ResourceChange, m: &'a AfterState, field: &'static str) -> Result<&'a str, Violation> {
    match m.get(field) {
        None | Some(Json::Null) => Err(Violation::MissingField { address: rc.label().to_string(), field }),
        Some(Json::String(s)) => Ok(s),
        Some(other) => Err(Violation::WrongValue {
            address: rc.label().to_string(),
            field,
            expected: "a string".to_string(),
            actual: other.to_string(),
        }),
    }
}

fn expect_str(rc: &ResourceChange, m: &AfterState, field: &'static str, expected: &str) -> Result<(), Violation> {
    let actual = string_field(rc, m, field)?;
    if actual == expected {
        return Ok(());
    }
    Err(Violation::WrongValue {
        address: rc.label().to_string(),
        field,
        expected: format!("{expected:?}"),
        actual: format!("{actual:?}"),
    })
}

fn versioning_enabled(_: &Policy, _: &ChangeDocument, rc: &ResourceChange) -> Result<(), Violation> {
    let after = rc.after();
    let block = after
        .get("versioning_configuration")
        .and_then(first_object)
        .ok_or_else(|| missing_block(rc, "versioning_configuration"))?;
    expect_str(rc, block, "status", "Enabled")
}

fn default_encryption(after: &AfterState) -> Option<&AfterState> {
    after.get("rule").and_then(first_object)?.get(APPLY_BY_DEFAULT).and_then(first_object)
}

fn encryption_at_rest(policy: &Policy, doc: &ChangeDocument, rc: &ResourceChange) -> Result<(), Violation> {
    let after = rc.after();
    let rule = after.get("rule").and_then(first_object).ok_or_else(|| missing_block(rc, "rule"))?;
    let applied = rule
        .get(APPLY_BY_DEFAULT)
        .and_then(first_object)
        .ok_or_else(|| missing_block(rc, APPLY_BY_DEFAULT))?;
    if doc.first_of_type(ResourceKind::KmsKey.type_name()).is_some() {
        // The provider may leave sse_algorithm out of the plan once a KMS key
        // is referenced, so a planned key stands in for the algorithm.
        if !policy.baseline().encryption.strict_kms {
            return Ok(());
        }
        return kms_referenced(rc, applied);
    }
    expect_str(rc, applied, "sse_algorithm", &policy.baseline().encryption.algorithm)
}

fn kms_referenced(rc: &ResourceChange, applied: &AfterState) -> Result<(), Violation> {
    if matches!(applied.get("sse_algorithm").and_then(Json::as_str), Some(SSE_KMS | SSE_KMS_DSSE)) {
        return Ok(());
    }
    if applied.get("kms_master_key_id").and_then(Json::as_str).is_some_and(|id| !id.is_empty()) {
        return Ok(());
    }
    // key arn of a key created in the same plan is only known after apply
    let unknown = resolve_after_unknown(rc);
    let pending = default_encryption(&unknown).and_then(|a| a.get("kms_master_key_id"));
    if pending == Some(&Json::Bool(true)) {
        return Ok(());
    }
    Err(Violation::KmsNotReferenced { address: rc.label().to_string() })
}

fn public_access_blocked(_: &Policy, _: &ChangeDocument, rc: &ResourceChange) -> Result<(), Violation> {
    let after = rc.after();
    let open: Vec<String> = PUBLIC_ACCESS_FLAGS
        .iter()
        .filter_map(|flag| match after.get(*flag) {
            Some(Json::Bool(true)) => None,
            None | Some(Json::Null) => Some(format!("{flag} absent")),
            Some(v) => Some(format!("{flag}={v}")),
        })
        .collect();
    if open.is_empty() {
        return Ok(());
    }
    Err(Violation::PublicAccessOpen { address: rc.label().to_string(), flags: open })
}

/// Providers store the issuer with or without a scheme.
pub fn normalize_url(url: &str) -> String {
    if url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}

fn oidc_provider_configured(policy: &Policy, _: &ChangeDocument, rc: &ResourceChange) -> Result<(), Violation> {
    let expected = &policy.baseline().oidc;
    let after = rc.after();

    let url = normalize_url(string_field(rc, &after, "url")?);
    if url != expected.url {
        return Err(Violation::WrongValue {
            address: rc.label().to_string(),
            field: "url",
            expected: format!("{:?}", expected.url),
            actual: format!("{url:?}"),
        });
    }

    let ids = match after.get("client_id_list") {
        Some(Json::Array(ids)) => ids,
        None | Some(Json::Null) => {
            return Err(Violation::MissingField { address: rc.label().to_string(), field: "client_id_list" })
        }
        Some(other) => {
            return Err(Violation::WrongValue {
                address: rc.label().to_string(),
                field: "client_id_list",
                expected: "a list".to_string(),
                actual: other.to_string(),
            })
        }
    };
    if ids.iter().any(|id| id.as_str() == Some(expected.client_id.as_str())) {
        return Ok(());
    }
    Err(Violation::MissingClientId { address: rc.label().to_string(), client_id: expected.client_id.clone() })
}

fn role_naming(policy: &Policy, _: &ChangeDocument, rc: &ResourceChange) -> Result<(), Violation> {
    let after = rc.after();
    let name = string_field(rc, &after, "name")?;
    if policy.role_name().is_match(name) {
        return Ok(());
    }
    Err(Violation::RoleName {
        address: rc.label().to_string(),
        name: name.to_string(),
        pattern: policy.role_name().as_str().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Baseline;
    use serde_json::json;

    fn plan(records: Json) -> ChangeDocument {
        ChangeDocument::from_value(json!({ "resource_changes": records })).unwrap()
    }

    fn record(ty: &str, after: Json) -> Json {
        json!({ "address": format!("{ty}.this"), "type": ty, "change": { "actions": ["create"], "after": after } })
    }

    fn check(rule: PolicyId, doc: &ChangeDocument) -> Result<(), Violation> {
        check_with(Policy::default(), rule, doc)
    }

    fn check_with(policy: Policy, rule: PolicyId, doc: &ChangeDocument) -> Result<(), Violation> {
        let rule = RULES.iter().find(|r| r.id == rule).unwrap();
        rule.run(&policy, doc).1
    }

    #[test]
    fn versioning_accepts_object_or_wrapped_block() {
        let doc = plan(json!([record("aws_s3_bucket_versioning", json!({"versioning_configuration": {"status": "Enabled"}}))]));
        assert_eq!(check(PolicyId::VersioningEnabled, &doc), Ok(()));
        let doc = plan(json!([record("aws_s3_bucket_versioning", json!({"versioning_configuration": [{"status": "Enabled"}]}))]));
        assert_eq!(check(PolicyId::VersioningEnabled, &doc), Ok(()));
    }

    #[test]
    fn versioning_suspended_is_a_wrong_value() {
        let doc = plan(json!([record("aws_s3_bucket_versioning", json!({"versioning_configuration": [{"status": "Suspended"}]}))]));
        let err = check(PolicyId::VersioningEnabled, &doc).unwrap_err();
        assert_eq!(err.to_string(), "aws_s3_bucket_versioning.this: status is \"Suspended\", expected \"Enabled\"");
    }

    #[test]
    fn versioning_without_block_or_resource() {
        let doc = plan(json!([record("aws_s3_bucket_versioning", json!({"versioning_configuration": []}))]));
        assert!(matches!(
            check(PolicyId::VersioningEnabled, &doc),
            Err(Violation::MissingBlock { block: "versioning_configuration", .. })
        ));
        let doc = plan(json!([]));
        assert_eq!(
            check(PolicyId::VersioningEnabled, &doc),
            Err(Violation::MissingResource { resource_type: ResourceKind::BucketVersioning })
        );
    }

    fn sse(algorithm: Option<&str>) -> Json {
        let mut applied = json!({});
        if let Some(a) = algorithm {
            applied["sse_algorithm"] = json!(a);
        }
        record(
            "aws_s3_bucket_server_side_encryption_configuration",
            json!({"bucket": "b", "rule": [{"apply_server_side_encryption_by_default": [applied]}]}),
        )
    }

    #[test]
    fn aes256_without_kms_passes_other_algorithms_fail() {
        assert_eq!(check(PolicyId::EncryptionAtRest, &plan(json!([sse(Some("AES256"))]))), Ok(()));
        let err = check(PolicyId::EncryptionAtRest, &plan(json!([sse(Some("AES128"))]))).unwrap_err();
        assert!(matches!(err, Violation::WrongValue { field: "sse_algorithm", .. }), "{err}");
        let err = check(PolicyId::EncryptionAtRest, &plan(json!([sse(None)]))).unwrap_err();
        assert!(matches!(err, Violation::MissingField { field: "sse_algorithm", .. }), "{err}");
    }

    #[test]
    fn planned_kms_key_stands_in_for_the_algorithm() {
        let kms = record("aws_kms_key", json!({"enable_key_rotation": true}));
        assert_eq!(check(PolicyId::EncryptionAtRest, &plan(json!([kms.clone(), sse(None)]))), Ok(()));
        let wrapped_once = record(
            "aws_s3_bucket_server_side_encryption_configuration",
            json!({"rule": {"apply_server_side_encryption_by_default": {"kms_master_key_id": null}}}),
        );
        assert_eq!(check(PolicyId::EncryptionAtRest, &plan(json!([wrapped_once, kms]))), Ok(()));
    }

    #[test]
    fn planned_kms_key_still_needs_the_encryption_blocks() {
        let kms = record("aws_kms_key", json!({"enable_key_rotation": true}));
        let bare = record("aws_s3_bucket_server_side_encryption_configuration", json!({"bucket": "b"}));
        assert!(matches!(
            check(PolicyId::EncryptionAtRest, &plan(json!([bare, kms.clone()]))),
            Err(Violation::MissingBlock { block: "rule", .. })
        ));
        let no_default = record("aws_s3_bucket_server_side_encryption_configuration", json!({"rule": [{"bucket_key_enabled": true}]}));
        assert!(matches!(
            check(PolicyId::EncryptionAtRest, &plan(json!([kms, no_default]))),
            Err(Violation::MissingBlock { block: "apply_server_side_encryption_by_default", .. })
        ));
    }

    #[test]
    fn missing_rule_block_without_kms() {
        let bare = record("aws_s3_bucket_server_side_encryption_configuration", json!({"rule": "nope"}));
        assert!(matches!(
            check(PolicyId::EncryptionAtRest, &plan(json!([bare]))),
            Err(Violation::MissingBlock { block: "rule", .. })
        ));
    }

    #[test]
    fn strict_kms_requires_the_block_to_reference_kms() {
        let mut baseline = Baseline::default();
        baseline.encryption.strict_kms = true;
        let strict = || Policy::new(baseline.clone()).unwrap();
        let kms = record("aws_kms_key", json!({}));

        let doc = plan(json!([kms.clone(), sse(Some("AES256"))]));
        assert!(matches!(check_with(strict(), PolicyId::EncryptionAtRest, &doc), Err(Violation::KmsNotReferenced { .. })));

        let doc = plan(json!([kms.clone(), sse(Some("aws:kms"))]));
        assert_eq!(check_with(strict(), PolicyId::EncryptionAtRest, &doc), Ok(()));

        let pending = json!({
            "type": "aws_s3_bucket_server_side_encryption_configuration",
            "change": {
                "after": {"rule": [{"apply_server_side_encryption_by_default": [{}]}]},
                "after_unknown": {"rule": [{"apply_server_side_encryption_by_default": [{"kms_master_key_id": true}]}]}
            }
        });
        let doc = plan(json!([kms, pending]));
        assert_eq!(check_with(strict(), PolicyId::EncryptionAtRest, &doc), Ok(()));
    }

    fn pab(ignore_public_acls: Option<bool>) -> Json {
        let mut after = json!({
            "block_public_acls": true,
            "block_public_policy": true,
            "restrict_public_buckets": true
        });
        if let Some(v) = ignore_public_acls {
            after["ignore_public_acls"] = json!(v);
        }
        record("aws_s3_bucket_public_access_block", after)
    }

    #[test]
    fn public_access_requires_all_four_flags() {
        assert_eq!(check(PolicyId::PublicAccessBlocked, &plan(json!([pab(Some(true))]))), Ok(()));

        let err = check(PolicyId::PublicAccessBlocked, &plan(json!([pab(Some(false))]))).unwrap_err();
        assert_eq!(err.to_string(), "aws_s3_bucket_public_access_block.this: public access not blocked (ignore_public_acls=false)");

        let err = check(PolicyId::PublicAccessBlocked, &plan(json!([pab(None)]))).unwrap_err();
        assert!(err.to_string().contains("ignore_public_acls absent"), "{err}");
    }

    #[test]
    fn public_access_flags_must_be_booleans() {
        let rec = record(
            "aws_s3_bucket_public_access_block",
            json!({"block_public_acls": "true", "block_public_policy": true, "ignore_public_acls": true, "restrict_public_buckets": 1}),
        );
        let Err(Violation::PublicAccessOpen { flags, .. }) = check(PolicyId::PublicAccessBlocked, &plan(json!([rec]))) else {
            panic!("expected open flags");
        };
        assert_eq!(flags, vec!["block_public_acls=\"true\"".to_string(), "restrict_public_buckets=1".to_string()]);
    }

    fn oidc(url: &str, ids: Json) -> Json {
        record("aws_iam_openid_connect_provider", json!({"url": url, "client_id_list": ids}))
    }

    #[test]
    fn oidc_url_is_normalized_before_comparison() {
        for url in ["token.actions.githubusercontent.com", "https://token.actions.githubusercontent.com"] {
            let doc = plan(json!([oidc(url, json!(["sts.amazonaws.com"]))]));
            assert_eq!(check(PolicyId::OidcProviderConfigured, &doc), Ok(()), "{url}");
        }
        let doc = plan(json!([oidc("https://wrong.example.com", json!(["sts.amazonaws.com"]))]));
        assert!(matches!(
            check(PolicyId::OidcProviderConfigured, &doc),
            Err(Violation::WrongValue { field: "url", .. })
        ));
    }

    #[test]
    fn oidc_requires_sts_audience() {
        let doc = plan(json!([oidc("token.actions.githubusercontent.com", json!(["example"]))]));
        assert_eq!(
            check(PolicyId::OidcProviderConfigured, &doc),
            Err(Violation::MissingClientId {
                address: "aws_iam_openid_connect_provider.this".to_string(),
                client_id: "sts.amazonaws.com".to_string()
            })
        );
        let rec = record("aws_iam_openid_connect_provider", json!({"url": "token.actions.githubusercontent.com"}));
        assert!(matches!(
            check(PolicyId::OidcProviderConfigured, &plan(json!([rec]))),
            Err(Violation::MissingField { field: "client_id_list", .. })
        ));
    }

    #[test]
    fn role_name_must_mention_oidc() {
        let doc = plan(json!([record("aws_iam_role", json!({"name": "gha-oidc-deploy"}))]));
        assert_eq!(check(PolicyId::RoleNaming, &doc), Ok(()));
        let doc = plan(json!([record("aws_iam_role", json!({"name": "deployer"}))]));
        assert!(matches!(check(PolicyId::RoleNaming, &doc), Err(Violation::RoleName { .. })));
        let doc = plan(json!([record("aws_iam_role", json!({"name_prefix": "oidc-"}))]));
        assert!(matches!(check(PolicyId::RoleNaming, &doc), Err(Violation::MissingField { field: "name", .. })));
    }

    #[test]
    fn first_matching_record_is_inspected() {
        let doc = plan(json!([
            {"address": "aws_iam_role.a", "type": "aws_iam_role", "change": {"after": {"name": "plain"}}},
            {"address": "aws_iam_role.b", "type": "aws_iam_role", "change": {"after": {"name": "oidc"}}}
        ]));
        let rule = RULES.iter().find(|r| r.id == PolicyId::RoleNaming).unwrap();
        let (resource, outcome) = rule.run(&Policy::default(), &doc);
        assert_eq!(resource.as_deref(), Some("aws_iam_role.a"));
        assert!(outcome.is_err());
    }

    #[test]
    fn table_ids_are_unique_and_ordered() {
        let ids: Vec<_> = RULES.iter().map(|r| r.id).collect();
        assert_eq!(ids, PolicyId::ALL);
    }
}
