//! Bucket access policies.
//!
//! A [`PolicyLevel`] is the small declarative grant a user writes in a bucket spec.
//! The backend speaks S3 bucket policy documents instead, so this module encodes a
//! level into a [`PolicyDocument`], decodes whatever the backend hands back, and
//! compares two documents by the grants they express rather than by their layout.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};

use crate::{Error, Result};

/// The only policy language version accepted by S3-compatible backends
pub const POLICY_VERSION: &str = "2012-10-17";

const ARN_PREFIX: &str = "arn:aws:s3:::";

const READ_BUCKET_ACTIONS: &[&str] = &["s3:GetBucketLocation", "s3:ListBucket"];
const READ_OBJECT_ACTIONS: &[&str] = &["s3:GetObject"];
const WRITE_BUCKET_ACTIONS: &[&str] = &["s3:GetBucketLocation", "s3:ListBucketMultipartUploads"];
const WRITE_OBJECT_ACTIONS: &[&str] = &[
    "s3:AbortMultipartUpload",
    "s3:DeleteObject",
    "s3:ListMultipartUploadParts",
    "s3:PutObject",
];

/// Anonymous access granted to a bucket
#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PolicyLevel {
    /// No anonymous access.
    #[default]
    None,

    /// Anonymous users may list the bucket and read objects.
    ReadOnly,

    /// Anonymous users may upload and delete objects.
    WriteOnly,

    /// Both of the above.
    ReadWrite,
}

impl PolicyLevel {
    fn can_read(self) -> bool {
        matches!(self, PolicyLevel::ReadOnly | PolicyLevel::ReadWrite)
    }

    fn can_write(self) -> bool {
        matches!(self, PolicyLevel::WriteOnly | PolicyLevel::ReadWrite)
    }
}

impl Display for PolicyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PolicyLevel::None => "none",
            PolicyLevel::ReadOnly => "readonly",
            PolicyLevel::WriteOnly => "writeonly",
            PolicyLevel::ReadWrite => "readwrite",
        };
        f.write_str(name)
    }
}

/// An S3 bucket policy document
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct PolicyDocument {
    #[serde(rename = "Version", default)]
    pub version: String,

    #[serde(rename = "Statement", default, deserialize_with = "one_or_many")]
    pub statements: Vec<Statement>,
}

/// A single statement of a policy document
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Statement {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sid: String,

    pub effect: String,

    pub principal: Principal,

    #[serde(deserialize_with = "one_or_many")]
    pub action: Vec<String>,

    #[serde(deserialize_with = "one_or_many")]
    pub resource: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<serde_json::Value>,
}

/// Who a statement applies to. Backends render anonymous access either as `"*"`
/// or as `{"AWS": ["*"]}`.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum Principal {
    Wildcard(String),
    Accounts(BTreeMap<String, OneOrMany>),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn values(&self) -> Vec<String> {
        match self {
            OneOrMany::One(v) => vec![v.clone()],
            OneOrMany::Many(vs) => vs.clone(),
        }
    }
}

fn one_or_many<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Helper<T> {
        One(T),
        Many(Vec<T>),
    }

    Ok(match Helper::deserialize(deserializer)? {
        Helper::One(v) => vec![v],
        Helper::Many(vs) => vs,
    })
}

impl Principal {
    fn anyone() -> Self {
        Principal::Accounts(BTreeMap::from([(
            "AWS".to_string(),
            OneOrMany::Many(vec!["*".to_string()]),
        )]))
    }

    /// Flatten into a sorted set, treating `"*"` and `{"AWS": "*"}` as the same principal
    fn canonical(&self) -> String {
        let mut members = BTreeSet::new();
        match self {
            Principal::Wildcard(p) => {
                members.insert(p.clone());
            }
            Principal::Accounts(accounts) => {
                for (kind, ids) in accounts {
                    for id in ids.values() {
                        if kind == "AWS" && id == "*" {
                            members.insert("*".to_string());
                        } else {
                            members.insert(format!("{kind}:{id}"));
                        }
                    }
                }
            }
        }
        members.into_iter().collect::<Vec<_>>().join(",")
    }
}

impl Statement {
    fn allow(actions: &[&str], resource: String) -> Self {
        Statement {
            sid: String::new(),
            effect: "Allow".into(),
            principal: Principal::anyone(),
            action: actions.iter().map(|a| a.to_string()).collect(),
            resource: vec![resource],
            condition: None,
        }
    }
}

/// A single (effect, principal, action, resource, condition) grant
type Grant = (String, String, String, String, String);

impl PolicyDocument {
    /// Serialize the document in the form the backend expects
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::SerializationError)
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Expand every statement into its individual grants so that documents which
    /// group actions or resources differently still compare equal.
    fn grants(&self) -> BTreeSet<Grant> {
        let mut grants = BTreeSet::new();
        for statement in &self.statements {
            let principal = statement.principal.canonical();
            let condition = statement
                .condition
                .as_ref()
                .map(|c| c.to_string())
                .unwrap_or_default();
            for action in &statement.action {
                for resource in &statement.resource {
                    grants.insert((
                        statement.effect.clone(),
                        principal.clone(),
                        action.clone(),
                        resource.clone(),
                        condition.clone(),
                    ));
                }
            }
        }
        grants
    }
}

/// Build the policy document granting exactly what `level` implies on `bucket`
pub fn encode(bucket: &str, level: PolicyLevel) -> PolicyDocument {
    let bucket_arn = format!("{ARN_PREFIX}{bucket}");
    let objects_arn = format!("{ARN_PREFIX}{bucket}/*");

    let mut bucket_actions: Vec<&str> = Vec::new();
    let mut object_actions: Vec<&str> = Vec::new();
    if level.can_read() {
        bucket_actions.extend(READ_BUCKET_ACTIONS);
        object_actions.extend(READ_OBJECT_ACTIONS);
    }
    if level.can_write() {
        bucket_actions.extend(WRITE_BUCKET_ACTIONS);
        object_actions.extend(WRITE_OBJECT_ACTIONS);
    }
    bucket_actions.sort_unstable();
    bucket_actions.dedup();
    object_actions.sort_unstable();

    let mut statements = Vec::new();
    if !bucket_actions.is_empty() {
        statements.push(Statement::allow(&bucket_actions, bucket_arn));
    }
    if !object_actions.is_empty() {
        statements.push(Statement::allow(&object_actions, objects_arn));
    }

    PolicyDocument {
        version: POLICY_VERSION.into(),
        statements,
    }
}

/// Parse a policy as returned by the backend. An empty string means no policy is set.
pub fn decode(raw: &str) -> Result<Option<PolicyDocument>> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(raw).map(Some).map_err(Error::DecodeError)
}

/// Compare two policies by the grants they carry. A missing policy grants nothing,
/// so it is equal to the document encoded for [`PolicyLevel::None`].
pub fn equal(a: Option<&PolicyDocument>, b: Option<&PolicyDocument>) -> bool {
    let grants = |doc: Option<&PolicyDocument>| doc.map(|d| d.grants()).unwrap_or_default();
    grants(a) == grants(b)
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    use super::*;

    const LEVELS: [PolicyLevel; 4] = [
        PolicyLevel::None,
        PolicyLevel::ReadOnly,
        PolicyLevel::WriteOnly,
        PolicyLevel::ReadWrite,
    ];

    #[test]
    fn readonly_wire_format() {
        let doc = encode("assets", PolicyLevel::ReadOnly);
        let value: serde_json::Value = serde_json::from_str(&doc.to_json().unwrap()).unwrap();

        assert_json_eq!(
            value,
            json!({
                "Version": "2012-10-17",
                "Statement": [
                    {
                        "Effect": "Allow",
                        "Principal": { "AWS": ["*"] },
                        "Action": ["s3:GetBucketLocation", "s3:ListBucket"],
                        "Resource": ["arn:aws:s3:::assets"]
                    },
                    {
                        "Effect": "Allow",
                        "Principal": { "AWS": ["*"] },
                        "Action": ["s3:GetObject"],
                        "Resource": ["arn:aws:s3:::assets/*"]
                    }
                ]
            })
        );
    }

    #[test]
    fn none_has_no_statements() {
        let doc = encode("assets", PolicyLevel::None);
        assert!(doc.is_empty());
        assert_eq!(doc.version, POLICY_VERSION);
    }

    #[test]
    fn readwrite_is_union_of_read_and_write() {
        let read = encode("b", PolicyLevel::ReadOnly).grants();
        let write = encode("b", PolicyLevel::WriteOnly).grants();
        let both = encode("b", PolicyLevel::ReadWrite).grants();

        let union: BTreeSet<_> = read.union(&write).cloned().collect();
        assert_eq!(both, union);
    }

    #[test]
    fn every_level_round_trips() {
        for level in LEVELS {
            let encoded = encode("b", level);
            let decoded = decode(&encoded.to_json().unwrap()).unwrap();
            // None encodes to an empty statement list, which still decodes to a document
            assert!(decoded.is_some(), "{level} decoded to nothing");
            assert!(equal(decoded.as_ref(), Some(&encoded)), "{level} changed on round trip");
        }
    }

    #[test]
    fn levels_are_distinct() {
        for a in LEVELS {
            for b in LEVELS {
                let same = equal(Some(&encode("b", a)), Some(&encode("b", b)));
                assert_eq!(same, a == b, "{a} vs {b}");
            }
        }
    }

    #[test]
    fn policies_for_other_buckets_differ() {
        assert!(!equal(
            Some(&encode("a", PolicyLevel::ReadOnly)),
            Some(&encode("b", PolicyLevel::ReadOnly))
        ));
    }

    #[test]
    fn statement_order_and_grouping_are_ignored() {
        let raw = r#"{
            "Version": "2012-10-17",
            "Statement": [
                { "Effect": "Allow", "Principal": "*", "Action": "s3:GetObject", "Resource": "arn:aws:s3:::b/*" },
                { "Effect": "Allow", "Principal": {"AWS": "*"}, "Action": "s3:ListBucket", "Resource": ["arn:aws:s3:::b"] },
                { "Effect": "Allow", "Principal": {"AWS": ["*"]}, "Action": ["s3:GetBucketLocation"], "Resource": "arn:aws:s3:::b" }
            ]
        }"#;
        let decoded = decode(raw).unwrap();
        assert!(equal(decoded.as_ref(), Some(&encode("b", PolicyLevel::ReadOnly))));
    }

    #[test]
    fn empty_policy_decodes_to_nothing() {
        assert_eq!(decode("").unwrap(), None);
        assert_eq!(decode("  \n").unwrap(), None);
    }

    #[test]
    fn unset_policy_equals_none_level() {
        let unset = decode("").unwrap();
        assert!(equal(unset.as_ref(), Some(&encode("b", PolicyLevel::None))));
        assert!(!equal(unset.as_ref(), Some(&encode("b", PolicyLevel::ReadOnly))));
    }

    #[test]
    fn malformed_policy_is_an_error() {
        let err = decode("{\"Version\": ").unwrap_err();
        assert!(matches!(err, Error::DecodeError(_)));
    }

    #[test]
    fn conditions_take_part_in_comparison() {
        let mut restricted = encode("b", PolicyLevel::ReadOnly);
        restricted.statements[0].condition = Some(json!({"IpAddress": {"aws:SourceIp": "10.0.0.0/8"}}));
        assert!(!equal(Some(&restricted), Some(&encode("b", PolicyLevel::ReadOnly))));
    }

    #[test]
    fn level_wire_names() {
        assert_eq!(serde_json::to_value(PolicyLevel::ReadOnly).unwrap(), json!("readonly"));
        assert_eq!(serde_json::to_value(PolicyLevel::None).unwrap(), json!("none"));
        let level: PolicyLevel = serde_json::from_value(json!("readwrite")).unwrap();
        assert_eq!(level, PolicyLevel::ReadWrite);
    }
}
