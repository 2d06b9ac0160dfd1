use std::fmt::Display;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::policy::PolicyLevel;

/// Specification for a bucket in the object storage backend
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    kind = "Bucket",
    group = "storage.objectbucket.dev",
    version = "v1beta1",
    status = "BucketStatus",
    doc = "A bucket in the object storage backend",
    shortname = "bkt",
    namespaced,
    printcolumn = r#"{ "name": "phase", "type": "string", "description": "bucket phase", "jsonPath": ".status.phase" }"#,
    printcolumn = r#"{ "name": "remote", "type": "string", "description": "name of the bucket in the backend", "jsonPath": ".status.remoteName" }"#,
    printcolumn = r#"{ "name": "url", "type": "string", "description": "address of the bucket", "jsonPath": ".status.url" }"#,
    printcolumn = r#"{ "name": "age", "type": "date", "jsonPath": ".metadata.creationTimestamp" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct BucketSpec {
    /// Region to create the bucket in. Empty uses the backend default.
    #[serde(default)]
    pub region: String,

    /// Anonymous access to the bucket.
    #[serde(default)]
    pub policy: PolicyLevel,
}

/// The observed state of a bucket. Only the operator writes this.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BucketStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<BucketPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<BucketReason>,

    /// Human readable explanation of `reason`
    #[serde(default)]
    pub message: String,

    /// Name of the bucket in the backend, empty until it has been created
    #[serde(default)]
    pub remote_name: String,

    /// Externally reachable address of the bucket
    #[serde(default)]
    pub url: String,

    /// The spec generation this status was computed from
    #[serde(default)]
    pub observed_generation: i64,

    pub last_heartbeat_time: DateTime<Utc>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum BucketPhase {
    Ready,
    Failed,
}

/// Why a bucket is in its phase. Also used as the reason of published events.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum BucketReason {
    BucketCreated,
    BucketNotFound,
    BucketCreationFailure,
    BucketVerificationFailure,
    BucketPolicyUpdated,
    BucketPolicyUpdateFailed,
    BucketPolicyVerificationFailed,
    BucketPolicyHasBeenChanged,
    BucketDeletionFailure,
}

impl BucketReason {
    pub const ALL: [BucketReason; 9] = [
        BucketReason::BucketCreated,
        BucketReason::BucketNotFound,
        BucketReason::BucketCreationFailure,
        BucketReason::BucketVerificationFailure,
        BucketReason::BucketPolicyUpdated,
        BucketReason::BucketPolicyUpdateFailed,
        BucketReason::BucketPolicyVerificationFailed,
        BucketReason::BucketPolicyHasBeenChanged,
        BucketReason::BucketDeletionFailure,
    ];

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            BucketReason::BucketNotFound
                | BucketReason::BucketCreationFailure
                | BucketReason::BucketVerificationFailure
                | BucketReason::BucketPolicyUpdateFailed
                | BucketReason::BucketPolicyVerificationFailed
                | BucketReason::BucketDeletionFailure
        )
    }

    /// Render the message for this reason about `bucket`, with the cause if there is one
    pub fn message(self, bucket: &str, cause: Option<&str>) -> String {
        let cause = cause.unwrap_or("unknown");
        match self {
            BucketReason::BucketCreated => format!("Bucket {bucket} has been created"),
            BucketReason::BucketNotFound => format!("Bucket {bucket} doesn't exist"),
            BucketReason::BucketCreationFailure => {
                format!("Bucket {bucket} couldn't be created due to error {cause}")
            }
            BucketReason::BucketVerificationFailure => {
                format!("Bucket {bucket} couldn't be verified due to error {cause}")
            }
            BucketReason::BucketPolicyUpdated => {
                format!("Policy for bucket {bucket} has been updated")
            }
            BucketReason::BucketPolicyUpdateFailed => {
                format!("Policy for bucket {bucket} couldn't be set due to error {cause}")
            }
            BucketReason::BucketPolicyVerificationFailed => {
                format!("Policy for bucket {bucket} couldn't be verified due to error {cause}")
            }
            BucketReason::BucketPolicyHasBeenChanged => {
                format!("Policy for bucket {bucket} has been changed")
            }
            BucketReason::BucketDeletionFailure => {
                format!("Bucket {bucket} couldn't be deleted due to error {cause}")
            }
        }
    }
}

impl Display for BucketReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
