use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{BucketSpec, BucketStatus};
use crate::policy::PolicyLevel;

/// Specification for a cluster-wide bucket. Identical in shape to [`BucketSpec`].
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    kind = "ClusterBucket",
    group = "storage.objectbucket.dev",
    version = "v1beta1",
    status = "BucketStatus",
    doc = "A bucket in the object storage backend that does not belong to a namespace",
    shortname = "cbkt",
    printcolumn = r#"{ "name": "phase", "type": "string", "description": "bucket phase", "jsonPath": ".status.phase" }"#,
    printcolumn = r#"{ "name": "remote", "type": "string", "description": "name of the bucket in the backend", "jsonPath": ".status.remoteName" }"#,
    printcolumn = r#"{ "name": "url", "type": "string", "description": "address of the bucket", "jsonPath": ".status.url" }"#,
    printcolumn = r#"{ "name": "age", "type": "date", "jsonPath": ".metadata.creationTimestamp" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterBucketSpec {
    /// Region to create the bucket in. Empty uses the backend default.
    #[serde(default)]
    pub region: String,

    /// Anonymous access to the bucket.
    #[serde(default)]
    pub policy: PolicyLevel,
}

impl From<&ClusterBucketSpec> for BucketSpec {
    fn from(spec: &ClusterBucketSpec) -> Self {
        BucketSpec {
            region: spec.region.clone(),
            policy: spec.policy,
        }
    }
}
