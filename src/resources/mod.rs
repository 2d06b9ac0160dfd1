use kube::{Api, Client, Resource, ResourceExt};

mod bucket;
mod cluster_bucket;

pub use bucket::*;
pub use cluster_bucket::*;

use crate::{handler::BucketInstance, Error, Result};

/// A custom resource describing a bucket, namespaced or not
pub trait BucketResource: Resource<DynamicType = ()> + ResourceExt {
    /// Snapshot of everything the lifecycle handler looks at
    fn instance(&self) -> BucketInstance;

    /// Handle for writing back to this resource
    fn api(&self, client: Client) -> Result<Api<Self>>
    where
        Self: Sized;
}

fn snapshot<K: Resource>(
    resource: &K,
    spec: BucketSpec,
    status: Option<&BucketStatus>,
) -> BucketInstance {
    let meta = resource.meta();
    BucketInstance {
        name: meta.name.clone().unwrap_or_default(),
        scope: meta.namespace.clone().unwrap_or_default(),
        generation: meta.generation.unwrap_or_default(),
        deleting: meta.deletion_timestamp.is_some(),
        spec,
        status: status.cloned().unwrap_or_default(),
    }
}

impl BucketResource for Bucket {
    fn instance(&self) -> BucketInstance {
        snapshot(self, self.spec.clone(), self.status.as_ref())
    }

    fn api(&self, client: Client) -> Result<Api<Self>> {
        let namespace = self
            .namespace()
            .ok_or_else(|| Error::IllegalBucket(self.name_any(), "missing namespace".into()))?;
        Ok(Api::namespaced(client, &namespace))
    }
}

impl BucketResource for ClusterBucket {
    fn instance(&self) -> BucketInstance {
        snapshot(self, BucketSpec::from(&self.spec), self.status.as_ref())
    }

    fn api(&self, client: Client) -> Result<Api<Self>> {
        Ok(Api::all(client))
    }
}
