//! In-memory [`ObjectStore`] for tests, with call recording and failure injection.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use futures::{stream, stream::BoxStream, StreamExt};

use super::ObjectStore;
use crate::{Error, ObjectDeletionError, Result};

#[derive(Default)]
struct RemoteBucket {
    region: String,
    objects: BTreeMap<String, Vec<u8>>,
    policy: String,
}

#[derive(Default)]
struct State {
    buckets: BTreeMap<String, RemoteBucket>,
    calls: Vec<&'static str>,
    failing: HashSet<&'static str>,
    refused_keys: HashSet<String>,
    taken_probes: usize,
    stall_after: Option<usize>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    listings: Arc<()>,
}

const MUTATIONS: &[&str] = &[
    "make_bucket",
    "remove_bucket",
    "remove_objects",
    "put_object",
    "set_bucket_policy",
    "delete_bucket_policy",
];

impl MemoryStore {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Record `op` and fail it if requested
    fn enter(&self, op: &'static str) -> Result<MutexGuard<'_, State>> {
        let mut state = self.lock();
        state.calls.push(op);
        if state.failing.contains(op) {
            return Err(Error::BackendError {
                operation: op,
                message: "injected failure".into(),
            });
        }
        Ok(state)
    }

    pub fn insert_bucket(&self, name: &str, keys: &[&str]) {
        let bucket = RemoteBucket {
            objects: keys.iter().map(|k| (k.to_string(), Vec::new())).collect(),
            ..Default::default()
        };
        self.lock().buckets.insert(name.to_string(), bucket);
    }

    /// Report the next `n` probed names as taken
    pub fn take_first_names(&self, n: usize) {
        self.lock().taken_probes = n;
    }

    pub fn fail(&self, op: &'static str) {
        self.lock().failing.insert(op);
    }

    pub fn refuse_deletion_of(&self, keys: &[&str]) {
        self.lock()
            .refused_keys
            .extend(keys.iter().map(|k| k.to_string()));
    }

    /// Listings yield `n` keys and then never finish
    pub fn stall_listing_after(&self, n: usize) {
        self.lock().stall_after = Some(n);
    }

    pub fn set_raw_policy(&self, bucket: &str, policy: &str) {
        if let Some(b) = self.lock().buckets.get_mut(bucket) {
            b.policy = policy.to_string();
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.lock().calls.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.lock().calls.iter().filter(|c| **c == op).count()
    }

    pub fn mutations(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| MUTATIONS.contains(*c))
            .count()
    }

    pub fn has_bucket(&self, name: &str) -> bool {
        self.lock().buckets.contains_key(name)
    }

    pub fn bucket_region(&self, name: &str) -> Option<String> {
        self.lock().buckets.get(name).map(|b| b.region.clone())
    }

    pub fn object_keys(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .buckets
            .get(bucket)
            .map(|b| b.objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn policy(&self, bucket: &str) -> String {
        self.lock()
            .buckets
            .get(bucket)
            .map(|b| b.policy.clone())
            .unwrap_or_default()
    }

    /// Listing streams that have not been dropped yet
    pub fn open_listings(&self) -> usize {
        Arc::strong_count(&self.listings) - 1
    }
}

fn no_such_bucket(op: &'static str, bucket: &str) -> Error {
    Error::BackendError {
        operation: op,
        message: format!("NoSuchBucket: {bucket}"),
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        let mut state = self.enter("bucket_exists")?;
        if state.taken_probes > 0 {
            state.taken_probes -= 1;
            return Ok(true);
        }
        Ok(state.buckets.contains_key(bucket))
    }

    async fn make_bucket(&self, bucket: &str, region: &str) -> Result<()> {
        let mut state = self.enter("make_bucket")?;
        state.buckets.insert(
            bucket.to_string(),
            RemoteBucket {
                region: region.to_string(),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn remove_bucket(&self, bucket: &str) -> Result<()> {
        let mut state = self.enter("remove_bucket")?;
        state
            .buckets
            .remove(bucket)
            .map(|_| ())
            .ok_or_else(|| no_such_bucket("remove_bucket", bucket))
    }

    fn list_objects(&self, bucket: &str, prefix: &str) -> BoxStream<'static, Result<String>> {
        let state = match self.enter("list_objects") {
            Ok(state) => state,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };
        let Some(remote) = state.buckets.get(bucket) else {
            let err = no_such_bucket("list_objects", bucket);
            return stream::once(async move { Err(err) }).boxed();
        };

        let keys: Vec<String> = remote
            .objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        let tracker = self.listings.clone();
        let items = stream::iter(keys).map(move |key| {
            let _open = &tracker;
            Ok(key)
        });

        match state.stall_after {
            Some(n) => items.take(n).chain(stream::pending()).boxed(),
            None => items.boxed(),
        }
    }

    async fn remove_objects(
        &self,
        bucket: &str,
        keys: Vec<String>,
    ) -> Result<Vec<ObjectDeletionError>> {
        let mut state = self.enter("remove_objects")?;
        let refused = state.refused_keys.clone();
        let remote = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| no_such_bucket("remove_objects", bucket))?;

        let mut failures = Vec::new();
        for key in keys {
            if refused.contains(&key) {
                failures.push(ObjectDeletionError {
                    key,
                    message: "AccessDenied".into(),
                });
            } else {
                remote.objects.remove(&key);
            }
        }
        Ok(failures)
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()> {
        let mut state = self.enter("put_object")?;
        let remote = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| no_such_bucket("put_object", bucket))?;
        remote.objects.insert(key.to_string(), body);
        Ok(())
    }

    async fn get_bucket_policy(&self, bucket: &str) -> Result<String> {
        let state = self.enter("get_bucket_policy")?;
        state
            .buckets
            .get(bucket)
            .map(|b| b.policy.clone())
            .ok_or_else(|| no_such_bucket("get_bucket_policy", bucket))
    }

    async fn set_bucket_policy(&self, bucket: &str, policy: &str) -> Result<()> {
        let mut state = self.enter("set_bucket_policy")?;
        let remote = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| no_such_bucket("set_bucket_policy", bucket))?;
        remote.policy = policy.to_string();
        Ok(())
    }

    async fn delete_bucket_policy(&self, bucket: &str) -> Result<()> {
        let mut state = self.enter("delete_bucket_policy")?;
        let remote = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| no_such_bucket("delete_bucket_policy", bucket))?;
        remote.policy.clear();
        Ok(())
    }
}
