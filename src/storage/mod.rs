//! Object storage access.
//!
//! [`ObjectStore`] is the thin seam over the backend wire protocol, [`Storage`] is the
//! adapter built on top of it that the lifecycle handler drives through
//! [`BucketStorage`].

use std::{collections::HashSet, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    policy::{self, PolicyLevel},
    Error, ObjectDeletionError, Result,
};

mod s3;
pub use s3::S3Store;

#[cfg(test)]
pub(crate) mod memory;

/// How many generated names to probe before giving up
pub const MAX_NAME_ATTEMPTS: usize = 10;

/// Delay after the first name collision, doubled after each further one
const INITIAL_BACKOFF: Duration = Duration::from_millis(1);

/// Upper bound on keys per bulk delete request
const MAX_DELETE_BATCH: usize = 1000;

/// Concurrent uploads issued by [`Storage::put_objects`]
const UPLOAD_CONCURRENCY: usize = 8;

/// S3 bucket names may not be longer than this
const MAX_BUCKET_NAME_LEN: usize = 63;

/// Primitive operations of an S3-compatible backend
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    async fn make_bucket(&self, bucket: &str, region: &str) -> Result<()>;

    async fn remove_bucket(&self, bucket: &str) -> Result<()>;

    /// Stream every object key below `prefix`, an empty prefix lists the whole bucket
    fn list_objects(&self, bucket: &str, prefix: &str) -> BoxStream<'static, Result<String>>;

    /// Remove `keys` in a single bulk request, returning the keys the backend refused
    async fn remove_objects(
        &self,
        bucket: &str,
        keys: Vec<String>,
    ) -> Result<Vec<ObjectDeletionError>>;

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()>;

    /// The raw policy JSON, or an empty string if the bucket has no policy
    async fn get_bucket_policy(&self, bucket: &str) -> Result<String>;

    async fn set_bucket_policy(&self, bucket: &str, policy: &str) -> Result<()>;

    async fn delete_bucket_policy(&self, bucket: &str) -> Result<()>;
}

/// The bucket operations needed by the lifecycle handler
#[async_trait]
pub trait BucketStorage: Send + Sync {
    /// Allocate a free name derived from `name` and create the bucket, returning its name
    async fn create_bucket(&self, scope: &str, name: &str, region: &str) -> Result<String>;

    async fn bucket_exists(&self, name: &str) -> Result<bool>;

    async fn set_policy(&self, name: &str, level: PolicyLevel) -> Result<()>;

    /// Whether the remote policy of `name` grants exactly `expected`
    async fn compare_policy(&self, name: &str, expected: PolicyLevel) -> Result<bool>;

    /// Purge and remove `name`. Succeeds without side effects if it does not exist.
    async fn delete_bucket(&self, cancel: &CancellationToken, name: &str) -> Result<()>;

    /// The externally reachable address of a bucket
    fn bucket_url(&self, name: &str) -> String;
}

/// Adapter over an [`ObjectStore`], shared by every reconcile
#[derive(Clone)]
pub struct Storage {
    store: Arc<dyn ObjectStore>,
    external_endpoint: String,
}

impl Storage {
    pub fn new(store: Arc<dyn ObjectStore>, external_endpoint: impl Into<String>) -> Self {
        Self {
            store,
            external_endpoint: external_endpoint.into(),
        }
    }

    /// Delete every object below `prefix`.
    ///
    /// Listing runs in its own task and feeds keys through a channel to this task,
    /// which issues the bulk deletes. Per-key failures are collected and reported
    /// together once the channel is drained. Cancelling stops the listing, but
    /// deletes for keys already received still go out.
    pub async fn delete_objects(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
        prefix: &str,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let mut listing = self.store.list_objects(bucket, prefix);
        let cancelled = cancel.clone();

        // The sender lives in the task and is dropped on every exit path
        let producer = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => return Err(Error::Cancelled),
                    next = listing.next() => next,
                };
                match next {
                    Some(Ok(key)) => {
                        if tx.send(key).is_err() {
                            return Ok(());
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Ok(()),
                }
            }
        });

        let mut failures = Vec::new();
        let mut batch = Vec::new();
        while let Some(key) = rx.recv().await {
            batch.push(key);
            if batch.len() == MAX_DELETE_BATCH {
                failures.extend(self.remove_batch(bucket, std::mem::take(&mut batch)).await);
            }
        }
        if !batch.is_empty() {
            failures.extend(self.remove_batch(bucket, batch).await);
        }

        let listed = producer
            .await
            .map_err(|e| Error::BackendError {
                operation: "list_objects",
                message: e.to_string(),
            })
            .and_then(|listed| listed);

        // Refused keys are reported even when the listing stopped early
        if failures.is_empty() {
            return listed;
        }
        warn!(bucket, failed = failures.len(), "Some objects could not be deleted");
        Err(Error::ObjectDeletionFailure {
            bucket: bucket.to_string(),
            failures,
            interrupted: listed.err().map(Box::new),
        })
    }

    /// A failed request counts as a failure of every key it carried
    async fn remove_batch(&self, bucket: &str, keys: Vec<String>) -> Vec<ObjectDeletionError> {
        debug!(bucket, count = keys.len(), "Removing objects");
        match self.store.remove_objects(bucket, keys.clone()).await {
            Ok(failures) => failures,
            Err(e) => {
                let message = e.to_string();
                keys.into_iter()
                    .map(|key| ObjectDeletionError {
                        key,
                        message: message.clone(),
                    })
                    .collect()
            }
        }
    }

    pub async fn list_objects(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<String>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            keys = self.store.list_objects(bucket, prefix).try_collect::<Vec<_>>() => keys,
        }
    }

    /// Upload `files`, read relative to `base_dir`, as `<prefix>/<file>`
    pub async fn put_objects(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
        prefix: &str,
        base_dir: &Path,
        files: &[String],
    ) -> Result<()> {
        futures::stream::iter(files.iter().map(Ok::<_, Error>))
            .try_for_each_concurrent(UPLOAD_CONCURRENCY, |file| async move {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let body = tokio::fs::read(base_dir.join(file)).await?;
                let key = object_key(prefix, file);
                debug!(bucket, key, size = body.len(), "Uploading object");
                self.store.put_object(bucket, &key, body).await
            })
            .await
    }

    /// Check that every file has been uploaded below `prefix`, using a single listing
    pub async fn contains_all_objects(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
        prefix: &str,
        files: &[String],
    ) -> Result<bool> {
        let keys: HashSet<String> = self
            .list_objects(cancel, bucket, prefix)
            .await?
            .into_iter()
            .collect();

        Ok(files.iter().all(|f| keys.contains(&object_key(prefix, f))))
    }
}

#[async_trait]
impl BucketStorage for Storage {
    async fn create_bucket(&self, scope: &str, name: &str, region: &str) -> Result<String> {
        let mut backoff = INITIAL_BACKOFF;

        for attempt in 1..=MAX_NAME_ATTEMPTS {
            let candidate = generate_name(name, unix_nanos());

            let taken = self
                .store
                .bucket_exists(&candidate)
                .await
                .map_err(|e| creation_failure(&candidate, e))?;

            if !taken {
                self.store
                    .make_bucket(&candidate, region)
                    .await
                    .map_err(|e| creation_failure(&candidate, e))?;

                info!(scope, name, remote = %candidate, region, "Created bucket");
                return Ok(candidate);
            }

            debug!(attempt, candidate, "Bucket name already taken");
            if attempt < MAX_NAME_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }

        Err(Error::NameAllocationExhausted {
            name: name.to_string(),
            attempts: MAX_NAME_ATTEMPTS,
        })
    }

    async fn bucket_exists(&self, name: &str) -> Result<bool> {
        self.store.bucket_exists(name).await
    }

    async fn set_policy(&self, name: &str, level: PolicyLevel) -> Result<()> {
        let document = policy::encode(name, level);
        debug!(bucket = name, %level, "Applying bucket policy");

        // Backends refuse documents without statements, removing the policy is equivalent
        if document.is_empty() {
            self.store.delete_bucket_policy(name).await
        } else {
            self.store.set_bucket_policy(name, &document.to_json()?).await
        }
    }

    async fn compare_policy(&self, name: &str, expected: PolicyLevel) -> Result<bool> {
        let raw = self.store.get_bucket_policy(name).await?;
        let current = policy::decode(&raw)?;

        Ok(policy::equal(
            current.as_ref(),
            Some(&policy::encode(name, expected)),
        ))
    }

    async fn delete_bucket(&self, cancel: &CancellationToken, name: &str) -> Result<()> {
        if !self.store.bucket_exists(name).await? {
            debug!(bucket = name, "Bucket already gone");
            return Ok(());
        }

        self.delete_objects(cancel, name, "").await?;
        self.store.remove_bucket(name).await?;

        info!(bucket = name, "Deleted bucket");
        Ok(())
    }

    fn bucket_url(&self, name: &str) -> String {
        format!("{}/{name}", self.external_endpoint.trim_end_matches('/'))
    }
}

fn creation_failure(name: &str, source: Error) -> Error {
    Error::BucketCreationFailure {
        name: name.to_string(),
        source: Box::new(source),
    }
}

fn object_key(prefix: &str, file: &str) -> String {
    if prefix.is_empty() {
        file.to_string()
    } else {
        format!("{}/{file}", prefix.trim_end_matches('/'))
    }
}

fn unix_nanos() -> u64 {
    let now = Utc::now();
    now.timestamp_nanos_opt()
        .and_then(|n| u64::try_from(n).ok())
        .unwrap_or_default()
}

/// `<name>-<nanos in base 32>`, lower-cased and cut to fit the bucket name limit
pub(crate) fn generate_name(name: &str, nanos: u64) -> String {
    const DIGITS: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

    let mut suffix = Vec::new();
    let mut rest = nanos;
    loop {
        suffix.push(DIGITS[(rest % 32) as usize]);
        rest /= 32;
        if rest == 0 {
            break;
        }
    }
    suffix.reverse();
    let suffix = String::from_utf8_lossy(&suffix);

    let room = MAX_BUCKET_NAME_LEN - 1 - suffix.len();
    let prefix: String = name.to_lowercase().chars().take(room).collect();
    let prefix = prefix.trim_end_matches('-');

    format!("{prefix}-{suffix}")
}
