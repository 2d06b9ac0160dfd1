//! The bucket lifecycle state machine.
//!
//! Given a snapshot of a bucket resource and the current time, [`BucketHandler`]
//! decides which of four actions applies, performs it against [`BucketStorage`] and
//! returns the status the caller should persist. It keeps no state between calls.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    resources::{BucketPhase, BucketReason, BucketSpec, BucketStatus},
    storage::BucketStorage,
    Result,
};

/// Everything the handler needs to know about one bucket resource
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BucketInstance {
    pub name: String,

    /// Namespace of the resource, empty for cluster-wide buckets
    pub scope: String,

    pub generation: i64,

    /// Whether the resource has been marked for deletion
    pub deleting: bool,

    pub spec: BucketSpec,
    pub status: BucketStatus,
}

/// Where audit events about a bucket go
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, reason: BucketReason, message: String);
}

/// The action a bucket needs, in priority order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    Delete,
    AddOrUpdate,
    Ready,
    Failed,
}

impl Classification {
    /// Pick the first matching action. `None` means the bucket needs nothing right now.
    pub fn of(instance: &BucketInstance, now: DateTime<Utc>, relist: Duration) -> Option<Self> {
        let status = &instance.status;
        let relist_due = (now - status.last_heartbeat_time)
            .to_std()
            .map(|elapsed| elapsed >= relist)
            .unwrap_or(false);

        [
            (Classification::Delete, instance.deleting),
            (
                Classification::AddOrUpdate,
                status.observed_generation != instance.generation,
            ),
            (
                Classification::Ready,
                status.phase == Some(BucketPhase::Ready) && relist_due,
            ),
            (
                Classification::Failed,
                status.phase == Some(BucketPhase::Failed),
            ),
        ]
        .into_iter()
        .find_map(|(class, matches)| matches.then_some(class))
    }
}

/// Drives buckets towards their spec. One instance is shared by all reconciles.
#[derive(Clone)]
pub struct BucketHandler {
    storage: Arc<dyn BucketStorage>,
    relist_interval: Duration,
}

impl BucketHandler {
    pub fn new(storage: Arc<dyn BucketStorage>, relist_interval: Duration) -> Self {
        Self {
            storage,
            relist_interval,
        }
    }

    pub fn relist_interval(&self) -> Duration {
        self.relist_interval
    }

    /// Act on `instance`, returning the status to persist, if any.
    ///
    /// Errors are only returned from deletion, which must be retried before the
    /// resource may go away. Every other failure is reported through the status.
    pub async fn handle(
        &self,
        instance: &BucketInstance,
        events: &dyn EventSink,
        cancel: &CancellationToken,
        now: DateTime<Utc>,
    ) -> Result<Option<BucketStatus>> {
        let Some(class) = Classification::of(instance, now, self.relist_interval) else {
            debug!(name = %instance.name, "Nothing to do");
            return Ok(None);
        };
        debug!(name = %instance.name, scope = %instance.scope, ?class, "Handling bucket");

        match class {
            Classification::Delete => self.on_delete(instance, events, cancel).await,
            Classification::AddOrUpdate => Ok(Some(self.on_add_or_update(instance, events, now).await)),
            Classification::Ready => Ok(Some(self.on_ready(instance, events, now).await)),
            Classification::Failed => Ok(self.on_failed(instance, events, now).await),
        }
    }

    async fn on_delete(
        &self,
        instance: &BucketInstance,
        events: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<Option<BucketStatus>> {
        let status = &instance.status;
        if status.remote_name.is_empty() || status.reason == Some(BucketReason::BucketNotFound) {
            debug!(name = %instance.name, "No remote bucket to clean up");
            return Ok(None);
        }

        if let Err(e) = self.storage.delete_bucket(cancel, &status.remote_name).await {
            warn!(name = %instance.name, remote = %status.remote_name, "Bucket deletion failed: {e}");
            let cause = e.to_string();
            self.notify(events, BucketReason::BucketDeletionFailure, &status.remote_name, Some(&cause))
                .await;
            return Err(e);
        }

        info!(name = %instance.name, remote = %status.remote_name, "Removed remote bucket");
        Ok(None)
    }

    async fn on_add_or_update(
        &self,
        instance: &BucketInstance,
        events: &dyn EventSink,
        now: DateTime<Utc>,
    ) -> BucketStatus {
        // The bucket already exists, so only its policy can need work
        if !instance.status.remote_name.is_empty() {
            return self.on_ready(instance, events, now).await;
        }

        let remote = match self
            .storage
            .create_bucket(&instance.scope, &instance.name, &instance.spec.region)
            .await
        {
            Ok(remote) => remote,
            Err(e) => {
                let cause = e.to_string();
                return self
                    .fail(instance, events, now, BucketReason::BucketCreationFailure, "", &cause)
                    .await;
            }
        };
        self.notify(events, BucketReason::BucketCreated, &remote, None)
            .await;

        if let Err(e) = self.storage.set_policy(&remote, instance.spec.policy).await {
            // Keep the name so the next pass fixes this bucket instead of creating another
            let cause = e.to_string();
            return self
                .fail(instance, events, now, BucketReason::BucketPolicyUpdateFailed, &remote, &cause)
                .await;
        }

        self.notify(events, BucketReason::BucketPolicyUpdated, &remote, None)
            .await;
        self.status(instance, now, BucketPhase::Ready, BucketReason::BucketPolicyUpdated, &remote, None)
    }

    async fn on_ready(
        &self,
        instance: &BucketInstance,
        events: &dyn EventSink,
        now: DateTime<Utc>,
    ) -> BucketStatus {
        let remote = instance.status.remote_name.as_str();
        let policy = instance.spec.policy;

        let exists = if remote.is_empty() {
            Ok(false)
        } else {
            self.storage.bucket_exists(remote).await
        };
        match exists {
            Ok(true) => {}
            Ok(false) => {
                let name = if remote.is_empty() { &instance.name } else { remote };
                self.notify(events, BucketReason::BucketNotFound, name, None)
                    .await;
                // The bucket is gone, forget it so the next pass creates a new one
                let mut status =
                    self.status(instance, now, BucketPhase::Failed, BucketReason::BucketNotFound, "", None);
                status.message = BucketReason::BucketNotFound.message(name, None);
                return status;
            }
            Err(e) => {
                let cause = e.to_string();
                return self
                    .fail(instance, events, now, BucketReason::BucketVerificationFailure, remote, &cause)
                    .await;
            }
        }

        match self.storage.compare_policy(remote, policy).await {
            Ok(true) => {
                return self.status(instance, now, BucketPhase::Ready, BucketReason::BucketPolicyUpdated, remote, None)
            }
            Ok(false) => {
                self.notify(events, BucketReason::BucketPolicyHasBeenChanged, remote, None)
                    .await;
            }
            Err(e) => {
                let cause = e.to_string();
                return self
                    .fail(instance, events, now, BucketReason::BucketVerificationFailure, remote, &cause)
                    .await;
            }
        }

        if let Err(e) = self.storage.set_policy(remote, policy).await {
            let cause = e.to_string();
            return self
                .fail(instance, events, now, BucketReason::BucketPolicyUpdateFailed, remote, &cause)
                .await;
        }

        self.notify(events, BucketReason::BucketPolicyUpdated, remote, None)
            .await;
        self.status(instance, now, BucketPhase::Ready, BucketReason::BucketPolicyUpdated, remote, None)
    }

    /// Recover according to what failed last time
    async fn on_failed(
        &self,
        instance: &BucketInstance,
        events: &dyn EventSink,
        now: DateTime<Utc>,
    ) -> Option<BucketStatus> {
        match instance.status.reason {
            Some(BucketReason::BucketNotFound | BucketReason::BucketCreationFailure) => {
                Some(self.on_add_or_update(instance, events, now).await)
            }
            Some(BucketReason::BucketVerificationFailure | BucketReason::BucketPolicyUpdateFailed) => {
                Some(self.on_ready(instance, events, now).await)
            }
            reason => {
                debug!(name = %instance.name, ?reason, "No recovery for failed bucket");
                None
            }
        }
    }

    async fn fail(
        &self,
        instance: &BucketInstance,
        events: &dyn EventSink,
        now: DateTime<Utc>,
        reason: BucketReason,
        remote: &str,
        cause: &str,
    ) -> BucketStatus {
        let subject = if remote.is_empty() { &instance.name } else { remote };
        warn!(name = %instance.name, %reason, "{cause}");
        self.notify(events, reason, subject, Some(cause)).await;
        self.status(instance, now, BucketPhase::Failed, reason, remote, Some(cause))
    }

    async fn notify(&self, events: &dyn EventSink, reason: BucketReason, subject: &str, cause: Option<&str>) {
        events.publish(reason, reason.message(subject, cause)).await;
    }

    fn status(
        &self,
        instance: &BucketInstance,
        now: DateTime<Utc>,
        phase: BucketPhase,
        reason: BucketReason,
        remote: &str,
        cause: Option<&str>,
    ) -> BucketStatus {
        let subject = if remote.is_empty() { &instance.name } else { remote };
        BucketStatus {
            phase: Some(phase),
            reason: Some(reason),
            message: reason.message(subject, cause),
            remote_name: remote.to_string(),
            url: if remote.is_empty() {
                String::new()
            } else {
                self.storage.bucket_url(remote)
            },
            observed_generation: instance.generation,
            last_heartbeat_time: now,
        }
    }
}
