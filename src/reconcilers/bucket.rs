use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use kube::{
    api::{Patch, PatchParams},
    runtime::{
        controller::Action,
        events::{Event, EventType, Recorder},
    },
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::{
    handler::EventSink,
    resources::{BucketReason, BucketResource, BucketStatus},
    Error,
};

use super::{Context, Reconcile};

/// Field manager owning the status of bucket resources
pub const FIELD_MANAGER: &str = "bucket-operator";

/// Publishes handler events as Kubernetes events on the bucket resource
pub struct RecorderSink(pub Recorder);

#[async_trait]
impl EventSink for RecorderSink {
    async fn publish(&self, reason: BucketReason, message: String) {
        if let Err(e) = self.0.publish(bucket_event(reason, message)).await {
            warn!(%reason, "Failed to publish event: {e}");
        }
    }
}

fn bucket_event(reason: BucketReason, message: String) -> Event {
    Event {
        type_: if reason.is_failure() {
            EventType::Warning
        } else {
            EventType::Normal
        },
        reason: reason.to_string(),
        note: Some(message),
        action: "Reconciling".into(),
        secondary: None,
    }
}

#[async_trait]
impl<K> Reconcile for K
where
    K: BucketResource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn reconcile(&self, context: Arc<Context>) -> Result<Action, Error> {
        let name = self.name_any();
        info!(
            "Reconciling {} '{}'",
            K::kind(&()),
            self.namespace().map_or(name.clone(), |ns| format!("{ns}/{name}"))
        );

        let previous = self.instance().status;
        if let Some(status) = handle(self, &context).await? {
            // Write the new status, taking ownership of the fields we manage
            let patch = Patch::Apply(json!({
                "apiVersion": K::api_version(&()),
                "kind": K::kind(&()),
                "status": &status,
            }));
            let written = self
                .api(context.client.clone())?
                .patch_status(&name, &PatchParams::apply(FIELD_MANAGER).force(), &patch)
                .await;
            if let Err(e) = written {
                if let Some(remote) = newly_created(&previous, &status) {
                    warn!(
                        remote,
                        "Bucket {remote} was created but could not be recorded on '{name}', it may be orphaned: {e}"
                    );
                }
                return Err(e.into());
            }
        }

        Ok(Action::requeue(context.handler.relist_interval()))
    }

    async fn cleanup(&self, context: Arc<Context>) -> Result<Action, Error> {
        info!("Removing {} '{}'", K::kind(&()), self.name_any());
        handle(self, &context).await?;
        Ok(Action::await_change())
    }
}

/// The backend name a status introduces, which only the status write keeps track of
fn newly_created<'a>(previous: &BucketStatus, next: &'a BucketStatus) -> Option<&'a str> {
    (!next.remote_name.is_empty() && next.remote_name != previous.remote_name)
        .then_some(next.remote_name.as_str())
}

async fn handle<K>(resource: &K, context: &Context) -> Result<Option<BucketStatus>, Error>
where
    K: BucketResource,
{
    let events = RecorderSink(
        context
            .diagnostics
            .read()
            .await
            .recorder(context.client.clone(), resource),
    );

    context
        .handler
        .handle(&resource.instance(), &events, &context.shutdown, Utc::now())
        .await
}
