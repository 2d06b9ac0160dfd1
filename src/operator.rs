use std::{
    collections::hash_map::DefaultHasher,
    fmt::Debug,
    hash::{Hash, Hasher},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use kube::{
    api::ListParams,
    runtime::{
        controller::Action,
        events::{Recorder, Reporter},
        finalizer::{finalizer, Event as Finalizer},
        reflector, watcher, Controller, WatchStreamExt,
    },
    Api, Client, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, field, info, instrument, warn, Span};

use crate::{
    handler::BucketHandler,
    reconcilers::{Context, Reconcile},
    resources::{Bucket, BucketResource, ClusterBucket},
    telemetry, Error, Metrics, Result,
};

pub const BUCKET_FINALIZER: &str = "storage.objectbucket.dev/bucket-protection";

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "bucket-operator".into(),
        }
    }
}
impl Diagnostics {
    pub fn recorder<K: Resource<DynamicType = ()>>(&self, client: Client, resource: &K) -> Recorder {
        Recorder::new(client, self.reporter.clone(), resource.object_ref(&()))
    }
}

/// State shared between the controllers and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
    /// Cancelled once the operator starts shutting down
    shutdown: CancellationToken,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    /// Interrupt in-flight bucket purges
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    // Create a Controller Context that can update State
    pub(crate) fn to_context(
        &self,
        client: Client,
        handler: BucketHandler,
    ) -> Result<Arc<Context>, prometheus::Error> {
        Ok(Arc::new(Context {
            client,
            metrics: Metrics::new()?.register(&self.registry)?,
            diagnostics: self.diagnostics.clone(),
            handler,
            shutdown: self.shutdown.clone(),
        }))
    }
}

/// Runs the controllers for namespaced and cluster-wide buckets
pub struct BucketController {
    state: State,
    handler: BucketHandler,
}

impl BucketController {
    pub fn new(state: State, handler: BucketHandler) -> Self {
        Self { state, handler }
    }

    /// Initialize the controllers and shared state (given the crds are installed)
    pub async fn run(self) -> Result<(), anyhow::Error> {
        // Get a k8s client for communicating with the cluster
        let client = Client::try_default().await?;

        // Create fetchers to our CRDs
        let buckets = Api::<Bucket>::all(client.clone());
        let cluster_buckets = Api::<ClusterBucket>::all(client.clone());

        // Test that we can actually query for our CRDs (a.k.a. they are installed)
        let probe = ListParams::default().limit(1);
        if let Err(e) = buckets.list(&probe).await {
            error!("Bucket CRD is not queryable; {e:?}. Is the CRD installed?");
            info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
            anyhow::bail!("Bucket CRD is not installed");
        }
        if let Err(e) = cluster_buckets.list(&probe).await {
            error!("ClusterBucket CRD is not queryable; {e:?}. Is the CRD installed?");
            info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
            anyhow::bail!("ClusterBucket CRD is not installed");
        }

        let context = self.state.to_context(client, self.handler)?;
        futures::join!(
            run_controller(buckets, context.clone()),
            run_controller(cluster_buckets, context),
        );

        Ok(())
    }
}

/// Watch one kind of bucket until a shutdown signal arrives.
///
/// Only spec and finalizer changes trigger a reconcile, so the status
/// writes of the reconciler itself do not loop back into it.
async fn run_controller<K>(api: Api<K>, context: Arc<Context>)
where
    K: BucketResource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let (reader, writer) = reflector::store();
    let stream = watcher(api, watcher::Config::default().page_size(50).any_semantic())
        .default_backoff()
        .reflect(writer)
        .applied_objects()
        .predicate_filter(spec_or_finalizers::<K>);

    Controller::for_stream(stream, reader)
        .shutdown_on_signal()
        .run(reconcile::<K>, error_policy::<K>, context)
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

fn spec_or_finalizers<K: Resource>(resource: &K) -> Option<u64> {
    let meta = resource.meta();
    let mut hasher = DefaultHasher::new();
    meta.generation.hash(&mut hasher);
    meta.finalizers.hash(&mut hasher);
    Some(hasher.finish())
}

// Error handler for failed reconciliations
fn error_policy<K: BucketResource>(resource: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(resource.as_ref(), error);
    Action::requeue(Duration::from_secs(5))
}

/// Main reconciler for both bucket kinds
#[instrument(skip(ctx, resource), fields(trace_id))]
async fn reconcile<K>(resource: Arc<K>, ctx: Arc<Context>) -> Result<Action>
where
    K: BucketResource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    // Add some tracing for debugging's sake
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", &field::display(&trace_id));

    // Take some metrics to see the average reconcile time
    let _timer = ctx.metrics.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let api = resource.api(ctx.client.clone())?;
    finalizer(&api, BUCKET_FINALIZER, resource, |event| async {
        match event {
            Finalizer::Apply(b) => b.reconcile(ctx.clone()).await,
            Finalizer::Cleanup(b) => b.cleanup(ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}
