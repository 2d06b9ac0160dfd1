use std::sync::Arc;

use async_trait::async_trait;
use kube::{runtime::controller::Action, Client, ResourceExt};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::{handler::BucketHandler, operator::Diagnostics, Error, Metrics};

pub mod bucket;

/// The context passed around
pub struct Context {
    /// Kubernetes client
    pub client: Client,

    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,

    /// Prometheus metrics
    pub metrics: Metrics,

    /// Bucket lifecycle decisions and the backend behind them
    pub handler: BucketHandler,

    /// Fired when the operator shuts down, interrupts long bucket purges
    pub shutdown: CancellationToken,
}

/// A resource that can be reconciled by a controller
#[async_trait]
pub(crate) trait Reconcile
where
    Self: ResourceExt,
{
    /// Attempt to reconcile a resource
    async fn reconcile(&self, context: Arc<Context>) -> Result<Action, Error>;

    /// Release everything the resource owns before it goes away
    async fn cleanup(&self, context: Arc<Context>) -> Result<Action, Error>;
}
