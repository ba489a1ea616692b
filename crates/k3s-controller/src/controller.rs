//! Entry points invoked for each `K3s` change: the deploy path and the
//! status path.
use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use kube_runtime::controller::{Context, ReconcilerAction};
use tracing::{debug, warn};

use crate::api::K3s;
use crate::apply::Apply;
use crate::desired::{Desired, Generator};
use crate::error::{Error, Result};
use crate::readiness::{ClusterStore, Prober, StatusFields};

/// Delay before a failed cycle is retried.
pub const ERROR_REQUEUE: Duration = Duration::from_secs(10);

/// Wires the generator, prober and apply engine together.
#[derive(Clone)]
pub struct Handler {
    generator: Generator,
    prober: Prober,
    clusters: Arc<dyn ClusterStore>,
    apply: Arc<dyn Apply>,
}

impl Handler {
    pub fn new(
        generator: Generator,
        prober: Prober,
        clusters: Arc<dyn ClusterStore>,
        apply: Arc<dyn Apply>,
    ) -> Self {
        Handler {
            generator,
            prober,
            clusters,
            apply,
        }
    }

    /// Desired child objects and status for `k3s`. Performs no writes.
    pub async fn on_spec_change(&self, k3s: &K3s) -> Result<Desired> {
        self.generator.compute(k3s).await
    }

    /// One deploy cycle: compute the desired set, record the status, then
    /// apply the set.
    ///
    /// The status is written before applying so that a freshly generated
    /// token survives a failed apply. Skipped cycles write and apply nothing.
    #[tracing::instrument(
        level = "debug",
        skip(self, k3s),
        fields(name = %k3s.name(), namespace = ?k3s.namespace())
    )]
    pub async fn sync(&self, k3s: &K3s) -> Result<Desired> {
        let desired = self.on_spec_change(k3s).await?;
        if desired.is_skipped() {
            debug!("Desired state unavailable, keeping existing objects");
            return Ok(desired);
        }

        let mut owner = k3s.clone();
        let fields = StatusFields::Provisioning;
        if fields.patch(&k3s.status_or_default()) != fields.patch(&desired.status) {
            owner.status = Some(desired.status.clone());
            owner = self.clusters.update_status(&owner, fields).await?;
        }
        self.apply.apply(&owner, &desired.objects).await?;
        Ok(desired)
    }

    /// One probe cycle; returns the resource as last written.
    #[tracing::instrument(
        level = "debug",
        skip(self, k3s),
        fields(name = %k3s.name(), namespace = ?k3s.namespace())
    )]
    pub async fn on_status_poll(&self, k3s: K3s) -> Result<K3s> {
        self.prober.check(k3s).await
    }
}

/// Shared state handed to both controllers.
pub struct Data {
    pub handler: Handler,
    pub status_interval: Duration,
    pub call_timeout: Duration,
}

/// Deploy controller reconciler.
pub async fn reconcile_spec(k3s: K3s, ctx: Context<Data>) -> Result<ReconcilerAction> {
    if k3s.metadata.deletion_timestamp.is_some() {
        return Ok(ReconcilerAction {
            requeue_after: None,
        });
    }
    let data = ctx.get_ref();
    tokio::time::timeout(data.call_timeout, data.handler.sync(&k3s))
        .await
        .map_err(|_| Error::Timeout("deploy reconciliation"))??;
    Ok(ReconcilerAction {
        requeue_after: None,
    })
}

/// Status controller reconciler. Requeues every status interval so
/// readiness is re-evaluated even when nothing changes.
pub async fn reconcile_status(k3s: K3s, ctx: Context<Data>) -> Result<ReconcilerAction> {
    if k3s.metadata.deletion_timestamp.is_some() {
        return Ok(ReconcilerAction {
            requeue_after: None,
        });
    }
    let data = ctx.get_ref();
    tokio::time::timeout(data.call_timeout, data.handler.on_status_poll(k3s))
        .await
        .map_err(|_| Error::Timeout("status check"))??;
    Ok(ReconcilerAction {
        requeue_after: Some(data.status_interval),
    })
}

/// Both controllers retry failed cycles after [`ERROR_REQUEUE`].
pub fn error_policy(error: &Error, _ctx: Context<Data>) -> ReconcilerAction {
    warn!(%error, "Reconciliation failed, requeueing");
    ReconcilerAction {
        requeue_after: Some(ERROR_REQUEUE),
    }
}
