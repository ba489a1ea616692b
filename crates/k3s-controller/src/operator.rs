//! Runs the deploy and status controllers under the leader lease.
use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::CustomResourceExt;
use kube_runtime::controller::{Context, Controller};
use tracing::{debug, info, warn};

use crate::api::K3s;
use crate::apply::{KubeApply, FIELD_MANAGER, OWNER_LABEL};
use crate::config::Config;
use crate::controller::{error_policy, reconcile_spec, reconcile_status, Data, Handler};
use crate::credential::CredentialManager;
use crate::desired::Generator;
use crate::error::{Error, Result};
use crate::leader::{run_while_leader, Leadership};
use crate::readiness::{KubeClusterStore, LiveProbe, Prober};
use crate::secret::KubeSecretStore;
use crate::version::ChannelResolver;

const CRD_ESTABLISH_ATTEMPTS: usize = 30;

/// Client configuration for the host cluster, honouring `--kubeconfig` and
/// `--context` before falling back to inference.
pub async fn host_config(config: &Config) -> Result<kube::Config> {
    let options = KubeConfigOptions {
        context: config.context.clone(),
        ..Default::default()
    };
    let loaded = match &config.kubeconfig {
        Some(path) => match Kubeconfig::read_from(path) {
            Ok(kubeconfig) => kube::Config::from_custom_kubeconfig(kubeconfig, &options).await,
            Err(e) => return Err(Error::InvalidKubeconfig(e.to_string())),
        },
        None if config.context.is_some() => kube::Config::from_kubeconfig(&options).await,
        None => {
            return kube::Config::infer()
                .await
                .map_err(|e| Error::InvalidKubeconfig(e.to_string()))
        }
    };
    loaded.map_err(|e| Error::InvalidKubeconfig(e.to_string()))
}

/// The operator process: one client, one configuration, two controllers.
pub struct Operator {
    client: kube::Client,
    config: Config,
}

impl Operator {
    pub fn new(client: kube::Client, config: Config) -> Self {
        Operator { client, config }
    }

    /// Handler wired to the Kubernetes API, the release channel server and
    /// live cluster probes.
    pub fn handler(&self) -> Result<Handler> {
        let secrets = Arc::new(KubeSecretStore::new(self.client.clone()));
        let clusters = Arc::new(KubeClusterStore::new(self.client.clone()));
        let generator = Generator::new(
            Arc::new(CredentialManager::new(secrets.clone())),
            Arc::new(ChannelResolver::new(&self.config.channel_server)?),
            &self.config.image,
        );
        let prober = Prober::new(
            secrets,
            Arc::new(LiveProbe::new(LiveProbe::insecure_ping_client()?)),
            clusters.clone(),
        );
        Ok(Handler::new(
            generator,
            prober,
            clusters,
            Arc::new(KubeApply::new(self.client.clone())),
        ))
    }

    /// Applies the `K3s` CRD and waits for it to be served.
    pub async fn register_crd(&self) -> Result<()> {
        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let crd = K3s::crd();
        let name = crd
            .metadata
            .name
            .clone()
            .ok_or(Error::MissingMetadata("CRD name"))?;
        crds.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&crd),
        )
        .await?;

        for _ in 0..CRD_ESTABLISH_ATTEMPTS {
            if established(&crds.get(&name).await?) {
                info!(crd = %name, "Custom resource definition established");
                return Ok(());
            }
            debug!(crd = %name, "Waiting for custom resource definition");
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
        Err(Error::Timeout("CRD registration"))
    }

    /// Registers the CRD, then reconciles while holding the leader lease
    /// until `shutdown` resolves or leadership is lost.
    pub async fn start<S: Future<Output = ()>>(self, shutdown: S) -> Result<()> {
        self.register_crd().await?;
        let context = Context::new(Data {
            handler: self.handler()?,
            status_interval: self.config.status_interval,
            call_timeout: self.config.call_timeout,
        });
        let leadership = Leadership::new(
            self.client.clone(),
            &self.config.namespace,
            &self.config.lease_name,
            &self.config.identity,
        );
        let client = self.client.clone();
        run_while_leader(leadership, shutdown, move || run_controllers(client, context)).await
    }
}

fn established(crd: &CustomResourceDefinition) -> bool {
    crd.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Established" && c.status == "True")
        })
        .unwrap_or(false)
}

async fn run_controllers(client: kube::Client, context: Context<Data>) -> Result<()> {
    let clusters: Api<K3s> = Api::all(client.clone());
    let owned = ListParams::default().labels(OWNER_LABEL);

    let deploy = Controller::new(clusters.clone(), ListParams::default())
        .owns(Api::<Secret>::all(client.clone()), owned.clone())
        .owns(Api::<Service>::all(client.clone()), owned.clone())
        .owns(Api::<Deployment>::all(client), owned)
        .run(reconcile_spec, error_policy, context.clone())
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(?object, "Deployed"),
                Err(error) => warn!(%error, "Deploy cycle failed"),
            }
        });

    let status = Controller::new(clusters, ListParams::default())
        .run(reconcile_status, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(?object, "Checked status"),
                Err(error) => warn!(%error, "Status cycle failed"),
            }
        });

    info!("Starting controllers");
    futures::future::join(deploy, status).await;
    Ok(())
}
