use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use k3s_controller::api::{Endpoint, K3s, K3sSpec};
use k3s_controller::apply::Apply;
use k3s_controller::credential::CredentialManager;
use k3s_controller::desired::{ChildObject, Generator, DEFAULT_IMAGE};
use k3s_controller::readiness::{ClusterProbe, ClusterStore, ProbeState, Prober, StatusFields};
use k3s_controller::secret::MemorySecretStore;
use k3s_controller::status;
use k3s_controller::version::VersionResolver;
use k3s_controller::{Error, Handler, Result};

const VERSION: &str = "v1.21.4-k3s1";

/// Channel server stand-in that can be taken offline.
#[derive(Default)]
struct Channels {
    offline: AtomicBool,
    requested: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl VersionResolver for Channels {
    async fn resolve(&self, channel: &str) -> Result<String> {
        self.requested.lock().unwrap().push(channel.to_string());
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::MissingRedirect {
                channel: channel.to_string(),
                status: 503,
            });
        }
        Ok(VERSION.to_string())
    }
}

/// A cluster whose API server can be switched on and off.
#[derive(Default)]
struct Cluster {
    down: AtomicBool,
}

#[async_trait::async_trait]
impl ClusterProbe for Cluster {
    async fn discover(&self, _kubeconfig: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn ping(&self, server: &str) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::PingStatus {
                url: server.to_string(),
                status: 503,
            });
        }
        Ok(())
    }
}

/// Host API stand-in: keeps the latest copy of the resource and every
/// applied set. Status writes merge into the stored copy the way a merge
/// patch does. Applied secrets land in the shared secret store.
#[derive(Default)]
struct Host {
    secrets: Arc<MemorySecretStore>,
    latest: Mutex<Option<K3s>>,
    status_writes: Mutex<usize>,
    applied: Mutex<Vec<Vec<ChildObject>>>,
}

#[async_trait::async_trait]
impl ClusterStore for Host {
    async fn update_status(&self, k3s: &K3s, fields: StatusFields) -> Result<K3s> {
        *self.status_writes.lock().unwrap() += 1;
        let mut latest = self.latest.lock().unwrap();
        let mut stored = latest.clone().unwrap_or_else(|| k3s.clone());
        let mut status = serde_json::to_value(stored.status_or_default()).unwrap();
        let patch = fields.patch(&k3s.status_or_default());
        for (key, value) in patch["status"].as_object().unwrap() {
            status[key.as_str()] = value.clone();
        }
        stored.status = Some(serde_json::from_value(status).unwrap());
        *latest = Some(stored.clone());
        Ok(stored)
    }

    async fn update_endpoint(&self, k3s: &K3s) -> Result<K3s> {
        let mut latest = self.latest.lock().unwrap();
        let mut stored = latest.clone().unwrap_or_else(|| k3s.clone());
        stored.spec.control_plane_endpoint = k3s.spec.control_plane_endpoint.clone();
        *latest = Some(stored.clone());
        Ok(stored)
    }
}

#[async_trait::async_trait]
impl Apply for Host {
    async fn apply(&self, _owner: &K3s, objects: &[ChildObject]) -> Result<()> {
        for object in objects {
            if let ChildObject::Secret(secret) = object {
                self.secrets.put(secret.clone());
            }
        }
        self.applied.lock().unwrap().push(objects.to_vec());
        Ok(())
    }
}

struct Harness {
    channels: Arc<Channels>,
    cluster: Arc<Cluster>,
    host: Arc<Host>,
    handler: Handler,
}

fn harness() -> Harness {
    let secrets = Arc::new(MemorySecretStore::new());
    let channels = Arc::new(Channels::default());
    let cluster = Arc::new(Cluster::default());
    let host = Arc::new(Host {
        secrets: secrets.clone(),
        ..Default::default()
    });
    let generator = Generator::new(
        Arc::new(CredentialManager::new(secrets.clone())),
        channels.clone(),
        DEFAULT_IMAGE,
    );
    let prober = Prober::new(secrets, cluster.clone(), host.clone());
    let handler = Handler::new(generator, prober, host.clone(), host.clone());
    Harness {
        channels,
        cluster,
        host,
        handler,
    }
}

fn new_cluster() -> K3s {
    let mut k3s = K3s::new("c1", K3sSpec::default());
    k3s.metadata.namespace = Some("ns".to_string());
    k3s.metadata.generation = Some(1);
    k3s.metadata.uid = Some("7d7f0c52-5d0b-4b8e-9a57-6d1f0f1a2b3c".to_string());
    k3s
}

/// Runs a deploy cycle and returns the resource as the host now sees it.
async fn deploy(harness: &Harness, k3s: &K3s) -> K3s {
    harness.handler.sync(k3s).await.unwrap();
    harness
        .host
        .latest
        .lock()
        .unwrap()
        .clone()
        .unwrap_or_else(|| k3s.clone())
}

#[tokio::test]
async fn first_deploy_provisions_the_cluster() {
    let harness = harness();
    let k3s = deploy(&harness, &new_cluster()).await;

    let status = k3s.status_or_default();
    assert!(!status.token.is_empty());
    assert_eq!(status.credential_secret_name, "c1-kubeconfig");
    assert_eq!(status.observed_generation, 1);
    assert!(!status.ready);

    let applied = harness.host.applied.lock().unwrap();
    assert_eq!(applied.len(), 1);
    let kinds: Vec<_> = applied[0].iter().map(ChildObject::kind).collect();
    assert_eq!(kinds, vec!["Secret", "Secret", "Service", "Deployment"]);
    assert_eq!(
        *harness.channels.requested.lock().unwrap(),
        vec!["stable".to_string()]
    );
}

#[tokio::test]
async fn unreachable_channel_server_leaves_everything_alone() {
    let harness = harness();
    harness.channels.offline.store(true, Ordering::SeqCst);

    let desired = harness.handler.sync(&new_cluster()).await.unwrap();
    assert!(desired.is_skipped());
    assert!(harness.host.applied.lock().unwrap().is_empty());
    assert_eq!(*harness.host.status_writes.lock().unwrap(), 0);
}

#[tokio::test]
async fn repeated_deploys_are_stable() {
    let harness = harness();
    let first = deploy(&harness, &new_cluster()).await;
    let second = deploy(&harness, &first).await;

    assert_eq!(first.status_or_default().token, second.status_or_default().token);
    assert_eq!(*harness.host.status_writes.lock().unwrap(), 1);

    let applied = harness.host.applied.lock().unwrap();
    assert_eq!(applied.len(), 2);
    assert_eq!(applied[0], applied[1]);
}

#[tokio::test]
async fn readiness_follows_the_cluster() {
    let harness = harness();
    let k3s = deploy(&harness, &new_cluster()).await;
    assert_eq!(ProbeState::of(&k3s), ProbeState::Probing);

    let k3s = harness.handler.on_status_poll(k3s).await.unwrap();
    assert_eq!(ProbeState::of(&k3s), ProbeState::Ready);
    assert_eq!(
        k3s.spec.control_plane_endpoint,
        Some(Endpoint {
            host: "c1.ns".to_string(),
            port: 6443,
        })
    );

    harness.cluster.down.store(true, Ordering::SeqCst);
    let k3s = harness.handler.on_status_poll(k3s).await.unwrap();
    assert_eq!(ProbeState::of(&k3s), ProbeState::NotReady);
    let status = k3s.status_or_default();
    let reconciling = status::condition(&status, status::RECONCILING).unwrap();
    assert_eq!(reconciling.status, "True");
    assert!(reconciling.message.starts_with("status check in-progress: "));

    harness.cluster.down.store(false, Ordering::SeqCst);
    let k3s = harness.handler.on_status_poll(k3s).await.unwrap();
    assert_eq!(ProbeState::of(&k3s), ProbeState::Ready);
}

#[tokio::test]
async fn steady_readiness_is_not_rewritten() {
    let harness = harness();
    let k3s = deploy(&harness, &new_cluster()).await;
    let k3s = harness.handler.on_status_poll(k3s).await.unwrap();
    let writes = *harness.host.status_writes.lock().unwrap();

    let k3s = harness.handler.on_status_poll(k3s).await.unwrap();
    assert!(k3s.status_or_default().ready);
    assert_eq!(*harness.host.status_writes.lock().unwrap(), writes);
}

#[tokio::test]
async fn stale_copies_do_not_roll_back_the_other_writer() {
    let harness = harness();
    let provisioned = deploy(&harness, &new_cluster()).await;
    let ready = harness
        .handler
        .on_status_poll(provisioned.clone())
        .await
        .unwrap();
    assert!(ready.status_or_default().ready);

    // The deploy path still holds the copy from before the cluster was ready.
    let mut stale = provisioned.clone();
    stale.metadata.generation = Some(2);
    let stored = deploy(&harness, &stale).await;
    let status = stored.status_or_default();
    assert_eq!(status.observed_generation, 2);
    assert!(status.ready);
    assert_eq!(ProbeState::of(&stored), ProbeState::Ready);

    // And the readiness loop still holds a copy from before generation 2.
    harness.cluster.down.store(true, Ordering::SeqCst);
    let stored = harness.handler.on_status_poll(ready).await.unwrap();
    let status = stored.status_or_default();
    assert!(!status.ready);
    assert_eq!(status.observed_generation, 2);
    assert_eq!(status.token, provisioned.status_or_default().token);
}
