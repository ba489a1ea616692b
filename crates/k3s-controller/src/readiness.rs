//! Probes provisioned clusters and records whether they are serving.
//!
//! A cluster is `Unknown` until its credentials exist, then every cycle
//! moves it to `Ready` or `NotReady`. Neither is sticky: each cycle decides
//! afresh from two checks, an authenticated discovery call and an anonymous
//! `GET /ping`.
//!
//! The `/ping` check runs over a client that does not verify server
//! certificates, while discovery trusts the cluster's own CA. The anonymous
//! check happens before the server identity is cross-checked against the
//! discovered endpoint, so the two paths stay separate.
use std::convert::TryFrom;
use std::sync::Arc;

use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use reqwest::StatusCode;
use tracing::{debug, info, warn};
use url::Url;

use crate::api::{Endpoint, K3s, K3sStatus, API_PORT};
use crate::credential::KUBECONFIG_KEY;
use crate::error::{Error, Result};
use crate::kubeconfig;
use crate::secret::{data_bytes, SecretStore};
use crate::status;

/// Where a cluster stands from the prober's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    /// No credentials yet; nothing to probe.
    Unknown,
    /// Credentials exist but no probe result has been recorded.
    Probing,
    Ready,
    NotReady,
}

impl ProbeState {
    /// State recorded on a resource.
    pub fn of(k3s: &K3s) -> Self {
        let status = k3s.status_or_default();
        if status.credential_secret_name.is_empty() {
            ProbeState::Unknown
        } else if status.ready {
            ProbeState::Ready
        } else if status::condition(&status, status::READY).is_some() {
            ProbeState::NotReady
        } else {
            ProbeState::Probing
        }
    }
}

/// The two liveness checks run against a cluster.
#[async_trait::async_trait]
pub trait ClusterProbe: Send + Sync {
    /// Authenticated API discovery using the admin kubeconfig.
    async fn discover(&self, kubeconfig: &[u8]) -> Result<()>;

    /// Anonymous `GET <server>/ping`; only a 200 counts.
    async fn ping(&self, server: &str) -> Result<()>;
}

/// [`ClusterProbe`] talking to real clusters.
#[derive(Clone)]
pub struct LiveProbe {
    ping_client: reqwest::Client,
}

impl LiveProbe {
    /// Uses `ping_client` for the anonymous check only.
    pub fn new(ping_client: reqwest::Client) -> Self {
        LiveProbe { ping_client }
    }

    /// Client for the `/ping` check: no certificate verification, no
    /// redirects. Never use it for authenticated calls.
    pub fn insecure_ping_client() -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()?)
    }
}

#[async_trait::async_trait]
impl ClusterProbe for LiveProbe {
    async fn discover(&self, raw: &[u8]) -> Result<()> {
        let config = kubeconfig::client_config(raw).await?;
        let client = kube::Client::try_from(config)?;
        let info = client.apiserver_version().await?;
        debug!(version = %info.git_version, "Cluster answered discovery");
        Ok(())
    }

    async fn ping(&self, server: &str) -> Result<()> {
        let response = self
            .ping_client
            .get(format!("{}/ping", server.trim_end_matches('/')))
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(Error::PingStatus {
                url: server.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// The part of `status` one writer owns.
///
/// The deploy path and the readiness loop run concurrently on their own
/// copies of the resource. Each patches only its fields, so neither can
/// roll back what the other wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFields {
    /// `token`, `credentialSecretName` and `observedGeneration`.
    Provisioning,
    /// `ready` and `conditions`.
    Readiness,
}

impl StatusFields {
    /// Merge patch body carrying only these fields of `status`.
    pub fn patch(self, status: &K3sStatus) -> serde_json::Value {
        match self {
            StatusFields::Provisioning => serde_json::json!({
                "status": {
                    "token": status.token,
                    "credentialSecretName": status.credential_secret_name,
                    "observedGeneration": status.observed_generation,
                }
            }),
            StatusFields::Readiness => serde_json::json!({
                "status": {
                    "ready": status.ready,
                    "conditions": status.conditions,
                }
            }),
        }
    }
}

/// Writes results back to the `K3s` resource.
#[async_trait::async_trait]
pub trait ClusterStore: Send + Sync {
    /// Persists the `fields` part of `k3s.status`.
    async fn update_status(&self, k3s: &K3s, fields: StatusFields) -> Result<K3s>;

    /// Persists `k3s.spec.controlPlaneEndpoint`.
    async fn update_endpoint(&self, k3s: &K3s) -> Result<K3s>;
}

/// [`ClusterStore`] using merge patches against the API server.
#[derive(Clone)]
pub struct KubeClusterStore {
    client: kube::Client,
}

impl KubeClusterStore {
    pub fn new(client: kube::Client) -> Self {
        KubeClusterStore { client }
    }

    fn api(&self, k3s: &K3s) -> Result<Api<K3s>> {
        let namespace = k3s
            .namespace()
            .ok_or(Error::MissingMetadata("namespace"))?;
        Ok(Api::namespaced(self.client.clone(), &namespace))
    }
}

#[async_trait::async_trait]
impl ClusterStore for KubeClusterStore {
    async fn update_status(&self, k3s: &K3s, fields: StatusFields) -> Result<K3s> {
        let patch = fields.patch(&k3s.status_or_default());
        Ok(self
            .api(k3s)?
            .patch_status(&k3s.name(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn update_endpoint(&self, k3s: &K3s) -> Result<K3s> {
        let patch = serde_json::json!({
            "spec": { "controlPlaneEndpoint": k3s.spec.control_plane_endpoint }
        });
        Ok(self
            .api(k3s)?
            .patch(&k3s.name(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }
}

/// Host and port of the API server at `server`, defaulting to 6443 when
/// the URL carries no port.
pub fn endpoint_from_server(server: &str) -> Result<Endpoint> {
    let url = Url::parse(server)
        .map_err(|e| Error::InvalidKubeconfig(format!("server {}: {}", server, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidKubeconfig(format!("server {} has no host", server)))?;
    Ok(Endpoint {
        host: host.to_string(),
        port: url.port().map(i32::from).unwrap_or(API_PORT),
    })
}

/// Runs probe cycles and records their outcome.
#[derive(Clone)]
pub struct Prober {
    secrets: Arc<dyn SecretStore>,
    probe: Arc<dyn ClusterProbe>,
    clusters: Arc<dyn ClusterStore>,
}

impl Prober {
    pub fn new(
        secrets: Arc<dyn SecretStore>,
        probe: Arc<dyn ClusterProbe>,
        clusters: Arc<dyn ClusterStore>,
    ) -> Self {
        Prober {
            secrets,
            probe,
            clusters,
        }
    }

    /// Runs one probe cycle for `k3s` and returns the resource as last
    /// written.
    ///
    /// Probe failures never surface as errors; they become a `NotReady`
    /// condition. Only failing to persist the outcome is an error.
    pub async fn check(&self, k3s: K3s) -> Result<K3s> {
        if ProbeState::of(&k3s) == ProbeState::Unknown {
            return Ok(k3s);
        }

        let (mut k3s, outcome) = self.probe_cycle(k3s).await?;
        let outcome = outcome.map_err(|e| format!("status check in-progress: {}", e));

        let mut status = k3s.status_or_default();
        let ready = outcome.is_ok();
        let recorded = status::condition(&status, status::READY).is_some();
        if status.ready == ready && recorded {
            return Ok(k3s);
        }

        status.ready = ready;
        match &outcome {
            Ok(()) => {
                info!(name = %k3s.name(), namespace = ?k3s.namespace(), "Cluster is ready");
                status::set_active(&mut status);
            }
            Err(reason) => {
                warn!(name = %k3s.name(), namespace = ?k3s.namespace(), %reason, "Cluster is not ready");
                status::set_transitioning(&mut status, reason);
            }
        }
        k3s.status = Some(status);
        self.clusters
            .update_status(&k3s, StatusFields::Readiness)
            .await
    }

    /// Loads credentials, writes back a moved endpoint, and runs both
    /// checks. The outer error is a persistence failure, the inner one the
    /// first failing check.
    async fn probe_cycle(&self, mut k3s: K3s) -> Result<(K3s, Result<()>)> {
        let raw = match self.kubeconfig(&k3s).await {
            Ok(raw) => raw,
            Err(e) => return Ok((k3s, Err(e))),
        };
        let server = match kubeconfig::server(&raw) {
            Ok(server) => server,
            Err(e) => return Ok((k3s, Err(e))),
        };

        let checks = match self.probe.discover(&raw).await {
            Ok(()) => self.probe.ping(&server).await,
            Err(e) => Err(e),
        };

        match endpoint_from_server(&server) {
            Ok(endpoint) => {
                if k3s.spec.control_plane_endpoint.as_ref() != Some(&endpoint) {
                    debug!(
                        name = %k3s.name(),
                        host = %endpoint.host,
                        port = endpoint.port,
                        "Recording control plane endpoint"
                    );
                    k3s.spec.control_plane_endpoint = Some(endpoint);
                    k3s = self.clusters.update_endpoint(&k3s).await?;
                }
                Ok((k3s, checks))
            }
            Err(e) => Ok((k3s, checks.and(Err(e)))),
        }
    }

    async fn kubeconfig(&self, k3s: &K3s) -> Result<Vec<u8>> {
        let namespace = k3s
            .namespace()
            .ok_or(Error::MissingMetadata("namespace"))?;
        let name = k3s.status_or_default().credential_secret_name;
        let secret = self
            .secrets
            .get(&namespace, &name)
            .await?
            .ok_or_else(|| Error::InvalidSecret {
                namespace: namespace.clone(),
                name: name.clone(),
                reason: "not found".to_string(),
            })?;
        data_bytes(&secret, KUBECONFIG_KEY)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::InvalidSecret {
                namespace,
                name,
                reason: format!("missing key {}", KUBECONFIG_KEY),
            })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::K3sSpec;
    use crate::credential::{CredentialManager, CredentialSource, Identity};
    use crate::secret::MemorySecretStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use warp::Filter;

    #[derive(Default)]
    struct SwitchProbe {
        discovery_down: AtomicBool,
        ping_down: AtomicBool,
    }

    #[async_trait::async_trait]
    impl ClusterProbe for SwitchProbe {
        async fn discover(&self, _kubeconfig: &[u8]) -> Result<()> {
            if self.discovery_down.load(Ordering::SeqCst) {
                return Err(Error::Timeout("discovery"));
            }
            Ok(())
        }

        async fn ping(&self, server: &str) -> Result<()> {
            if self.ping_down.load(Ordering::SeqCst) {
                return Err(Error::PingStatus {
                    url: server.to_string(),
                    status: 503,
                });
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        status_writes: AtomicUsize,
        written_fields: Mutex<Vec<StatusFields>>,
        endpoints: Mutex<Vec<Endpoint>>,
    }

    #[async_trait::async_trait]
    impl ClusterStore for RecordingStore {
        async fn update_status(&self, k3s: &K3s, fields: StatusFields) -> Result<K3s> {
            self.status_writes.fetch_add(1, Ordering::SeqCst);
            self.written_fields.lock().unwrap().push(fields);
            Ok(k3s.clone())
        }

        async fn update_endpoint(&self, k3s: &K3s) -> Result<K3s> {
            if let Some(endpoint) = &k3s.spec.control_plane_endpoint {
                self.endpoints.lock().unwrap().push(endpoint.clone());
            }
            Ok(k3s.clone())
        }
    }

    struct Fixture {
        secrets: Arc<MemorySecretStore>,
        probe: Arc<SwitchProbe>,
        store: Arc<RecordingStore>,
        prober: Prober,
    }

    fn fixture() -> Fixture {
        let secrets = Arc::new(MemorySecretStore::new());
        let probe = Arc::new(SwitchProbe::default());
        let store = Arc::new(RecordingStore::default());
        let prober = Prober::new(secrets.clone(), probe.clone(), store.clone());
        Fixture {
            secrets,
            probe,
            store,
            prober,
        }
    }

    fn k3s_with_secret(name: &str) -> K3s {
        let mut k3s = K3s::new(name, K3sSpec::default());
        k3s.metadata.namespace = Some("ns".to_string());
        k3s.status = Some(K3sStatus {
            credential_secret_name: format!("{}-kubeconfig", name),
            ..Default::default()
        });
        k3s
    }

    /// Stores a CA secret whose kubeconfig points at `server`.
    async fn store_credentials(fixture: &Fixture, name: &str, server: &str) {
        let bundle = CredentialManager::new(fixture.secrets.clone())
            .load_or_create(&Identity::new(name, "ns"))
            .await
            .unwrap();
        let mut ca = bundle.ca_secret();
        let raw = kubeconfig::render(server, &bundle.ca.cert, &bundle.client.cert, &bundle.client.key)
            .unwrap();
        ca.data
            .as_mut()
            .unwrap()
            .insert(KUBECONFIG_KEY.to_string(), k8s_openapi::ByteString(raw));
        fixture.secrets.put(ca);
    }

    #[test]
    fn endpoint_is_parsed_from_server_url() {
        assert_eq!(
            endpoint_from_server("https://example:9443").unwrap(),
            Endpoint {
                host: "example".to_string(),
                port: 9443
            }
        );
        assert_eq!(endpoint_from_server("https://example").unwrap().port, 6443);
        assert!(endpoint_from_server("not a url").is_err());
    }

    fn status_keys(patch: &serde_json::Value) -> Vec<String> {
        let mut keys: Vec<String> = patch["status"]
            .as_object()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    #[test]
    fn each_writer_patches_only_its_fields() {
        let mut status = K3sStatus {
            observed_generation: 2,
            ready: true,
            credential_secret_name: "c1-kubeconfig".to_string(),
            token: "secret".to_string(),
            ..Default::default()
        };
        status::set_active(&mut status);

        let provisioning = StatusFields::Provisioning.patch(&status);
        assert_eq!(
            status_keys(&provisioning),
            vec!["credentialSecretName", "observedGeneration", "token"]
        );
        assert_eq!(provisioning["status"]["observedGeneration"], 2);

        let readiness = StatusFields::Readiness.patch(&status);
        assert_eq!(status_keys(&readiness), vec!["conditions", "ready"]);
        assert_eq!(readiness["status"]["ready"], true);
    }

    #[test]
    fn not_ready_is_written_explicitly() {
        let status = K3sStatus::default();
        let readiness = StatusFields::Readiness.patch(&status);
        assert_eq!(readiness["status"]["ready"], false);
        assert_eq!(readiness["status"]["conditions"], serde_json::json!([]));
    }

    /// Serves `/<kind>/ping` answering 200, 204 or a redirect to a healthy
    /// endpoint, depending on `kind`.
    fn ping_server() -> std::net::SocketAddr {
        let route = warp::path!(String / "ping").map(|kind: String| {
            let builder = warp::http::Response::builder();
            let response = match kind.as_str() {
                "ok" => builder.status(200).body("pong"),
                "empty" => builder.status(204).body(""),
                _ => builder.status(302).header("location", "/ok/ping").body(""),
            };
            response.unwrap()
        });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        addr
    }

    #[tokio::test]
    async fn only_200_counts_as_alive() {
        let addr = ping_server();
        let live = LiveProbe::new(LiveProbe::insecure_ping_client().unwrap());

        live.ping(&format!("http://{}/ok/", addr)).await.unwrap();

        let empty = live.ping(&format!("http://{}/empty", addr)).await;
        assert!(matches!(empty, Err(Error::PingStatus { status: 204, .. })));

        let server = format!("http://{}/moved", addr);
        match live.ping(&server).await {
            Err(Error::PingStatus { url, status }) => {
                assert_eq!(status, 302);
                assert_eq!(url, server);
            }
            other => panic!("redirect was followed: {:?}", other),
        }
    }

    #[test]
    fn state_follows_status() {
        let mut k3s = K3s::new("c1", K3sSpec::default());
        assert_eq!(ProbeState::of(&k3s), ProbeState::Unknown);
        k3s.status = Some(K3sStatus {
            credential_secret_name: "c1-kubeconfig".to_string(),
            ..Default::default()
        });
        assert_eq!(ProbeState::of(&k3s), ProbeState::Probing);
        let mut status = k3s.status_or_default();
        status::set_transitioning(&mut status, "down");
        k3s.status = Some(status.clone());
        assert_eq!(ProbeState::of(&k3s), ProbeState::NotReady);
        status.ready = true;
        k3s.status = Some(status);
        assert_eq!(ProbeState::of(&k3s), ProbeState::Ready);
    }

    #[tokio::test]
    async fn nothing_happens_without_credentials() {
        let fixture = fixture();
        let mut k3s = K3s::new("c1", K3sSpec::default());
        k3s.metadata.namespace = Some("ns".to_string());
        let out = fixture.prober.check(k3s.clone()).await.unwrap();
        assert_eq!(out.status, k3s.status);
        assert_eq!(out.spec, k3s.spec);
        assert_eq!(fixture.store.status_writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_secret_is_not_ready() {
        let fixture = fixture();
        let out = fixture.prober.check(k3s_with_secret("c1")).await.unwrap();
        let status = out.status.unwrap();
        assert!(!status.ready);
        let ready = status::condition(&status, status::READY).unwrap();
        assert!(ready.message.starts_with("status check in-progress:"));
        assert!(ready.message.contains("not found"));
    }

    #[tokio::test]
    async fn endpoint_is_written_back_even_when_checks_fail() {
        let fixture = fixture();
        store_credentials(&fixture, "c1", "https://example:9443").await;
        fixture.probe.discovery_down.store(true, Ordering::SeqCst);

        let out = fixture.prober.check(k3s_with_secret("c1")).await.unwrap();
        assert_eq!(
            out.spec.control_plane_endpoint,
            Some(Endpoint {
                host: "example".to_string(),
                port: 9443
            })
        );
        assert!(!out.status.unwrap().ready);
        assert_eq!(fixture.store.endpoints.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unchanged_endpoint_is_not_rewritten() {
        let fixture = fixture();
        store_credentials(&fixture, "c1", "https://c1.ns").await;
        let mut k3s = k3s_with_secret("c1");
        k3s.spec.control_plane_endpoint = Some(Endpoint {
            host: "c1.ns".to_string(),
            port: 6443,
        });
        fixture.prober.check(k3s).await.unwrap();
        assert!(fixture.store.endpoints.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn readiness_flips_both_ways() {
        let fixture = fixture();
        store_credentials(&fixture, "c1", "https://c1.ns:6443").await;

        let k3s = fixture.prober.check(k3s_with_secret("c1")).await.unwrap();
        assert!(k3s.status.as_ref().unwrap().ready);

        fixture.probe.ping_down.store(true, Ordering::SeqCst);
        let k3s = fixture.prober.check(k3s).await.unwrap();
        let status = k3s.status.clone().unwrap();
        assert!(!status.ready);
        assert!(status::condition(&status, status::READY)
            .unwrap()
            .message
            .contains("status code 503"));

        fixture.probe.ping_down.store(false, Ordering::SeqCst);
        let k3s = fixture.prober.check(k3s).await.unwrap();
        assert!(k3s.status.unwrap().ready);
        assert_eq!(fixture.store.status_writes.load(Ordering::SeqCst), 3);
        assert!(fixture
            .store
            .written_fields
            .lock()
            .unwrap()
            .iter()
            .all(|fields| *fields == StatusFields::Readiness));
    }

    #[tokio::test]
    async fn steady_state_does_not_write() {
        let fixture = fixture();
        store_credentials(&fixture, "c1", "https://c1.ns:6443").await;
        let k3s = fixture.prober.check(k3s_with_secret("c1")).await.unwrap();
        let k3s = fixture.prober.check(k3s).await.unwrap();
        fixture.prober.check(k3s).await.unwrap();
        assert_eq!(fixture.store.status_writes.load(Ordering::SeqCst), 1);
    }
}
