//! Computes the child objects a `K3s` should own.
//!
//! [`Generator::compute`] is the only place that decides what a cluster looks
//! like. Its output depends on the resource, the resolved version, the
//! stored credentials and the status token, nothing else, so repeating it
//! with unchanged inputs yields identical objects.
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::ResourceExt;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::api::{K3s, K3sStatus, API_PORT};
use crate::credential::{CredentialSource, Identity, TLS_CERT_KEY, TLS_KEY_KEY};
use crate::error::Result;
use crate::version::VersionResolver;

/// Image repository the workload runs by default.
pub const DEFAULT_IMAGE: &str = "rancher/k3s";

/// Label selecting the pods of one cluster.
pub const APP_LABEL: &str = "app";

const TOKEN_CHARACTERS: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const TOKEN_LENGTH: usize = 54;
const TLS_DIR: &str = "/var/lib/rancher/k3s/server/tls";

/// One object in a cluster's desired set.
#[derive(Clone, Debug, PartialEq)]
pub enum ChildObject {
    Secret(Secret),
    Service(Service),
    Deployment(Deployment),
}

impl ChildObject {
    pub fn kind(&self) -> &'static str {
        match self {
            ChildObject::Secret(_) => "Secret",
            ChildObject::Service(_) => "Service",
            ChildObject::Deployment(_) => "Deployment",
        }
    }

    pub fn name(&self) -> String {
        match self {
            ChildObject::Secret(o) => o.name(),
            ChildObject::Service(o) => o.name(),
            ChildObject::Deployment(o) => o.name(),
        }
    }

    /// Serialized form, as handed to the API server.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(match self {
            ChildObject::Secret(o) => serde_json::to_vec(o)?,
            ChildObject::Service(o) => serde_json::to_vec(o)?,
            ChildObject::Deployment(o) => serde_json::to_vec(o)?,
        })
    }
}

/// Output of one desired-state computation.
///
/// An empty object list means the cycle was skipped and `status` is the
/// status it was given; callers must not read it as "delete everything".
#[derive(Clone, Debug, PartialEq)]
pub struct Desired {
    pub objects: Vec<ChildObject>,
    pub status: K3sStatus,
}

impl Desired {
    /// Whether nothing should be applied this cycle.
    pub fn is_skipped(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Turns a `K3s` into its desired child objects and status.
#[derive(Clone)]
pub struct Generator {
    credentials: Arc<dyn CredentialSource>,
    versions: Arc<dyn VersionResolver>,
    image: String,
}

impl Generator {
    pub fn new(
        credentials: Arc<dyn CredentialSource>,
        versions: Arc<dyn VersionResolver>,
        image: &str,
    ) -> Self {
        Generator {
            credentials,
            versions,
            image: image.to_string(),
        }
    }

    /// Computes the desired set for `k3s`.
    ///
    /// A version lookup failure skips the cycle. Credential failures are
    /// returned as errors and nothing is emitted.
    pub async fn compute(&self, k3s: &K3s) -> Result<Desired> {
        let mut status = k3s.status_or_default();
        let identity = Identity::of(k3s)?;

        let version = match self.versions.resolve(k3s.channel()).await {
            Ok(version) => version,
            Err(e) => {
                warn!(
                    name = %identity.name,
                    namespace = %identity.namespace,
                    channel = %k3s.channel(),
                    error = %e,
                    "Unable to resolve release channel, leaving cluster as is"
                );
                return Ok(Desired {
                    objects: vec![],
                    status,
                });
            }
        };

        let bundle = self.credentials.load_or_create(&identity).await?;

        if status.token.is_empty() {
            status.token = generate_token();
        }
        status.credential_secret_name = identity.ca_secret_name();
        status.observed_generation = k3s.metadata.generation.unwrap_or_default();

        debug!(
            name = %identity.name,
            namespace = %identity.namespace,
            %version,
            "Computed desired state"
        );

        Ok(Desired {
            objects: vec![
                ChildObject::Secret(bundle.ca_secret()),
                ChildObject::Secret(bundle.client_secret()),
                ChildObject::Service(service(&identity)?),
                ChildObject::Deployment(deployment(
                    &identity,
                    &self.image,
                    &version,
                    &status.token,
                    &status.credential_secret_name,
                )?),
            ],
            status,
        })
    }
}

/// Generates a fresh cluster join token from the OS random source.
pub fn generate_token() -> String {
    let mut rng = OsRng;
    (0..TOKEN_LENGTH)
        .map(|_| *TOKEN_CHARACTERS.choose(&mut rng).unwrap_or(&b'b') as char)
        .collect()
}

fn service(identity: &Identity) -> Result<Service> {
    Ok(serde_json::from_value(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": identity.name,
            "namespace": identity.namespace,
        },
        "spec": {
            "type": "ClusterIP",
            "ports": [{
                "name": "https",
                "protocol": "TCP",
                "port": API_PORT,
                "targetPort": API_PORT,
            }],
            "selector": {
                APP_LABEL: identity.name,
            },
        }
    }))?)
}

fn deployment(
    identity: &Identity,
    image: &str,
    version: &str,
    token: &str,
    ca_secret_name: &str,
) -> Result<Deployment> {
    let cert_files = [
        ("server-ca.crt", TLS_CERT_KEY),
        ("server-ca.key", TLS_KEY_KEY),
        ("client-ca.crt", TLS_CERT_KEY),
        ("client-ca.key", TLS_KEY_KEY),
    ];
    let items: Vec<_> = cert_files
        .iter()
        .map(|(path, key)| serde_json::json!({ "key": key, "path": path }))
        .collect();
    let mounts: Vec<_> = cert_files
        .iter()
        .map(|(path, _)| {
            serde_json::json!({
                "name": "certs",
                "mountPath": format!("{}/{}", TLS_DIR, path),
                "subPath": path,
            })
        })
        .collect();

    Ok(serde_json::from_value(serde_json::json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": identity.name,
            "namespace": identity.namespace,
        },
        "spec": {
            "replicas": 1,
            "selector": {
                "matchLabels": { APP_LABEL: identity.name },
            },
            "template": {
                "metadata": {
                    "labels": { APP_LABEL: identity.name },
                },
                "spec": {
                    "hostname": identity.name,
                    "volumes": [{
                        "name": "certs",
                        "projected": {
                            "sources": [{
                                "secret": {
                                    "name": ca_secret_name,
                                    "items": items,
                                }
                            }]
                        }
                    }],
                    "containers": [{
                        "name": "k3s",
                        "image": format!("{}:{}", image, version),
                        "args": [
                            "server",
                            "--cluster-cidr", "10.44.0.0/16",
                            "--service-cidr", "10.45.0.0/16",
                        ],
                        "workingDir": "/var/lib/rancher/k3s",
                        "env": [{ "name": "K3S_TOKEN", "value": token }],
                        "volumeMounts": mounts,
                        "readinessProbe": {
                            "httpGet": {
                                "path": "/ping",
                                "port": API_PORT,
                                "scheme": "HTTPS",
                            },
                            "initialDelaySeconds": 2,
                        },
                        "securityContext": { "privileged": true },
                        "resources": {
                            "requests": { "cpu": "100m" },
                        },
                    }],
                }
            }
        }
    }))?)
}
