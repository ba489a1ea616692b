//! The `K3s` custom resource and its schema document.
use std::path::Path;

use kube::{CustomResource, CustomResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// API group the resource is served under.
pub const GROUP: &str = "k3s.ibtc.io";

/// Channel used when the spec leaves it empty.
pub const DEFAULT_CHANNEL: &str = "stable";

/// Port the K3s API server listens on.
pub const API_PORT: i32 = 6443;

/// Desired state of an ephemeral K3s cluster.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "k3s.ibtc.io",
    version = "v1",
    kind = "K3s",
    plural = "k3s",
    namespaced,
    status = "K3sStatus",
    printcolumn = r#"{"name":"Ready", "type":"boolean", "jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Kubeconfig", "type":"string", "jsonPath":".status.credentialSecretName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct K3sSpec {
    /// Last discovered address of the cluster's API server. Overwriting it
    /// forces the status controller to rediscover it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<Endpoint>,
    /// Release channel to track. Empty means "stable".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel: String,
}

/// Host and port of a control plane.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct Endpoint {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default)]
    pub port: i32,
}

/// Observed state of a K3s cluster.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct K3sStatus {
    /// Generation last processed by the deploy controller.
    #[serde(default)]
    pub observed_generation: i64,
    /// Whether the most recent probe cycle succeeded. Always serialized so a
    /// merge patch can flip it back to false.
    #[serde(default)]
    pub ready: bool,
    /// Secret holding the CA and the admin kubeconfig.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credential_secret_name: String,
    /// Join token handed to the cluster. Generated once.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// A single status condition, in the shape kubectl understands.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_transition_time: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_update_time: String,
}

impl K3s {
    /// Status, or the empty status for a resource that was never reconciled.
    pub fn status_or_default(&self) -> K3sStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Channel to resolve, with the empty channel mapped to "stable".
    pub fn channel(&self) -> &str {
        if self.spec.channel.is_empty() {
            DEFAULT_CHANNEL
        } else {
            &self.spec.channel
        }
    }
}

/// Renders the CustomResourceDefinition for [`K3s`] as YAML.
pub fn crd_yaml() -> Result<String> {
    Ok(serde_yaml::to_string(&K3s::crd())?)
}

/// Writes the CustomResourceDefinition to `path`, creating parent
/// directories as needed.
pub async fn write_crds<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(path, crd_yaml()?).await?;
    Ok(())
}
