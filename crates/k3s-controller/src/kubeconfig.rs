//! Rendering and reading the admin kubeconfig handed out for each cluster.
use kube::config::{KubeConfigOptions, Kubeconfig};

use crate::error::{Error, Result};

const CLUSTER_NAME: &str = "cluster";
const USER_NAME: &str = "user";
const CONTEXT_NAME: &str = "default";

/// Renders a kubeconfig that talks to `server`, trusts `ca_cert` and
/// authenticates with the client certificate pair.
///
/// The output is a pure function of its inputs so that repeated
/// reconciliations produce identical secrets.
pub fn render(server: &str, ca_cert: &str, client_cert: &str, client_key: &str) -> Result<Vec<u8>> {
    let json = serde_json::json!({
        "kind": "Config",
        "apiVersion": "v1",
        "preferences": {},
        "clusters": [{
            "name": CLUSTER_NAME,
            "cluster": {
                "certificate-authority-data": base64::encode(ca_cert.as_bytes()),
                "server": server,
            }
        }],
        "users": [{
            "name": USER_NAME,
            "user": {
                "client-certificate-data": base64::encode(client_cert.as_bytes()),
                "client-key-data": base64::encode(client_key.as_bytes()),
            }
        }],
        "contexts": [{
            "name": CONTEXT_NAME,
            "context": {
                "cluster": CLUSTER_NAME,
                "user": USER_NAME,
            }
        }],
        "current-context": CONTEXT_NAME
    });

    Ok(serde_yaml::to_vec(&json)?)
}

/// Returns the server URL of the current context's cluster, or of the
/// first cluster when no context is selected.
pub fn server(raw: &[u8]) -> Result<String> {
    let config: Kubeconfig = serde_yaml::from_slice(raw)?;
    let wanted = config
        .current_context
        .as_deref()
        .and_then(|current| config.contexts.iter().find(|c| c.name == current))
        .map(|c| c.context.cluster.as_str());

    let cluster = match wanted {
        Some(name) => config.clusters.iter().find(|c| c.name == name),
        None => config.clusters.first(),
    };

    match cluster {
        Some(c) if !c.cluster.server.is_empty() => Ok(c.cluster.server.clone()),
        _ => Err(Error::InvalidKubeconfig(
            "no server found for the current context".to_string(),
        )),
    }
}

/// Builds a client configuration from a raw kubeconfig document.
pub async fn client_config(raw: &[u8]) -> Result<kube::Config> {
    let kubeconfig: Kubeconfig = serde_yaml::from_slice(raw)?;
    kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::InvalidKubeconfig(e.to_string()))
}
