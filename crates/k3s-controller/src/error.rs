//! Errors surfaced by the reconciliation engine.
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can fail a reconciliation cycle.
///
/// None of these are fatal to the process except [`Error::LeadershipLost`];
/// the rest fail the current cycle and the controller requeues the object.
#[derive(Error, Debug)]
pub enum Error {
    /// The Kubernetes API rejected or failed a request.
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    /// An outbound HTTP request failed at the transport level.
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Certificate or key generation or parsing failed.
    #[error("certificate error: {0}")]
    Certificate(#[from] rcgen::RcgenError),

    /// JSON (de)serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization failed.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Filesystem access failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The release channel server answered without a usable redirect.
    #[error("channel {channel} did not resolve to a version (status {status})")]
    MissingRedirect {
        /// Channel that was looked up.
        channel: String,
        /// HTTP status the server answered with.
        status: u16,
    },

    /// A stored secret is missing a key or holds malformed data.
    #[error("secret {namespace}/{name} is invalid: {reason}")]
    InvalidSecret {
        /// Namespace of the secret.
        namespace: String,
        /// Name of the secret.
        name: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A kubeconfig document could not be interpreted.
    #[error("invalid kubeconfig: {0}")]
    InvalidKubeconfig(String),

    /// The resource is missing metadata the operation needs.
    #[error("resource is missing {0}")]
    MissingMetadata(&'static str),

    /// The `/ping` probe answered with something other than 200.
    #[error("failed to GET {url}, status code {status}")]
    PingStatus {
        /// Target that was probed.
        url: String,
        /// Status code received.
        status: u16,
    },

    /// A call did not finish within the configured timeout.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Reading or writing the leader lease failed.
    #[error("lease error: {0}")]
    Lease(#[from] kube_leader_election::Error),

    /// The leader lease could not be renewed.
    #[error("lost leadership of lease {0}")]
    LeadershipLost(String),
}

impl Error {
    /// Whether this is an API "not found" response.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(response)) if response.code == 404)
    }

    /// Whether this is an API "conflict" / "already exists" response.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(response)) if response.code == 409)
    }
}
