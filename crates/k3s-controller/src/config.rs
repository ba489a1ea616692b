//! Configuration for the operator.
//!
//! Build one with [`Config::default_config`], or turn on the "cli" feature
//! and use [`Config::new_from_flags`].
use std::path::PathBuf;
use std::time::Duration;

#[cfg(feature = "cli")]
use structopt::StructOpt;

use crate::desired::DEFAULT_IMAGE;
use crate::error::Result;
use crate::version::DEFAULT_CHANNEL_SERVER;

const DEFAULT_NAMESPACE: &str = "kube-system";
const DEFAULT_LEASE_NAME: &str = "k3s-controller-lock";
const DEFAULT_STATUS_INTERVAL_SECS: u64 = 30;
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

/// Everything the operator needs to run.
#[derive(Clone, Debug)]
pub struct Config {
    /// Kubeconfig to load; inferred from the environment when unset.
    pub kubeconfig: Option<PathBuf>,
    /// Kubeconfig context to use.
    pub context: Option<String>,
    /// Namespace holding the leader election lease.
    pub namespace: String,
    /// Name of the leader election lease.
    pub lease_name: String,
    /// Identity this process holds the lease under.
    pub identity: String,
    /// Base URL of the release channel server.
    pub channel_server: String,
    /// Image repository for the K3s workload.
    pub image: String,
    /// How often the status controller re-probes each cluster.
    pub status_interval: Duration,
    /// Upper bound for a single handler invocation.
    pub call_timeout: Duration,
    /// When set, write the CRD document here and exit.
    pub write_crds: Option<PathBuf>,
}

impl Config {
    /// Returns a Config with all of the defaults.
    pub fn default_config() -> Result<Self> {
        Ok(Config {
            kubeconfig: None,
            context: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            lease_name: DEFAULT_LEASE_NAME.to_string(),
            identity: default_identity()?,
            channel_server: DEFAULT_CHANNEL_SERVER.to_string(),
            image: DEFAULT_IMAGE.to_string(),
            status_interval: Duration::from_secs(DEFAULT_STATUS_INTERVAL_SECS),
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            write_crds: None,
        })
    }

    /// Parses command line flags and the environment. `version` is shown by
    /// `--version`.
    #[cfg(feature = "cli")]
    pub fn new_from_flags(version: &str) -> Result<Self> {
        let app = Opts::clap().version(version);
        let opts = Opts::from_clap(&app.get_matches());
        opts.into_config()
    }
}

fn default_identity() -> Result<String> {
    Ok(hostname::get()?.to_string_lossy().into_owned())
}

/// Command line options for the operator.
#[cfg(feature = "cli")]
#[derive(StructOpt, Clone, Debug)]
#[structopt(
    name = "k3s-operator",
    about = "Runs K3s clusters declared as Kubernetes resources"
)]
pub struct Opts {
    #[structopt(
        long = "kubeconfig",
        env = "KUBECONFIG",
        help = "Path to the kubeconfig used to reach the host cluster"
    )]
    kubeconfig: Option<PathBuf>,

    #[structopt(long = "context", env = "CONTEXT", help = "Kubeconfig context to use")]
    context: Option<String>,

    #[structopt(
        long = "namespace",
        env = "NAMESPACE",
        default_value = "kube-system",
        help = "Namespace holding the leader election lease"
    )]
    namespace: String,

    #[structopt(
        long = "lease-name",
        env = "LEASE_NAME",
        default_value = "k3s-controller-lock",
        help = "Name of the leader election lease"
    )]
    lease_name: String,

    #[structopt(
        long = "identity",
        env = "POD_NAME",
        help = "Identity to hold the lease under. Defaults to the hostname"
    )]
    identity: Option<String>,

    #[structopt(
        long = "channel-server",
        env = "K3S_CHANNEL_SERVER",
        default_value = "https://update.k3s.io/v1-release",
        help = "Base URL of the K3s release channel server"
    )]
    channel_server: String,

    #[structopt(
        long = "image",
        env = "K3S_IMAGE",
        default_value = "rancher/k3s",
        help = "Image repository for K3s servers"
    )]
    image: String,

    #[structopt(
        long = "status-interval",
        env = "STATUS_INTERVAL",
        default_value = "30",
        help = "Seconds between readiness probes of each cluster"
    )]
    status_interval: u64,

    #[structopt(
        long = "call-timeout",
        env = "CALL_TIMEOUT",
        default_value = "30",
        help = "Seconds a single reconciliation may take before it is abandoned"
    )]
    call_timeout: u64,

    #[structopt(
        long = "write-crds",
        help = "Write the CustomResourceDefinition to this path and exit"
    )]
    write_crds: Option<PathBuf>,
}

#[cfg(feature = "cli")]
impl Opts {
    fn into_config(self) -> Result<Config> {
        let identity = match self.identity {
            Some(identity) => identity,
            None => default_identity()?,
        };
        Ok(Config {
            kubeconfig: self.kubeconfig,
            context: self.context,
            namespace: self.namespace,
            lease_name: self.lease_name,
            identity,
            channel_server: self.channel_server,
            image: self.image,
            status_interval: Duration::from_secs(self.status_interval),
            call_timeout: Duration::from_secs(self.call_timeout),
            write_crds: self.write_crds,
        })
    }
}
