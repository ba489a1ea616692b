//! A crate for running [K3s](https://k3s.io) clusters as Kubernetes custom
//! resources.
//!
//! Each `K3s` resource is turned into a CA secret, an admin client secret,
//! a Service and a single-replica Deployment running the K3s server. A
//! second loop probes the resulting cluster and records whether it is ready.
//!
//! # Example
//! ```rust,no_run
//! use k3s_controller::{config::Config, operator::host_config, Operator};
//!
//! #[tokio::main]
//! async fn main() -> k3s_controller::Result<()> {
//!     let config = Config::default_config()?;
//!     let client = kube::Client::try_from(host_config(&config).await?)?;
//!     let shutdown = async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     };
//!     Operator::new(client, config).start(shutdown).await
//! }
//! ```

pub mod api;
pub mod apply;
mod backoff;
pub mod config;
pub mod controller;
pub mod credential;
pub mod desired;
pub mod error;
pub mod kubeconfig;
pub mod leader;
pub mod operator;
pub mod readiness;
pub mod secret;
pub mod status;
pub mod version;

#[doc(inline)]
pub use api::{K3s, K3sSpec, K3sStatus};
#[doc(inline)]
pub use controller::Handler;
#[doc(inline)]
pub use error::{Error, Result};
#[doc(inline)]
pub use operator::Operator;
