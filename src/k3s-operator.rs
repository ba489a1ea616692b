use k3s_controller::config::Config;
use k3s_controller::operator::host_config;
use k3s_controller::{api, Operator};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::new_from_flags(env!("CARGO_PKG_VERSION"))?;

    if let Some(path) = &config.write_crds {
        info!(path = %path.display(), "Writing custom resource definitions");
        api::write_crds(path).await?;
        return Ok(());
    }

    let client = kube::Client::try_from(host_config(&config).await?)?;
    info!(
        namespace = %config.namespace,
        identity = %config.identity,
        "Starting k3s-operator"
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Unable to listen for shutdown signal");
            std::future::pending::<()>().await
        }
    };
    Operator::new(client, config).start(shutdown).await?;
    Ok(())
}
