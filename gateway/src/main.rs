use clap::Parser;
use offline_gateway::{config::GatewayConfig, server};

#[derive(Debug, Parser)]
#[command(about = "Serve a service definition's HTTP events locally")]
struct Args {
    /// Gateway config YAML.
    #[arg(long)]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    tracing::info!(config = %args.config, "starting");

    let cfg_bytes = tokio::fs::read(&args.config).await?;
    let cfg = GatewayConfig::from_yaml_bytes(&cfg_bytes)?;
    server::run(cfg).await
}
