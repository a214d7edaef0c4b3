//! kubelease - short-lived Kubernetes credentials for a secrets host

use clap::Parser;

use kubelease_common::telemetry::{init_telemetry, TelemetryConfig};
use kubelease_server::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        service_name: "kubelease".to_string(),
        otlp_endpoint: cli.otlp_endpoint.clone(),
        json: cli.log_json,
    })?;

    cli.run().await?;
    Ok(())
}
