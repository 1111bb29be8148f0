mod cli;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // logs a stderr; stdout queda para la salida del comando
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("jobsink=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    cli::run().await
}
