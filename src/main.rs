use std::path::Path;

use skypulse::{run_server, Settings};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args().nth(1);
    let settings = Settings::load(config_path.as_deref().map(Path::new))?;
    run_server(settings).await?;
    Ok(())
}
