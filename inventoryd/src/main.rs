use inventoryd::daemon::{DaemonConfig, DaemonRuntime, clear_cache};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    ClearCache,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--clear-cache" => mode = CliMode::ClearCache,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("inventoryd=info")),
        )
        .init();

    match parse_cli_mode(std::env::args())? {
        CliMode::ClearCache => {
            let config = DaemonConfig::from_env()?;
            let removed = clear_cache(&config)?;
            tracing::info!(removed, "inventory snapshots removed");
            return Ok(());
        }
        CliMode::Help => {
            println!("Usage: inventoryd [--clear-cache]");
            println!("  --clear-cache   Remove saved inventory snapshots and exit");
            return Ok(());
        }
        CliMode::Run => {}
    }
    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    daemon.run().await
}
