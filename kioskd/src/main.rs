use kioskd::daemon::{DaemonConfig, DaemonRuntime};
use kioskd::logging::init_logging;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    SyncOnce,
    Serve,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--sync-once" => mode = CliMode::SyncOnce,
            "--serve" => mode = CliMode::Serve,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: kioskd [--sync-once | --serve]");
        println!("  (no flag)     Serve media and sync the Drive folder periodically");
        println!("  --sync-once   Run one sync pass, print the report as JSON and exit");
        println!("  --serve       Serve the existing mirror without syncing");
        return Ok(());
    }

    let config = DaemonConfig::from_env()?;
    init_logging(config.log_format)?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    match mode {
        CliMode::SyncOnce => {
            let report = daemon.sync_once().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        CliMode::Serve => daemon.run(false).await,
        CliMode::Run | CliMode::Help => daemon.run(true).await,
    }
}
