use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "jobmond", version, about = "jobmon supervisor daemon")]
struct Args {
    /// Path to the supervisor config YAML
    #[arg(short = 'c', long = "config", default_value = "jobmon.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = jobmon::jm::config::load_config(&args.config)?;
    jobmon::jm::logging::init(&cfg)?;
    jobmon::jm::daemon::run_daemon(cfg).await
}
