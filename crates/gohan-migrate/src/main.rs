use clap::Parser;
use gohan_migrate::{Cli, Runner};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let (command, options) = cli.command.into_parts();

    info!("gohan-migrate {}", command.name());
    info!("  Config: {}", cli.config_file.display());
    if options.lock_with_etcd {
        info!("  Holding the cluster migration lock");
    }

    match Runner::default().run_guarded(&cli.config_file, &command, &options).await {
        Ok(report) => {
            println!("{}", report);
            Ok(())
        }
        Err(e) => {
            error!("migrate {} failed: {}", command.name(), e);
            std::process::exit(1);
        }
    }
}
