use anyhow::Result;
use clap::Parser;

use netguard::cli::{self, Cli, Commands, LogFormat};
use netguard::config::Config;

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    // Initialize logging before any full config load, which may warn
    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        Config::peek_log_level(cli.config.as_deref()).unwrap_or_else(|| "info".to_string())
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match cli.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Check(args) => cli::check::run(args, config_path).await,
        Commands::Validate(args) => cli::validate::run(args, config_path).await,
        Commands::Redact(args) => cli::redact::run(args).await,
        Commands::Exec(args) => cli::exec::run(args, config_path).await,
        Commands::Audit(args) => cli::audit::run(args, config_path).await,
        Commands::Config(args) => cli::config::run(args, config_path).await,
        Commands::Devices => cli::devices::run(config_path),
        Commands::Paths => cli::paths::run(),
    }
}
