use clap::Parser;
use tracing_subscriber::EnvFilter;

use omnimed::cli::{self, Cli};
use omnimed::config;

fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("OmniMed starting v{}", config::APP_VERSION);

    let cli = Cli::parse();
    std::process::exit(cli::execute(cli));
}
