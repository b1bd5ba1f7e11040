use clap::Parser;
use common::telemetry::{get_human_subscriber, get_subscriber, init_subscriber};

use premiscale::cli::Cli;
use premiscale::configuration;
use premiscale::supervisor::Supervisor;

fn main() {
    let cli = Cli::parse();

    match cli.log_file.as_ref() {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .unwrap_or_else(|e| {
                    eprintln!("premiscaled: failed to open log file {}: {e}", path.display());
                    std::process::exit(2);
                });
            let subscriber = get_subscriber("premiscaled".into(), cli.log_level.as_filter().into(), move || file.try_clone().expect("failed to clone log file handle"));
            init_subscriber(subscriber);
        }
        None => {
            let subscriber = get_human_subscriber(cli.log_level.as_filter().into(), std::io::stdout);
            init_subscriber(subscriber);
        }
    }

    let settings = match configuration::load(&cli.config) {
        Ok(mut settings) => {
            if let Some(token) = cli.token_override() {
                settings.controller.platform.token = Some(token);
            }
            settings
        }
        Err(e) => {
            eprintln!("premiscaled: configuration error: {e}");
            std::process::exit(2);
        }
    };

    if cli.validate {
        std::process::exit(0);
    }

    let runtime = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    let exit_code = runtime.block_on(async move { Supervisor::new(settings).run().await });
    std::process::exit(exit_code);
}
