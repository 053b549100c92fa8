mod backend;
mod cli;
mod error;
mod listeners;
mod logging;
mod metrics;
mod model;
mod orchestrator;
mod pairing;
mod storage;
mod text_summary;
#[cfg(feature = "tui")]
mod tui;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let is_silent = args.silent;
    let is_non_tui = args.command.is_some() || args.silent || args.json || args.text;

    let to_file = cfg!(feature = "tui") && !is_non_tui;
    match logging::init(to_file) {
        Ok(Some(path)) => tracing::info!(path = %path.display(), "logging to file"),
        Ok(None) => {}
        Err(e) => {
            eprintln!("log file unavailable: {e}");
            logging::init(false).ok();
        }
    }

    match cli::run(args).await {
        Ok(()) => {
            // Explicitly exit with code 0 on success, especially for non-TUI modes
            if is_non_tui {
                std::process::exit(0);
            }
            Ok(())
        }
        Err(e) => {
            if is_silent {
                println!("{}", e);
                std::process::exit(1);
            } else {
                Err(e)
            }
        }
    }
}
