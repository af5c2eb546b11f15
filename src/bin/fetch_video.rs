#![forbid(unsafe_code)]

//! One-shot fetch for a single identifier.
//!
//! Runs the whole pipeline (scrape, download, remux, artwork, `.nfo`,
//! archive) and prints `[ NN%] message` lines on stdout so a parent process
//! can follow along. The backend runs this binary for every queued job; the
//! Docker image runs it directly when given an identifier.

use std::{io::Write, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use nasvid_tools::{
    config::{AppConfig, RuntimeOverrides, resolve_runtime_paths},
    identifier, logging,
    pipeline::{FetchOutcome, Pipeline},
    scraper::{DEFAULT_TIMEOUT, HttpFetcher},
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Fetches one video into the nasvid library.",
    long_about = None
)]
struct Cli {
    /// Identifier to fetch, e.g. ABC-123.
    identifier: String,

    /// Configuration file; defaults to NASVID_CONFIG or cfg/configs.json.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Fetch again even when the identifier is already archived.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    force: bool,
}

fn report(percent: u8, message: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "[{percent:>3}%] {message}");
    let _ = stdout.flush();
}

fn main() -> Result<()> {
    logging::init("info");
    let cli = Cli::parse();

    let id = identifier::parse(&cli.identifier)?;
    let runtime_paths = resolve_runtime_paths(RuntimeOverrides {
        config_path: cli.config,
        ..RuntimeOverrides::default()
    })?;
    let config = AppConfig::load(&runtime_paths.config_path)?;
    let fetcher = HttpFetcher::new(config.proxy(), DEFAULT_TIMEOUT)
        .context("building HTTP client")?;

    let pipeline = Pipeline::new(config, Box::new(fetcher));
    pipeline.tools().check()?;

    match pipeline.run(&id, cli.force, &mut report)? {
        FetchOutcome::AlreadyPresent(path) => {
            info!("{id} already downloaded at {}", path.display())
        }
        FetchOutcome::Downloaded(path) => info!("{id} saved to {}", path.display()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn cli_parses_flags() {
        let cli = Cli::try_parse_from(["fetch_video", "--config", "/cfg.json", "--force", "ABC-1"])
            .unwrap();
        assert_eq!(cli.identifier, "ABC-1");
        assert_eq!(cli.config, Some(PathBuf::from("/cfg.json")));
        assert!(cli.force);
        assert!(Cli::try_parse_from(["fetch_video"]).is_err());
    }
}
