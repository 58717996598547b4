//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use mediaproxy_service::config::Config;
use mediaproxy_service::{metrics, store};

use crate::logging;
use crate::server;

/// Media proxy commands.
#[derive(Subcommand)]
enum Command {
    /// Run the web server.
    Run {
        /// Host and port to listen on, overriding the configuration file.
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// Remove expired items from the local cache.
    Cleanup {
        /// Only report what would be removed.
        #[arg(long)]
        dry_run: bool,
    },
}

/// Command line interface parser.
#[derive(Parser)]
#[command(bin_name = "mediaproxy", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long = "config", short = 'c', global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: No runtime has been started yet, so nothing else reads the environment.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let tags = config.metrics.custom_tags.clone();
        if let Err(error) = metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)
        {
            let stderr: &dyn std::error::Error = &*error;
            tracing::warn!(stderr, "Metrics are disabled");
        }
    }

    match cli.command {
        Command::Run { bind } => {
            if let Some(bind) = bind {
                config.bind = bind;
            }
            server::run(config).context("failed to start the server")?
        }
        Command::Cleanup { dry_run } => {
            let stats = store::cleanup(&config, dry_run).context("failed to clean up caches")?;
            if dry_run {
                tracing::info!("Dry run, would have removed {} files", stats.removed_files);
            }
        }
    }

    Ok(())
}
