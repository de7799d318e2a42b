mod config;
mod lookup;
mod retry;
mod signals;
mod tailer;
mod trace_line;
mod tracer;

use clap::Parser;
use config::FollowConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Attach strace to the running target process and print what it writes,
/// with the syscall framing stripped.
#[derive(Parser, Debug)]
#[command(name = "follow", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "follow.toml")]
    config: PathBuf,

    /// Delay between target lookups in milliseconds (overrides config)
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Give up after this many failed lookups (default: never)
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Tracer binary (overrides config)
    #[arg(long)]
    strace: Option<String>,

    /// Maximum captured string length passed to the tracer (overrides config)
    #[arg(long)]
    string_limit: Option<u32>,

    /// Only relay writes to this fd; repeatable (overrides config)
    #[arg(long = "fd", value_name = "FD")]
    fds: Vec<u32>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (lookup attempts, skipped lines)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut FollowConfig) {
        if let Some(ms) = self.interval_ms {
            config.lookup.retry_interval_ms = ms;
        }
        if let Some(max) = self.max_attempts {
            config.lookup.max_attempts = Some(max);
        }
        if let Some(strace) = &self.strace {
            config.tracer.command = strace.clone();
        }
        if let Some(limit) = self.string_limit {
            config.tracer.string_limit = limit;
        }
        if !self.fds.is_empty() {
            config.filter.fds = self.fds.clone();
        }
    }

    fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // stdout carries the relayed payloads, so logs go to stderr.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match FollowConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    cli.apply_overrides(&mut config);

    if cli.dry_run {
        println!("target = {:?}", lookup::TARGET_PROCESS);
        match toml::to_string_pretty(&config) {
            Ok(rendered) => print!("{rendered}"),
            Err(e) => {
                tracing::error!(error = %e, "failed to render configuration");
                return ExitCode::FAILURE;
            }
        }
        return ExitCode::SUCCESS;
    }

    let shutdown = match signals::install() {
        Ok(shutdown) => shutdown,
        Err(e) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(target_name = lookup::TARGET_PROCESS, "follow starting");
    let mut stdout = tokio::io::stdout();
    match tailer::Tailer::new(&config).run(&mut stdout, shutdown).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "follow stopped");
            ExitCode::FAILURE
        }
    }
}
