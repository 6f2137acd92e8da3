use clap::Parser;
use cronguard::config::DEFAULT_CONFIG_FILE;
use cronguard::runner::{run_supervised, RunOutcome, Supervision};
use cronguard::status::LockStatus;
use cronguard::{GuardConfig, GuardError, ProcessGuard, ProcessHandle};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Exit code when another instance holds the lock (EX_TEMPFAIL).
const EXIT_BUSY: i32 = 75;
/// Exit code for configuration, usage and spawn errors.
const EXIT_ERROR: i32 = 2;

/// Run a cron job as a per-script singleton: take a PID-file lock, run the
/// command, release the lock on exit or on SIGTERM/SIGHUP.
#[derive(Parser, Debug)]
#[command(name = "cronguard", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log directory (overrides config)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Lock directory (overrides config)
    #[arg(long)]
    lock_dir: Option<PathBuf>,

    /// Lock file suffix (overrides config)
    #[arg(long)]
    lock_suffix: Option<String>,

    /// Milliseconds between signal polls while the command runs (overrides config)
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Milliseconds a stopped command gets to exit before SIGKILL (overrides config)
    #[arg(long)]
    grace_period_ms: Option<u64>,

    /// Script name for the lock and log files (default: base name of the command)
    #[arg(short, long)]
    name: Option<String>,

    /// Print the lock state for the script and exit
    #[arg(long)]
    status: bool,

    /// Print --status output as JSON
    #[arg(long, requires = "status")]
    json: bool,

    /// Extra logging
    #[arg(short, long)]
    verbose: bool,

    /// Command to run, followed by its arguments
    #[arg(trailing_var_arg = true, value_name = "COMMAND")]
    command: Vec<String>,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let code = match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "cronguard failed");
            eprintln!("cronguard: {e}");
            EXIT_ERROR
        }
    };
    std::process::exit(code);
}

fn run(cli: &Cli) -> Result<i32, GuardError> {
    let mut config = GuardConfig::load(&cli.config)?;
    apply_overrides(&mut config, cli);

    let Some(argv) = invocation(cli) else {
        eprintln!("cronguard: a COMMAND (or --name with --status) is required");
        return Ok(EXIT_ERROR);
    };
    let handle = ProcessHandle::from_args(std::process::id(), argv)?;

    if cli.status {
        let guard = ProcessGuard::detached(handle, &config)?;
        let status = LockStatus::probe(&guard);
        if cli.json {
            match status.to_json() {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("cronguard: failed to serialize status: {e}");
                    return Ok(EXIT_ERROR);
                }
            }
        } else {
            println!("{}", status.render_text());
        }
        return Ok(status.exit_code());
    }

    let mut guard = ProcessGuard::install(handle, &config)?;
    let timing = Supervision {
        poll_interval: Duration::from_millis(config.runner.poll_interval_ms.max(1)),
        grace_period: Duration::from_millis(config.runner.grace_period_ms),
    };
    match run_supervised(&mut guard, &cli.command[0], &cli.command[1..], timing)? {
        RunOutcome::Busy => {
            eprintln!(
                "cronguard: {} is already running, see {}",
                guard.script_name(),
                guard.lock_file().display()
            );
            Ok(EXIT_BUSY)
        }
        RunOutcome::Exited { code } => Ok(code),
    }
}

fn apply_overrides(config: &mut GuardConfig, cli: &Cli) {
    if let Some(dir) = &cli.log_dir {
        config.paths.log_dir = dir.clone();
    }
    if let Some(dir) = &cli.lock_dir {
        config.paths.lock_dir = dir.clone();
    }
    if let Some(suffix) = &cli.lock_suffix {
        config.paths.lock_suffix = suffix.clone();
    }
    if let Some(ms) = cli.poll_interval_ms {
        config.runner.poll_interval_ms = ms;
    }
    if let Some(ms) = cli.grace_period_ms {
        config.runner.grace_period_ms = ms;
    }
}

/// Argument vector for the guard's identity: the script name first, then the
/// command's arguments. `None` when there is nothing to name the script by.
fn invocation(cli: &Cli) -> Option<Vec<String>> {
    if !cli.status && cli.command.is_empty() {
        return None;
    }
    let params = cli.command.iter().skip(1).cloned();
    match (&cli.name, cli.command.first()) {
        (Some(name), _) => Some(std::iter::once(name.clone()).chain(params).collect()),
        (None, Some(_)) => Some(cli.command.clone()),
        (None, None) => None,
    }
}
