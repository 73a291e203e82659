/*!
 * Bulwark CLI - Command Line Interface
 *
 * Validates settings files and exercises configured instances without a
 * surrounding application.
 */

use bulwark::{
    error::{BulwarkError, Result, EXIT_SUCCESS},
    logging,
    resilience::{Decorators, ResilienceError, State},
    settings::{LogLevel, LoggingConfig},
    telemetry, Registries, Settings,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "bulwark")]
#[command(version, about = "In-process fault tolerance: inspect and exercise resilience settings", long_about = None)]
struct Cli {
    /// Log level (overrides the settings file)
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Write JSON logs to this file instead of stdout
    #[arg(long = "log", value_name = "FILE", global = true)]
    log: Option<PathBuf>,

    /// Enable verbose (debug) output
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a settings file and report every configured instance
    Check {
        /// Settings file (TOML)
        config: PathBuf,
    },

    /// Drive a configured circuit breaker with synthetic outcomes
    Simulate {
        /// Settings file (TOML)
        config: PathBuf,

        /// Circuit breaker instance name
        #[arg(long)]
        breaker: String,

        /// Optional retry instance wrapped around the breaker
        #[arg(long)]
        retry: Option<String>,

        /// Number of calls to make
        #[arg(long, default_value_t = 100)]
        calls: u32,

        /// Every n-th call fails
        #[arg(long, default_value_t = 2)]
        fail_every: u32,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.command {
        Commands::Check { config } | Commands::Simulate { config, .. } => config,
    };
    let settings = Settings::from_file(config)?;
    logging::init_logging(&logging_config(&cli, &settings.logging))?;

    let registries = Registries::from_settings(&settings)?;
    telemetry::attach_all(&registries);

    match cli.command {
        Commands::Check { .. } => {
            report(&registries);
            Ok(())
        }
        Commands::Simulate {
            breaker,
            retry,
            calls,
            fail_every,
            ..
        } => simulate(&registries, &breaker, retry.as_deref(), calls, fail_every),
    }
}

fn logging_config(cli: &Cli, from_settings: &LoggingConfig) -> LoggingConfig {
    LoggingConfig {
        level: cli.log_level.map_or(from_settings.level, Into::into),
        file: cli.log.clone().or_else(|| from_settings.file.clone()),
        verbose: cli.verbose || from_settings.verbose,
    }
}

fn report(registries: &Registries) {
    println!("circuit breakers:");
    for cb in registries.circuit_breakers.all() {
        println!("  {:<20} {}  {:?}", cb.name(), cb.state(), cb.config());
    }
    println!("rate limiters:");
    for rl in registries.rate_limiters.all() {
        println!("  {:<20} {:?}", rl.name(), rl.config());
    }
    println!("bulkheads:");
    for b in registries.bulkheads.all() {
        println!("  {:<20} {:?}", b.name(), b.config());
    }
    println!("retries:");
    for r in registries.retries.all() {
        println!("  {:<20} {:?}", r.name(), r.config());
    }
}

fn simulate(
    registries: &Registries,
    breaker_name: &str,
    retry_name: Option<&str>,
    calls: u32,
    fail_every: u32,
) -> Result<()> {
    let breaker = registries
        .circuit_breakers
        .find(breaker_name)
        .ok_or_else(|| BulwarkError::unknown_instance("circuit_breaker", breaker_name))?;
    let retry = retry_name
        .map(|name| {
            registries
                .retries
                .find(name)
                .ok_or_else(|| BulwarkError::unknown_instance("retry", name))
        })
        .transpose()?;

    let started = Instant::now();
    let mut succeeded = 0u32;
    let mut rejected = 0u32;
    let mut failed = 0u32;
    let mut last_state = breaker.state();

    for call in 1..=calls {
        let fails = fail_every > 0 && call % fail_every == 0;
        let mut decorated = Decorators::of(move || {
            if fails {
                Err(ResilienceError::InvalidConfig(format!("synthetic failure #{}", call)))
            } else {
                Ok(call)
            }
        })
        .with_circuit_breaker(breaker.clone());
        if let Some(retry) = &retry {
            decorated = decorated.with_retry(retry.clone());
        }

        match decorated.call() {
            Ok(_) => succeeded += 1,
            Err(e) if e.is_rejection() => rejected += 1,
            Err(_) => failed += 1,
        }

        let state = breaker.state();
        if state != last_state {
            println!("call {:>5}: {} -> {}", call, last_state, state);
            last_state = state;
        }
    }

    let metrics = breaker.metrics();
    println!(
        "{} calls in {:?}: {} succeeded, {} failed, {} rejected",
        calls,
        started.elapsed(),
        succeeded,
        failed,
        rejected
    );
    println!(
        "final state {} (failure rate {:.1}%, not permitted {})",
        metrics.state,
        metrics.failure_rate(),
        metrics.not_permitted_calls
    );
    if metrics.state == State::Open {
        println!("breaker is open; it will admit probes after its open wait");
    }
    Ok(())
}
