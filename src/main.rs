//! forkpool - run integer payloads through forked worker processes.

mod cli;
mod demo;

use std::io::IsTerminal;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::{
    OwoColorize,
    Stream::{Stderr, Stdout},
};

use cli::{Cli, Commands, OutputFormat, RunArgs, SingleArgs, TaskArgs};
use demo::{DemoKind, DemoTask};
use forkpool::logging::{self, LogConfig};
use forkpool::{ExecutionMode, PayloadResult, PoolConfig, Worker, WorkerConfig, driver};

/// Program entry point: parses arguments, sets up logging, runs the selected
/// command, and prints the error chain on failure.
fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(&cli, args),
        Commands::Single(args) => cmd_single(&cli, args),
        Commands::Kinds => cmd_kinds(),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let mut config = LogConfig::default().with_verbosity(cli.verbose, cli.quiet);
    // Explicit flags win over FORKPOOL_LOG / RUST_LOG
    if cli.verbose > 0 || cli.quiet {
        let level = config.level.as_str().to_lowercase();
        config = config.with_filter(level);
    }
    config = config.with_env_overrides();
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }
    logging::init(config);
}

/// Progress bar on stderr, or `None` when quiet or not a terminal.
fn progress_bar(cli: &Cli, len: usize, prefix: &'static str) -> Option<ProgressBar> {
    if cli.quiet || !std::io::stderr().is_terminal() {
        return None;
    }
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} ({elapsed}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓▒░  "),
    );
    pb.set_prefix(prefix);
    Some(pb)
}

/// Print results in input order. Returns the number of failures.
fn print_results(args: &TaskArgs, results: &[Option<PayloadResult<i64>>]) -> usize {
    let mut failed = 0;
    for (value, result) in args.values.iter().zip(results) {
        let line = match (args.format, result) {
            (OutputFormat::Plain, Some(Ok(output))) => format!("{} -> {}", value, output),
            (OutputFormat::Plain, Some(Err(failure))) => {
                format!("{} -> error: {}", value, failure)
            }
            (OutputFormat::Plain, None) => format!("{} -> lost", value),
            (OutputFormat::Json, Some(Ok(output))) => {
                serde_json::json!({ "input": value, "output": output }).to_string()
            }
            (OutputFormat::Json, Some(Err(failure))) => {
                serde_json::json!({ "input": value, "error": failure.message }).to_string()
            }
            (OutputFormat::Json, None) => {
                serde_json::json!({ "input": value, "error": "lost" }).to_string()
            }
        };
        if !matches!(result, Some(Ok(_))) {
            failed += 1;
        }
        println!("{}", line);
    }
    failed
}

fn finish(args: &TaskArgs, results: &[Option<PayloadResult<i64>>]) -> Result<()> {
    let failed = print_results(args, results);
    if failed > 0 {
        bail!("{} of {} payloads failed", failed, args.values.len());
    }
    Ok(())
}

fn cmd_run(cli: &Cli, args: &RunArgs) -> Result<()> {
    let mut config = PoolConfig::default()
        .with_env_overrides()
        .context("Invalid pool configuration in environment")?
        .with_size(args.workers)
        .with_overflow(args.overflow);
    if let Some(mode) = args.task.mode {
        config = config.with_mode(mode);
    }
    if let Some(notify) = args.notify {
        config = config.with_notification(notify);
    }

    let spin = Duration::from_millis(args.task.spin_ms);
    let registry = demo::registry(spin);
    let kind = args.task.task.name();
    let template = registry
        .get(kind)
        .with_context(|| format!("Failed to set up task '{}'", kind))?;

    tracing::info!(
        workers = config.size,
        mode = %config.mode,
        notification = %config.notification,
        overflow = config.overflow,
        kind,
        "Running payloads through pool"
    );

    let values = &args.task.values;
    let progress = progress_bar(cli, values.len(), "Running");
    let mut results: Vec<Option<PayloadResult<i64>>> = vec![None; values.len()];
    let mut on_finish = |index: usize, _: &i64, result: PayloadResult<i64>| {
        let ok = result.is_ok();
        results[index] = Some(result);
        if let Some(ref pb) = progress {
            pb.inc(1);
        }
        ok
    };

    driver::run_in_pool_with(config, template, values, Some(&mut on_finish))
        .context("Worker pool failed")?;

    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    finish(&args.task, &results)
}

fn cmd_single(cli: &Cli, args: &SingleArgs) -> Result<()> {
    let mode = args.task.mode.unwrap_or_else(ExecutionMode::detect);
    let task = DemoTask::new(args.task.task, Duration::from_millis(args.task.spin_ms));
    let worker = Worker::with_config(0, task, WorkerConfig::default().with_mode(mode));

    let values = &args.task.values;
    let progress = progress_bar(cli, values.len(), "Running");
    let mut results: Vec<Option<PayloadResult<i64>>> = vec![None; values.len()];

    let mut on_progress = |index: usize, value: &i64| {
        if let Some(ref pb) = progress {
            pb.set_message(format!("waiting on {} (#{})", value, index));
        }
    };
    let mut on_finish = |index: usize, _: &i64, result: PayloadResult<i64>| {
        let ok = result.is_ok();
        results[index] = Some(result);
        if let Some(ref pb) = progress {
            pb.inc(1);
        }
        ok
    };

    driver::run_in_background(
        worker,
        values,
        Some(&mut on_progress),
        Some(&mut on_finish),
        Duration::from_millis(args.poll_ms),
    )
    .context("Worker failed")?;

    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    finish(&args.task, &results)
}

fn cmd_kinds() -> Result<()> {
    for kind in DemoKind::all() {
        let name = format!("{:<10}", kind.name());
        println!(
            "{} {}",
            name.if_supports_color(Stdout, |text| text.bold()),
            kind.description()
        );
    }
    Ok(())
}
