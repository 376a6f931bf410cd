//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};

use crate::demo::DemoKind;
use forkpool::config::{ExecutionMode, Notification, default_worker_count};
use forkpool::logging::LogFormat;

/// Run integer payloads through a pool of forked worker processes.
#[derive(Parser, Debug)]
#[command(name = "forkpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors and hide progress.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format.
    #[arg(long, global = true, env = "FORKPOOL_LOG_FORMAT", value_parser = parse_log_format)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run values through a worker pool.
    Run(RunArgs),

    /// Run values through a single worker.
    Single(SingleArgs),

    /// List the available task kinds.
    Kinds,
}

/// Options shared by every way of running a task.
#[derive(Parser, Debug)]
pub struct TaskArgs {
    /// Task to run on every value.
    #[arg(long, value_enum, default_value_t = DemoKind::Double)]
    pub task: DemoKind,

    /// Sleep per payload for the `spin` task, in milliseconds.
    #[arg(long, default_value_t = 50)]
    pub spin_ms: u64,

    /// Execution mode.
    #[arg(long, env = "FORKPOOL_MODE", value_parser = parse_mode)]
    pub mode: Option<ExecutionMode>,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Plain)]
    pub format: OutputFormat,

    /// Integer payloads.
    #[arg(required = true, allow_negative_numbers = true)]
    pub values: Vec<i64>,
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Number of workers.
    #[arg(short, long, env = "FORKPOOL_WORKERS", default_value_t = default_worker_count())]
    pub workers: usize,

    /// Queue payloads on busy workers instead of waiting for an idle one.
    #[arg(long, env = "FORKPOOL_OVERFLOW")]
    pub overflow: bool,

    /// How workers report completions.
    #[arg(long, env = "FORKPOOL_NOTIFY", value_parser = parse_notification)]
    pub notify: Option<Notification>,

    #[command(flatten)]
    pub task: TaskArgs,
}

/// Arguments for the single command.
#[derive(Parser, Debug)]
pub struct SingleArgs {
    /// Poll interval while waiting for results, in milliseconds.
    #[arg(long, default_value_t = 10)]
    pub poll_ms: u64,

    #[command(flatten)]
    pub task: TaskArgs,
}

/// Result output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One `input -> output` line per value
    #[default]
    Plain,
    /// One JSON object per line
    Json,
}

fn parse_log_format(s: &str) -> Result<LogFormat, String> {
    s.parse()
}

fn parse_mode(s: &str) -> Result<ExecutionMode, String> {
    s.parse()
}

fn parse_notification(s: &str) -> Result<Notification, String> {
    s.parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parsing() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command() {
        let args = Cli::try_parse_from(["forkpool", "run", "--workers", "3", "1", "2"]).unwrap();
        match args.command {
            Commands::Run(run) => {
                assert_eq!(run.workers, 3);
                assert!(!run.overflow);
                assert_eq!(run.task.values, vec![1, 2]);
                assert_eq!(run.task.task, DemoKind::Double);
                assert_eq!(run.task.format, OutputFormat::Plain);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_with_options() {
        let args = Cli::try_parse_from([
            "forkpool",
            "run",
            "--overflow",
            "--mode",
            "simulation",
            "--notify",
            "polling",
            "--task",
            "fail-odd",
            "--format",
            "json",
            "--",
            "-4",
            "7",
        ])
        .unwrap();
        match args.command {
            Commands::Run(run) => {
                assert!(run.overflow);
                assert_eq!(run.notify, Some(Notification::Polling));
                assert_eq!(run.task.mode, Some(ExecutionMode::Simulation));
                assert_eq!(run.task.task, DemoKind::FailOdd);
                assert_eq!(run.task.format, OutputFormat::Json);
                assert_eq!(run.task.values, vec![-4, 7]);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_single_command() {
        let args = Cli::try_parse_from(["forkpool", "single", "--task", "spin", "5"]).unwrap();
        match args.command {
            Commands::Single(single) => {
                assert_eq!(single.poll_ms, 10);
                assert_eq!(single.task.task, DemoKind::Spin);
                assert_eq!(single.task.spin_ms, 50);
            }
            _ => panic!("Expected Single command"),
        }
    }

    #[test]
    fn test_values_required() {
        assert!(Cli::try_parse_from(["forkpool", "run"]).is_err());
    }

    #[test]
    fn test_kinds_command() {
        let args = Cli::try_parse_from(["forkpool", "kinds"]).unwrap();
        assert!(matches!(args.command, Commands::Kinds));
    }

    #[test]
    fn test_global_options() {
        let args = Cli::try_parse_from(["forkpool", "-vv", "--log-format", "json", "kinds"]).unwrap();
        assert_eq!(args.verbose, 2);
        assert_eq!(args.log_format, Some(LogFormat::Json));
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        let result = Cli::try_parse_from(["forkpool", "-v", "-q", "kinds"]);
        assert!(result.is_err());
    }
}
