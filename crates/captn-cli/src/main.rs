use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use captn::config::{CaptnConfig, CredentialsFile, RuntimeOptions};
use captn::container::{CliDriver, ContainerDriver};
use captn::coordinator::{self, CoordinatorOptions};
use captn::report::Report;
use captn::Reporter;

/// Update decision and execution agent for a fleet of locally-running
/// containers.
#[derive(Parser, Debug)]
#[command(name = "captn", version)]
#[command(about = "Discover, classify, and apply container image updates")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "/etc/captn/config.toml")]
    config: PathBuf,

    /// Directory holding the single-instance lock and other run state.
    #[arg(long, default_value = "/var/lib/captn")]
    state_dir: PathBuf,

    /// Evaluate and log plans without touching any container (overrides
    /// configuration's `general.dryRun`).
    #[arg(long)]
    dry_run: bool,

    /// Force a real run even if configuration defaults to dry-run, and
    /// clear a stale-looking lock rather than erroring out.
    #[arg(long)]
    run: bool,

    /// Restrict the run to containers whose name matches this glob.
    /// Repeatable; matches are OR'd together.
    #[arg(long = "filter")]
    filters: Vec<String>,

    #[arg(long, default_value = "info")]
    log_level: String,

    /// Truncate any existing log file before running (no-op here; this
    /// crate logs to stderr only, log rotation lives outside captn).
    #[arg(long)]
    clear_logs: bool,

    /// Run on the configured cron schedule instead of exiting after one
    /// pass. Not implemented by this binary; scheduling is an external
    /// collaborator's responsibility (see the crate's module docs).
    #[arg(long)]
    daemon: bool,

    /// Name of the container running captn itself, if any, so its own
    /// update is deferred to the end of the run.
    #[arg(long)]
    self_container: Option<String>,
}

struct CliReporter {
    level: LogLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "debug" => LogLevel::Debug,
            "warning" | "warn" => LogLevel::Warning,
            "error" => LogLevel::Error,
            "critical" => LogLevel::Critical,
            _ => LogLevel::Info,
        }
    }
}

impl Reporter for CliReporter {
    fn debug(&mut self, msg: &str) {
        if self.level <= LogLevel::Debug {
            eprintln!("[debug] {msg}");
        }
    }
    fn info(&mut self, msg: &str) {
        if self.level <= LogLevel::Info {
            eprintln!("[info] {msg}");
        }
    }
    fn warn(&mut self, msg: &str) {
        if self.level <= LogLevel::Warning {
            eprintln!("[warn] {msg}");
        }
    }
    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(&cli) {
        Ok(report) => {
            print_summary(&report);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("[error] {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<Report> {
    let mut reporter = CliReporter {
        level: LogLevel::parse(&cli.log_level),
    };

    let config = if cli.config.exists() {
        CaptnConfig::from_path(&cli.config)
            .with_context(|| format!("loading config from {}", cli.config.display()))?
    } else {
        CaptnConfig::default()
    };
    config.validate().context("validating configuration")?;

    let credentials = match (&config.registry_auth.enabled, &config.registry_auth.credentials_file) {
        (true, Some(path)) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading credentials file {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("parsing credentials file {}", path.display()))?
        }
        _ => CredentialsFile::default(),
    };

    let runtime = RuntimeOptions {
        dry_run: if cli.dry_run { Some(true) } else { None },
        force_run: cli.run,
        name_filters: cli.filters.iter().filter_map(|f| f.strip_prefix("name=").map(String::from)).collect(),
        log_level: Some(cli.log_level.clone()),
        clear_logs: cli.clear_logs,
        daemon: cli.daemon,
        force_version: Default::default(),
    };

    let driver = detect_driver(&mut reporter)?;

    let self_container_name = cli
        .self_container
        .clone()
        .or_else(|| config.self_update.self_container_name.clone())
        .or_else(|| detect_self_container(&driver));

    let coordinator_options = CoordinatorOptions {
        state_dir: cli.state_dir.clone(),
        self_container_name,
        ..Default::default()
    };

    coordinator::run(&driver, &config, &runtime, &credentials, &coordinator_options, &mut reporter)
        .map_err(Into::into)
}

/// Probe for `docker` then `podman` on `PATH`, the way an operator would
/// expect a single binary to "just work" against either daemon.
fn detect_driver(reporter: &mut dyn Reporter) -> Result<CliDriver> {
    for candidate in ["docker", "podman"] {
        let probe = CliDriver::new(candidate);
        if probe.list().is_ok() {
            reporter.debug(&format!("using {candidate} as the container driver"));
            return Ok(probe);
        }
    }
    anyhow::bail!("neither docker nor podman responded; is a container daemon running?")
}

/// Identify the container this process is running in, when no explicit
/// override is configured (§S.5): `/proc/self/cgroup`'s last path segment
/// on a containerized process is, or embeds, the container's own id, which
/// is then matched by prefix against the driver's listing. Returns `None`
/// on any failure to read, parse, or match — the run proceeds without
/// self-update deferral rather than erroring out over it.
fn detect_self_container(driver: &dyn ContainerDriver) -> Option<String> {
    let cgroup = std::fs::read_to_string("/proc/self/cgroup").ok()?;
    let containers = driver.list().ok()?;

    for line in cgroup.lines() {
        let segment = line.rsplit('/').next().unwrap_or("");
        let candidate = segment
            .strip_suffix(".scope")
            .unwrap_or(segment)
            .rsplit('-')
            .next()
            .unwrap_or(segment);
        if candidate.len() < 12 || !candidate.chars().all(|c| c.is_ascii_hexdigit()) {
            continue;
        }
        if let Some(found) = containers
            .iter()
            .find(|c| c.id.starts_with(candidate) || candidate.starts_with(&c.id))
        {
            return Some(found.name.clone());
        }
    }
    None
}

fn print_summary(report: &Report) {
    println!(
        "run {} -> {} ({} container(s), dry_run={})",
        report.started_at.to_rfc3339(),
        report.finished_at.to_rfc3339(),
        report.outcomes.len(),
        report.dry_run
    );
    for outcome in &report.outcomes {
        println!(
            "  {}: {:?} (steps_applied={}){}",
            outcome.container,
            outcome.final_state,
            outcome.steps_applied,
            outcome
                .reason
                .as_ref()
                .map(|r| format!(" - {r}"))
                .unwrap_or_default()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_parses_known_names_case_insensitively() {
        assert_eq!(LogLevel::parse("DEBUG"), LogLevel::Debug);
        assert_eq!(LogLevel::parse("warning"), LogLevel::Warning);
        assert_eq!(LogLevel::parse("warn"), LogLevel::Warning);
        assert_eq!(LogLevel::parse("critical"), LogLevel::Critical);
    }

    #[test]
    fn log_level_defaults_to_info_for_unknown_input() {
        assert_eq!(LogLevel::parse("bogus"), LogLevel::Info);
    }

    #[test]
    fn log_level_orders_debug_below_error() {
        assert!(LogLevel::Debug < LogLevel::Error);
    }

    #[test]
    fn name_filter_flags_strip_the_name_prefix() {
        let cli = Cli::parse_from([
            "captn",
            "--filter",
            "name=web-*",
            "--filter",
            "name=db",
        ]);
        let filters: Vec<String> = cli
            .filters
            .iter()
            .filter_map(|f| f.strip_prefix("name=").map(String::from))
            .collect();
        assert_eq!(filters, vec!["web-*".to_string(), "db".to_string()]);
    }
}
