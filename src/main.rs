//! hostwall - host firewall compiler
//!
//! Command-line front end over the `hostwall` library: validate a ruleset,
//! render it for a backend, diff it against the live state and apply it
//! transactionally with automatic rollback.
//!
//! # Usage
//!
//! ```bash
//! hostwall validate rules.json                   # Print findings
//! hostwall render rules.json --backend iptables  # Print compiled documents
//! hostwall render rules.json --all               # Every backend at once
//! hostwall diff rules.json                       # Live state vs compiled
//! hostwall apply rules.json --validate-only      # Native dry run only
//! hostwall apply rules.json --timeout 60 --json  # Apply, JSON report
//! hostwall snapshots                             # Stored snapshots
//! hostwall restore nftables-20240101T000000000-0123abcd
//! ```
//!
//! Exit codes: 0 on success, 1 on any failure, 2 when an apply ended in a
//! failed rollback and the host needs manual intervention.

use clap::{Parser, Subcommand};
use hostwall::audit::AuditLog;
use hostwall::config::{self, EngineConfig};
use hostwall::core::backend;
use hostwall::core::engine::ManagementEndpoint;
use hostwall::core::error::BackendErrorPattern;
use hostwall::core::guard::ensure_management_access;
use hostwall::core::render::render_all;
use hostwall::core::validate::validate;
use hostwall::{
    ApplyContext, ApplyEngine, ApplyLock, ApplyMode, ApplyOptions, ApplyReport, BackendKind,
    BackupStore, CancelToken, Error, Result, RuleSet, SnapshotId,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use strum::IntoEnumIterator;
use tracing::{debug, warn};

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "hostwall")]
#[command(version, long_version = build::CLAP_LONG_VERSION)]
#[command(about = "Compile one ruleset for nftables, iptables, firewalld or ufw and apply it atomically", long_about = None)]
struct Cli {
    /// Configuration file (default: $XDG_CONFIG_HOME/hostwall/config.json)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true, value_name = "FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a ruleset and print every finding
    Validate {
        ruleset: PathBuf,
    },
    /// Print the compiled native configuration
    Render {
        ruleset: PathBuf,
        /// Backend to render for (default: from configuration)
        #[arg(short, long)]
        backend: Option<BackendKind>,
        /// Render for every backend
        #[arg(long, conflicts_with = "backend")]
        all: bool,
    },
    /// Unified diff between the live state and the compiled ruleset
    Diff {
        ruleset: PathBuf,
        #[arg(short, long)]
        backend: Option<BackendKind>,
    },
    /// Apply a ruleset with snapshot, verification and rollback
    Apply {
        ruleset: PathBuf,
        #[arg(short, long)]
        backend: Option<BackendKind>,
        /// Only run the backend's own syntax check
        #[arg(long)]
        validate_only: bool,
        /// Transaction budget in seconds (1-3600)
        #[arg(short, long, value_name = "SECONDS")]
        timeout: Option<u64>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// List stored snapshots, newest first
    Snapshots {
        #[arg(short, long)]
        backend: Option<BackendKind>,
    },
    /// Reload a stored snapshot
    Restore {
        id: SnapshotId,
    },
    /// Write a configuration file with every default filled in
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_file.as_deref());

    if let Err(e) = hostwall::utils::ensure_dirs() {
        warn!("Failed to create state directories: {e}");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(code) => code,
        Err(e) => {
            print_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool, log_file: Option<&Path>) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let builder = tracing_subscriber::fmt().with_max_level(level);

    if let Some(path) = log_file {
        match std::fs::File::create(path) {
            Ok(file) => {
                builder
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .init();
                return;
            }
            Err(e) => eprintln!("Cannot open log file {}: {e}", path.display()),
        }
    }
    builder.with_writer(std::io::stderr).init();
}

fn print_error(e: &Error) {
    eprintln!("Error: {e}");
    if let Error::Validation { findings } = e {
        for finding in findings {
            eprintln!("  {finding}");
        }
    }
    if let Some(stderr) = e.stderr() {
        let translation = BackendErrorPattern::match_error(stderr);
        eprintln!("  {}", translation.user_message);
        for suggestion in &translation.suggestions {
            eprintln!("  - {suggestion}");
        }
        if let Some(url) = &translation.help_url {
            eprintln!("  See {url}");
        }
    }
}

async fn load_ruleset(path: &Path) -> Result<RuleSet> {
    let json = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
    RuleSet::from_json(&json)
}

fn build_engine(config: &EngineConfig, kind: Option<BackendKind>) -> ApplyEngine {
    let kind = kind.unwrap_or(config.backend);
    let mut ctx = ApplyContext::new(
        backend::native(kind, config),
        BackupStore::new(&config.snapshot_dir),
        ApplyLock::with_file(&config.lock_path),
    )
    .with_retention(config.retention)
    .with_management(
        std::env::var("SSH_CONNECTION")
            .ok()
            .and_then(|v| ManagementEndpoint::from_ssh_connection(&v)),
    );

    if config.audit_log {
        match AuditLog::new() {
            Ok(audit) => ctx = ctx.with_audit(audit),
            Err(e) => warn!("Audit log unavailable: {e}"),
        }
    }
    ApplyEngine::new(ctx)
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

async fn handle_cli(cli: Cli) -> Result<ExitCode> {
    let config_path = match cli.config {
        Some(path) => path,
        None => config::default_config_path()
            .ok_or_else(|| Error::Config("cannot determine the config directory".to_string()))?,
    };

    if let Commands::InitConfig { force } = cli.command {
        if config_path.exists() && !force {
            return Err(Error::Config(format!(
                "{} already exists (use --force to overwrite)",
                config_path.display()
            )));
        }
        config::save_config(&EngineConfig::default(), &config_path).await?;
        println!("Wrote {}", config_path.display());
        return Ok(ExitCode::SUCCESS);
    }

    let config = config::load_config(&config_path).await?;
    debug!("Using configuration from {}", config_path.display());

    match cli.command {
        Commands::Validate { ruleset } => {
            let ruleset = load_ruleset(&ruleset).await?;
            let report = validate(&ruleset);
            for finding in &report.findings {
                println!("{finding}");
            }
            if report.has_errors() {
                return Ok(ExitCode::FAILURE);
            }
            println!("✓ Ruleset is valid ({} rules)", ruleset.rules.len());
        }
        Commands::Render {
            ruleset,
            backend,
            all,
        } => {
            let ruleset = load_ruleset(&ruleset).await?;
            let findings = validate(&ruleset).into_result()?;
            for finding in &findings {
                eprintln!("{finding}");
            }
            let plan = ensure_management_access(&ruleset)?;

            let kinds: Vec<BackendKind> = if all {
                BackendKind::iter().collect()
            } else {
                vec![backend.unwrap_or(config.backend)]
            };
            for (kind, artifact) in render_all(&plan, &kinds, &config.render_settings()) {
                let artifact = artifact?;
                if kinds.len() > 1 {
                    println!("### {kind}");
                }
                println!("{}", artifact.to_text());
            }
        }
        Commands::Diff { ruleset, backend } => {
            let ruleset = load_ruleset(&ruleset).await?;
            let diff = build_engine(&config, backend).diff(&ruleset).await?;
            if diff.is_empty() {
                println!("No changes");
            } else {
                print!("{diff}");
            }
        }
        Commands::Apply {
            ruleset,
            backend,
            validate_only,
            timeout,
            json,
        } => {
            let ruleset = load_ruleset(&ruleset).await?;
            let engine = build_engine(&config, backend);

            let cancel = CancelToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling apply");
                    on_interrupt.cancel();
                }
            });

            let options = ApplyOptions {
                mode: if validate_only {
                    ApplyMode::ValidateOnly
                } else {
                    ApplyMode::Apply
                },
                timeout: timeout.map_or_else(
                    || config.timeout(),
                    |secs| Duration::from_secs(secs.clamp(1, config::MAX_TIMEOUT_SECS)),
                ),
                cancel,
            };

            let report = engine.apply(&ruleset, &options).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            return Ok(exit_code(report.exit_code()));
        }
        Commands::Snapshots { backend } => {
            let store = BackupStore::new(&config.snapshot_dir);
            let snapshots = store.list(backend)?;
            if snapshots.is_empty() {
                println!("No snapshots in {}", store.dir().display());
            }
            for info in snapshots {
                println!(
                    "{} {:<10} {} {}",
                    if info.baseline { "*" } else { " " },
                    info.backend.as_ref(),
                    info.created_at.format("%Y-%m-%d %H:%M:%S"),
                    info.id
                );
            }
        }
        Commands::Restore { id } => {
            let kind = id
                .as_str()
                .split('-')
                .next()
                .and_then(|prefix| prefix.parse::<BackendKind>().ok());
            build_engine(&config, kind).restore(&id).await?;
            println!("✓ Restored {id}");
        }
        Commands::InitConfig { .. } => {}
    }
    Ok(ExitCode::SUCCESS)
}

fn print_report(report: &ApplyReport) {
    for finding in &report.findings {
        println!("{finding}");
    }
    if report.mode == ApplyMode::ValidateOnly
        && let Some(diff) = report.diff.as_deref().filter(|d| !d.is_empty())
    {
        print!("{diff}");
    }

    for step in &report.trace {
        match &step.note {
            Some(note) => println!("  {} -> {} ({note})", step.from, step.to),
            None => println!("  {} -> {}", step.from, step.to),
        }
    }

    let mark = if report.is_success() { "✓" } else { "✗" };
    println!(
        "{mark} {} on {}: {} (changed: {})",
        report.mode, report.backend, report.state, report.changed
    );
    if let Some(id) = &report.snapshot_id {
        println!("  Snapshot: {id}");
    }
    if let Some(error) = &report.error {
        println!("  Error [{}]: {}", error.kind, error.message);
        if let Some(stderr) = &error.stderr {
            let translation = BackendErrorPattern::match_error(stderr);
            println!("  {}", translation.user_message);
            for suggestion in &translation.suggestions {
                println!("  - {suggestion}");
            }
        }
    }
}
