//! RosterSync command-line tool.
//!
//! Runs one reconciliation pass per invocation (records, tracked upserts
//! or groups), ingests a single registration mail, runs the read-only
//! roster checks and manages the configuration and lookup cache.

mod style;

use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use rostersync_core::cache::{FileCache, DEFAULT_PRUNE_DAYS};
use rostersync_core::check::{
    check_addresses, check_numbering, external_members, PdokLookup, PDOK_SEARCH_URL,
};
use rostersync_core::config::{AppConfig, HandlerKind, DEFAULT_CONFIG_TEMPLATE};
use rostersync_core::email::{
    DkimVerifier, DnsOverHttpsResolver, EmailGate, GatePolicy, IngestOutcome, IngestionService,
    RegistrationHandler, RegistrationTarget,
};
use rostersync_core::notify::RunSummary;
use rostersync_core::platform::{GroupTarget, RestPlatform};
use rostersync_core::record::CanonicalRecord;
use rostersync_core::{Notifier, SchemaRegistry, SyncEngine};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// RosterSync command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "rostersync",
    version,
    about = "Keep a membership roster consistent across platforms"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "./rostersync.toml")]
    config: PathBuf,

    /// Compute and log every change without writing anything.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Override the configured log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./rostersync.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,

    /// Fetch and show a platform's records in canonical form.
    List {
        /// Platform name from the configuration.
        platform: String,

        /// Print one JSON object per record instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Run one reconciliation pass.
    Sync {
        #[command(subcommand)]
        action: SyncAction,
    },

    /// Read-only roster health checks.
    Check {
        #[command(subcommand)]
        action: CheckAction,
    },

    /// Verify a registration mail and act on it.
    EmailIngest {
        /// Raw RFC 5322 message, or `-` for stdin.
        file: PathBuf,

        /// Skip the message age checks.
        #[arg(long)]
        allow_stale: bool,
    },

    /// Manage the lookup cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Debug)]
enum SyncAction {
    /// Create, update and delete target records to match the sources.
    Records {
        /// Platform holding the authoritative roster.
        #[arg(long)]
        source: String,

        /// Platform to write to.
        #[arg(long)]
        target: String,

        /// Platform contributing the fields the source lacks.
        #[arg(long)]
        secondary: Option<String>,
    },
    /// Mark-and-sweep pass into an upsert-only target.
    Tracked {
        #[arg(long)]
        source: String,

        #[arg(long)]
        target: String,

        #[arg(long)]
        secondary: Option<String>,

        /// Record set (table) to own; defaults to `tracking.record_set`.
        #[arg(long)]
        table: Option<String>,
    },
    /// Mirror group memberships.
    Groups {
        #[arg(long)]
        source: String,

        #[arg(long)]
        target: String,

        /// Group name to mirror; repeat for more.
        #[arg(long = "group", required = true)]
        groups: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum CheckAction {
    /// Compare postal addresses with the national address register.
    Addresses {
        #[arg(long)]
        platform: String,
    },
    /// Check that member and external numbering ranges are respected.
    Numbering {
        #[arg(long)]
        platform: String,

        /// Group whose members are external relations; repeat for more.
        #[arg(long = "external-group")]
        external_groups: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Remove cache entries unused for the given number of days.
    Prune {
        #[arg(long, default_value_t = DEFAULT_PRUNE_DAYS)]
        days: u64,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Init { output } => {
            let _guard = init_logging(cli.log_level.as_deref().unwrap_or("warn"), None)?;
            cmd_init(&output)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate => {
            let _guard = init_logging(cli.log_level.as_deref().unwrap_or("warn"), None)?;
            cmd_validate(&cli.config)?;
            Ok(ExitCode::SUCCESS)
        }
        command => {
            let config = load_config(&cli.config)?;
            let level = cli.log_level.as_deref().unwrap_or(&config.run.log_level);
            let _guard = init_logging(level, config.run.log_dir.as_deref())?;
            if cli.dry_run {
                println!("{}", style::dry_run_banner());
            }

            match command {
                Commands::Cache { action } => cmd_cache(&config, action),
                command => {
                    let session = Session::open(config, cli.dry_run).await?;
                    match command {
                        Commands::List { platform, json } => session.cmd_list(&platform, json).await,
                        Commands::Sync { action } => session.cmd_sync(action).await,
                        Commands::Check { action } => session.cmd_check(action).await,
                        Commands::EmailIngest { file, allow_stale } => {
                            session.cmd_email_ingest(&file, allow_stale).await
                        }
                        _ => unreachable!(),
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Logging & config helpers
// ---------------------------------------------------------------------------

/// Stderr logging, plus a daily-rolling file when `log_dir` is set.
/// `RUST_LOG` wins over `level` when present.
fn init_logging(level: &str, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level '{level}'"))?;

    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    let (file, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "rostersync.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .init();
    Ok(guard)
}

fn load_config(path: &Path) -> Result<AppConfig> {
    AppConfig::load_and_resolve(path).context("failed to load configuration file")
}

fn connect(config: &AppConfig, name: &str) -> Result<Arc<RestPlatform>> {
    let platform = config.platform(name)?;
    let client = RestPlatform::from_config(name, platform)
        .with_context(|| format!("failed to set up platform '{name}'"))?;
    Ok(Arc::new(client))
}

fn yes_no(set: bool) -> &'static str {
    if set {
        "set"
    } else {
        "NOT SET"
    }
}

// ---------------------------------------------------------------------------
// Config subcommands
// ---------------------------------------------------------------------------

fn cmd_init(output: &Path) -> Result<()> {
    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, DEFAULT_CONFIG_TEMPLATE).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Point [schema] url at your translation table");
    println!("  2. Set the referenced environment variables (CONSCRIBO_TOKEN, LAPOSTA_TOKEN, etc.)");
    println!(
        "  3. Validate with: rostersync validate --config {}",
        output.display()
    );
    println!(
        "  4. Preview a pass: rostersync --config {} --dry-run sync records --source conscribo --target laposta",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    println!("  [OK] Environment variable references processed");

    match config.validate() {
        Ok(()) => println!("  [OK] All required fields are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    println!();
    println!("Configuration summary:");
    println!("  Translation table: {}", config.schema.url);
    println!("  Primary key      : {:?}", config.reconcile.primary_key);
    println!("  Cache directory  : {}", config.run.cache_dir.display());
    for (name, platform) in &config.platforms {
        println!(
            "  Platform {:<9}: {} (column {}, token {})",
            name,
            platform.base_url,
            platform.schema_column,
            yes_no(platform.token.is_some())
        );
    }
    println!(
        "  Mail handlers    : {} ({} authorized sender(s))",
        config.gate.handlers.len(),
        config.gate.allowed_senders.len()
    );
    println!(
        "  Slack webhook    : {}",
        yes_no(config.notifications.slack_webhook_url.is_some())
    );
    println!(
        "  Email recipients : {}",
        config.notifications.email_recipients.len()
    );
    if config.gate.allowed_senders.is_empty() && !config.gate.handlers.is_empty() {
        println!();
        println!(
            "{}",
            style::warn("gate.allowed_senders is empty: every message will be rejected")
        );
    }
    println!();
    println!("Configuration is valid.");

    Ok(())
}

fn cmd_cache(config: &AppConfig, action: CacheAction) -> Result<ExitCode> {
    match action {
        CacheAction::Prune { days } => {
            let cache = FileCache::new(&config.run.cache_dir);
            let removed = cache.prune(days).context("failed to prune cache")?;
            println!(
                "{}",
                style::success(&format!(
                    "removed {} entr{} unused for {days} day(s) from {}",
                    removed.len(),
                    if removed.len() == 1 { "y" } else { "ies" },
                    cache.dir().display()
                ))
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

// ---------------------------------------------------------------------------
// Session: config plus translation table for the remote subcommands
// ---------------------------------------------------------------------------

struct Session {
    config: AppConfig,
    registry: Arc<SchemaRegistry>,
    engine: SyncEngine,
    notifier: Arc<Notifier>,
    dry_run: bool,
}

impl Session {
    async fn open(config: AppConfig, dry_run: bool) -> Result<Self> {
        let http = reqwest::Client::new();
        let registry = SchemaRegistry::fetch(&http, &config.schema.url, &config.schema.key_column)
            .await
            .context("failed to load translation table")?;
        let registry = Arc::new(registry);
        let engine = SyncEngine::new(&config, Arc::clone(&registry), dry_run);
        let notifier = Arc::new(Notifier::new(&config.notifications));
        Ok(Self {
            config,
            registry,
            engine,
            notifier,
            dry_run,
        })
    }

    async fn load(&self, platform: &RestPlatform) -> Result<Vec<CanonicalRecord>> {
        self.engine
            .load(platform, platform.config())
            .await
            .with_context(|| format!("failed to load records from '{}'", platform.name()))
    }

    async fn load_optional(&self, name: Option<&str>) -> Result<Vec<CanonicalRecord>> {
        match name {
            Some(name) => self.load(&*connect(&self.config, name)?).await,
            None => Ok(Vec::new()),
        }
    }

    async fn blocked_ids(&self, source: &RestPlatform) -> Result<BTreeSet<String>> {
        let groups: Option<&dyn GroupTarget> = match source.config().groups {
            Some(_) => Some(source as &dyn GroupTarget),
            None => None,
        };
        self.engine
            .blocked_ids(groups)
            .await
            .context("failed to load blocked membership ids")
    }

    /// Summaries only go out for live passes that changed something.
    async fn report(&self, summary: RunSummary) {
        if self.dry_run {
            return;
        }
        if let Err(e) = self.notifier.notify_run_summary(&summary).await {
            warn!(error = %e, "run summary notification failed");
        }
    }

    // -- list ---------------------------------------------------------------

    async fn cmd_list(&self, name: &str, json: bool) -> Result<ExitCode> {
        let platform = connect(&self.config, name)?;
        let records = self.load(&platform).await?;

        if json {
            for record in &records {
                println!("{}", serde_json::to_string(&record.to_map())?);
            }
            return Ok(ExitCode::SUCCESS);
        }

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["Id", "Membership", "Name", "Email"]);
        for record in &records {
            let name = [record.first_name.as_deref(), record.last_name.as_deref()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ");
            table.add_row(vec![
                Cell::new(record.external_id.as_deref().unwrap_or("-")),
                Cell::new(record.membership_id.as_deref().unwrap_or("-")),
                Cell::new(name),
                Cell::new(record.email.as_deref().unwrap_or("-")),
            ]);
        }
        println!("{table}");
        println!();
        println!("{} record(s) in {}", records.len(), name);
        Ok(ExitCode::SUCCESS)
    }

    // -- sync ---------------------------------------------------------------

    async fn cmd_sync(&self, action: SyncAction) -> Result<ExitCode> {
        match action {
            SyncAction::Records {
                source,
                target,
                secondary,
            } => {
                let source_platform = connect(&self.config, &source)?;
                let target_platform = connect(&self.config, &target)?;
                let primary = self.load(&source_platform).await?;
                let secondary_records = self.load_optional(secondary.as_deref()).await?;
                let current = self.load(&target_platform).await?;
                let blocked = self.blocked_ids(&source_platform).await?;

                let outcome = self
                    .engine
                    .sync_records(
                        &primary,
                        &secondary_records,
                        &current,
                        blocked,
                        target_platform.config(),
                        target_platform.as_ref(),
                    )
                    .await
                    .context("reconciliation pass failed")?;

                println!("{}", style::header(&format!("{source} → {target}")));
                if outcome.plan.operations.is_empty() {
                    println!("{}", style::success("target already up to date"));
                } else {
                    let mut table = Table::new();
                    table.load_preset(UTF8_FULL);
                    table.set_content_arrangement(ContentArrangement::Dynamic);
                    table.set_header(vec!["Operation", "Record"]);
                    for op in &outcome.plan.operations {
                        let detail = op.to_string();
                        let detail = detail.split_once(' ').map(|(_, rest)| rest).unwrap_or("");
                        table.add_row(vec![Cell::new(style::verb(op.verb())), Cell::new(detail)]);
                    }
                    println!("{table}");
                }
                for skipped in &outcome.plan.skipped {
                    println!("{}", style::warn(&format!("skipped {}: {}", skipped.label, skipped.reason)));
                }
                for ambiguity in &outcome.ambiguous {
                    let label = current
                        .get(ambiguity.b)
                        .map(|r| r.label())
                        .unwrap_or_default();
                    println!(
                        "{}",
                        style::warn(&format!(
                            "ambiguous match for {label} ({} candidates); left alone",
                            ambiguity.candidates.len()
                        ))
                    );
                }

                let summary = outcome.summary(&format!("{source} → {target}"));
                println!();
                println!(
                    "created {}, updated {}, deleted {}, failed {}, skipped {}",
                    summary.created, summary.updated, summary.deleted, summary.failed, summary.skipped
                );
                for failure in &outcome.report.failures {
                    println!("{}", style::error(failure));
                }
                let clean = outcome.report.is_clean();
                self.report(summary).await;
                Ok(if clean { ExitCode::SUCCESS } else { ExitCode::FAILURE })
            }

            SyncAction::Tracked {
                source,
                target,
                secondary,
                table,
            } => {
                let record_set = table
                    .or_else(|| self.config.tracking.record_set.clone())
                    .ok_or_else(|| {
                        anyhow::anyhow!("no record set given: pass --table or set tracking.record_set")
                    })?;
                let source_platform = connect(&self.config, &source)?;
                let target_platform = connect(&self.config, &target)?;
                let primary = self.load(&source_platform).await?;
                let secondary_records = self.load_optional(secondary.as_deref()).await?;
                let blocked = self.blocked_ids(&source_platform).await?;

                let report = self
                    .engine
                    .sync_tracked(
                        &primary,
                        &secondary_records,
                        blocked,
                        &record_set,
                        Some(target_platform.config()),
                        target_platform.as_ref(),
                    )
                    .await
                    .context("tracked pass failed")?;

                println!("{}", style::header(&format!("{source} → {target}:{record_set}")));
                println!(
                    "planned {}, synced {}, failed {}",
                    report.planned, report.synced, report.failed
                );
                let clean = report.failed == 0;
                self.report(RunSummary {
                    label: format!("{source} → {target}:{record_set}"),
                    created: 0,
                    updated: report.synced,
                    deleted: 0,
                    failed: report.failed,
                    skipped: 0,
                })
                .await;
                Ok(if clean { ExitCode::SUCCESS } else { ExitCode::FAILURE })
            }

            SyncAction::Groups {
                source,
                target,
                groups,
            } => {
                let source_platform = connect(&self.config, &source)?;
                let target_platform = connect(&self.config, &target)?;
                let source_records = self.load(&source_platform).await?;
                let target_records = self.load(&target_platform).await?;

                let reports = self
                    .engine
                    .sync_groups(
                        &source_records,
                        source_platform.as_ref(),
                        &target_records,
                        target_platform.as_ref(),
                        &groups,
                    )
                    .await
                    .context("group pass failed")?;

                let mut table = Table::new();
                table.load_preset(UTF8_FULL);
                table.set_content_arrangement(ContentArrangement::Dynamic);
                table.set_header(vec!["Group", "Created", "Added", "Removed"]);
                for report in &reports {
                    table.add_row(vec![
                        Cell::new(&report.group),
                        Cell::new(if report.created { "yes" } else { "" }),
                        Cell::new(report.added).fg(comfy_table::Color::Green),
                        Cell::new(report.removed).fg(comfy_table::Color::Red),
                    ]);
                }
                println!("{table}");

                let missing = groups.len() - reports.len();
                if missing > 0 {
                    println!("{}", style::warn(&format!("{missing} group(s) not found in {source}")));
                }
                self.report(RunSummary {
                    label: format!("groups {source} → {target}"),
                    created: reports.iter().map(|r| r.added).sum(),
                    updated: 0,
                    deleted: reports.iter().map(|r| r.removed).sum(),
                    failed: 0,
                    skipped: missing,
                })
                .await;
                Ok(ExitCode::SUCCESS)
            }
        }
    }

    // -- checks -------------------------------------------------------------

    async fn cmd_check(&self, action: CheckAction) -> Result<ExitCode> {
        match action {
            CheckAction::Addresses { platform } => {
                let client = connect(&self.config, &platform)?;
                let records = self.load(&client).await?;
                let lookup = PdokLookup::new(
                    PDOK_SEARCH_URL,
                    Some(FileCache::new(&self.config.run.cache_dir)),
                );
                let findings = check_addresses(&records, &lookup).await;

                let problems: Vec<_> = findings.iter().filter(|(_, f)| f.is_problem()).collect();
                if problems.is_empty() {
                    println!("{}", style::success(&format!("{} address(es) checked, no problems", findings.len())));
                    return Ok(ExitCode::SUCCESS);
                }

                let mut table = Table::new();
                table.load_preset(UTF8_FULL);
                table.set_content_arrangement(ContentArrangement::Dynamic);
                table.set_header(vec!["Record", "Problem"]);
                for (label, finding) in &problems {
                    table.add_row(vec![Cell::new(label), Cell::new(finding.to_string())]);
                }
                println!("{table}");
                println!();
                println!("{}", style::error(&format!("{} of {} address(es) need attention", problems.len(), findings.len())));
                Ok(ExitCode::FAILURE)
            }

            CheckAction::Numbering {
                platform,
                external_groups,
            } => {
                let client = connect(&self.config, &platform)?;
                let records = self.load(&client).await?;
                let external = external_members(client.as_ref(), &external_groups)
                    .await
                    .context("failed to load external groups")?;
                let report = check_numbering(&records, &external);

                for problem in &report.problems {
                    println!("{}", style::error(&problem.to_string()));
                }
                if !report.skipped.is_empty() {
                    println!(
                        "{}",
                        style::dim(&format!("{} record(s) without a numeric membership id", report.skipped.len()))
                    );
                }
                println!("correct {}, wrong {}", report.correct, report.problems.len());
                Ok(if report.problems.is_empty() {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                })
            }
        }
    }

    // -- mail ---------------------------------------------------------------

    async fn cmd_email_ingest(&self, file: &Path, allow_stale: bool) -> Result<ExitCode> {
        let (raw, source) = read_message(file)?;

        let gate = &self.config.gate;
        let resolver = DnsOverHttpsResolver::new(&gate.doh_url, gate.pinned_keys.clone());
        let policy = GatePolicy::from_config(gate)
            .context("invalid gate configuration")?
            .with_allow_stale(allow_stale);
        let mut service = IngestionService::new(
            EmailGate::new(policy, DkimVerifier::new(resolver)),
            self.notifier.clone(),
        );

        for handler in &gate.handlers {
            match handler.kind {
                HandlerKind::Registration => {
                    let platform = connect(&self.config, &handler.target)?;
                    let mut target = RegistrationTarget::new(platform.config(), platform.clone());
                    if platform.config().groups.is_some() {
                        target = target.with_groups(platform.clone());
                    }
                    let registration = RegistrationHandler::new(
                        handler.clone(),
                        Arc::clone(&self.registry),
                        self.engine.diff_engine(BTreeSet::new()),
                        target,
                        self.notifier.clone(),
                        self.engine.pacer(),
                        self.dry_run,
                    );
                    service = service.with_handler(Arc::new(registration));
                }
            }
        }
        info!(handlers = service.handler_count(), "mail handlers registered");

        match service.ingest(&raw, &source, Utc::now()).await {
            IngestOutcome::Handled(handled) => {
                println!("{}", style::success(&handled.summary));
                if let Some(ref id) = handled.record_id {
                    println!("  record id: {id}");
                }
                if !handled.groups.is_empty() {
                    println!("  groups   : {}", handled.groups.join(", "));
                }
                Ok(ExitCode::SUCCESS)
            }
            IngestOutcome::Rejected(rejection) => {
                println!("{}", style::error(&rejection.to_string()));
                Ok(ExitCode::FAILURE)
            }
            IngestOutcome::HandlerFailed { address, error } => {
                println!("{}", style::error(&format!("handler for {address} failed: {error}")));
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

/// Raw bytes of a message plus a label for logs and alerts.
fn read_message(file: &Path) -> Result<(Vec<u8>, String)> {
    if file == Path::new("-") {
        let mut raw = Vec::new();
        std::io::stdin()
            .read_to_end(&mut raw)
            .context("failed to read message from stdin")?;
        return Ok((raw, "<stdin>".to_string()));
    }
    let raw = std::fs::read(file)
        .with_context(|| format!("failed to read message {}", file.display()))?;
    Ok((raw, file.display().to_string()))
}
