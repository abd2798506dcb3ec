//! Refinery CLI - inspect and refine a memory store
//!
//! Usage:
//!   refinery add "text"                 Add a memory
//!   refinery priority <id>              Explain a memory's priority
//!   refinery access <id>                Record a retrieval of a memory
//!   refinery windows                    Show detected consolidation windows
//!   refinery consolidate                Summarize each window
//!   refinery apply plan.json            Apply an agent action plan
//!   refinery reconsolidate plan.json    Apply a reconsolidation plan

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use memory_refinery::types::parse_timestamp;
use memory_refinery::{
    ActionStatus, ConsolidateArgs, EngineConfig, Importance, MemoryRecord, MemoryType,
    ReconsolidationPlan, RefineMemoriesResult, RefineStatus, Refinery, TemporalPolicy,
    UpsertDefaults, WindowStatus,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "refinery")]
#[command(about = "Refinery - memory lifecycle and consolidation engine")]
#[command(version)]
struct Cli {
    /// Path to data directory
    #[arg(short, long, env = "REFINERY_DATA_DIR", default_value = "./refinery_data")]
    data_dir: PathBuf,

    /// Memory index to operate on
    #[arg(short, long, env = "REFINERY_INDEX", default_value = "default")]
    index: String,

    /// Engine configuration (JSON)
    #[arg(short, long, env = "REFINERY_CONFIG")]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a new memory
    Add {
        /// Memory text
        text: String,

        /// Memory type
        #[arg(short = 't', long, value_enum, default_value = "semantic")]
        memory_type: CliMemoryType,

        /// Importance
        #[arg(long, value_enum)]
        importance: Option<CliImportance>,

        /// When the remembered event happened (RFC 3339, date or epoch millis)
        #[arg(long)]
        valid_at: Option<String>,

        /// Explicit id
        #[arg(long)]
        id: Option<String>,

        /// Tags
        #[arg(long)]
        tags: Vec<String>,
    },

    /// Explain a memory's priority
    Priority {
        /// Memory ID
        id: String,
    },

    /// Record a retrieval of a memory
    Access {
        /// Memory ID
        id: String,
    },

    /// Show detected consolidation windows
    Windows,

    /// Consolidate windows into summaries
    Consolidate {
        /// Temporal policy (strict, warn-clamp, warn-exclude, off)
        #[arg(short, long)]
        policy: Option<TemporalPolicy>,

        /// Dry run (don't make changes)
        #[arg(long)]
        dry_run: bool,

        /// Skip windows that already have a summary
        #[arg(long)]
        skip_existing: bool,
    },

    /// Apply an action plan
    Apply {
        /// JSON file holding an action array (or {"actions": [...]})
        plan: PathBuf,

        /// Validate only
        #[arg(long)]
        dry_run: bool,
    },

    /// Apply a reconsolidation plan
    Reconsolidate {
        /// JSON file holding the plan
        plan: PathBuf,

        /// Ids the triggering retrieval returned
        #[arg(long, value_delimiter = ',', required = true)]
        valid_ids: Vec<String>,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum CliMemoryType {
    #[value(name = "self")]
    Identity,
    Belief,
    Pattern,
    Episodic,
    Semantic,
}

impl From<CliMemoryType> for MemoryType {
    fn from(cli: CliMemoryType) -> Self {
        match cli {
            CliMemoryType::Identity => MemoryType::Identity,
            CliMemoryType::Belief => MemoryType::Belief,
            CliMemoryType::Pattern => MemoryType::Pattern,
            CliMemoryType::Episodic => MemoryType::Episodic,
            CliMemoryType::Semantic => MemoryType::Semantic,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum CliImportance {
    Low,
    Medium,
    High,
}

impl From<CliImportance> for Importance {
    fn from(cli: CliImportance) -> Self {
        match cli {
            CliImportance::Low => Importance::Low,
            CliImportance::Medium => Importance::Medium,
            CliImportance::High => Importance::High,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let refinery = Refinery::open(&cli.data_dir, config).await?;
    let index = cli.index.as_str();

    match cli.command {
        Commands::Add {
            text,
            memory_type,
            importance,
            valid_at,
            id,
            tags,
        } => {
            cmd_add(
                &refinery,
                index,
                text,
                memory_type,
                importance,
                valid_at,
                id,
                tags,
            )
            .await
        }
        Commands::Priority { id } => cmd_priority(&refinery, index, &id, cli.json).await,
        Commands::Access { id } => cmd_access(&refinery, index, &id).await,
        Commands::Windows => cmd_windows(&refinery, index, cli.json).await,
        Commands::Consolidate {
            policy,
            dry_run,
            skip_existing,
        } => cmd_consolidate(&refinery, index, policy, dry_run, skip_existing, cli.json).await,
        Commands::Apply { plan, dry_run } => cmd_apply(&refinery, index, &plan, dry_run, cli.json).await,
        Commands::Reconsolidate { plan, valid_ids } => {
            cmd_reconsolidate(&refinery, index, &plan, valid_ids, cli.json).await
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "info,memory_refinery=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_add(
    refinery: &Refinery,
    index: &str,
    text: String,
    memory_type: CliMemoryType,
    importance: Option<CliImportance>,
    valid_at: Option<String>,
    id: Option<String>,
    tags: Vec<String>,
) -> anyhow::Result<()> {
    let mut record = MemoryRecord::new(text, memory_type.into());
    if let Some(id) = id {
        record = record.with_id(id);
    }
    if let Some(importance) = importance {
        record = record.with_importance(importance.into());
    }
    if let Some(raw) = valid_at {
        let at = parse_timestamp(&raw).with_context(|| format!("unrecognized timestamp '{raw}'"))?;
        record = record.with_valid_at(at);
    }

    let defaults = UpsertDefaults {
        source: Some("cli".to_string()),
        tags,
    };
    let ids = refinery
        .add_memories(index, std::slice::from_ref(&record), Some(&defaults))
        .await?;

    println!("{}", "Memory added successfully".green().bold());
    for id in ids {
        println!("  ID:    {}", id.cyan());
    }
    println!("  Type:  {}", format!("{:?}", record.metadata.memory_type).cyan());
    println!("  Index: {}", index);
    Ok(())
}

async fn cmd_priority(refinery: &Refinery, index: &str, id: &str, json: bool) -> anyhow::Result<()> {
    let breakdown = refinery.priority(index, id, Utc::now()).await?;
    if json {
        return print_json(&breakdown);
    }

    println!("{}", format!("Priority of {id}").bold().underline());
    println!("  Score:      {}", format!("{:.3}", breakdown.score).green().bold());
    println!(
        "  Recency:    {:.3} x {:.2}",
        breakdown.recency, breakdown.weights.recency
    );
    println!(
        "  Importance: {:.3} x {:.2}",
        breakdown.importance, breakdown.weights.importance
    );
    println!("  Usage:      {:.3} x {:.2}", breakdown.usage, breakdown.weights.usage);
    println!(
        "  Emotion:    {:.3} x {:.2}",
        breakdown.emotion, breakdown.weights.emotion
    );
    if breakdown.floored {
        println!("  {}", "Raised to the canonical floor".yellow());
    }
    Ok(())
}

async fn cmd_access(refinery: &Refinery, index: &str, id: &str) -> anyhow::Result<()> {
    let record = refinery.record_access(index, id, Utc::now()).await?;
    let dynamics = &record.metadata.dynamics;
    println!(
        "{} {} accessed {} times, priority {:.3}",
        "*".green(),
        record.id.cyan(),
        dynamics.access_count,
        dynamics.current_priority
    );
    Ok(())
}

async fn cmd_windows(refinery: &Refinery, index: &str, json: bool) -> anyhow::Result<()> {
    let detection = refinery.detect_windows(index).await?;
    if json {
        return print_json(&detection);
    }

    if detection.windows.is_empty() {
        println!("{}", "No windows found".yellow());
    } else {
        println!(
            "{}",
            format!("Found {} windows:", detection.windows.len()).bold().green()
        );
    }
    for (pos, window) in detection.windows.iter().enumerate() {
        let members = detection.members.get(pos).map_or(0, Vec::len);
        println!(
            "  {} {} memories, ~{} summaries {}",
            window.window_id(pos).cyan(),
            members,
            window.expected_summary_count.unwrap_or(1),
            window.focus.as_deref().unwrap_or_default().dimmed()
        );
    }

    let stats = &detection.stats;
    println!();
    println!(
        "  {} total, {} noise, {} without a usable timestamp",
        stats.total_memories, stats.noise, stats.discarded
    );
    Ok(())
}

async fn cmd_consolidate(
    refinery: &Refinery,
    index: &str,
    policy: Option<TemporalPolicy>,
    dry_run: bool,
    skip_existing: bool,
    json: bool,
) -> anyhow::Result<()> {
    let args = ConsolidateArgs {
        temporal_policy: policy,
        dry_run,
        skip_existing,
        ..ConsolidateArgs::default()
    };
    let result = refinery.consolidate(index, &args).await?;
    if json {
        return print_json(&result);
    }

    print_status(&result);
    for window in result.windows.iter().flatten() {
        let status = match window.status {
            WindowStatus::Completed => "completed".green(),
            WindowStatus::Planned => "planned".cyan(),
            WindowStatus::Skipped => "skipped".yellow(),
            WindowStatus::Failed => "failed".red(),
        };
        println!(
            "  {} [{}] {} sources, policy {}",
            window.window_id, status, window.source_count, window.policy_applied
        );
        for warning in &window.validator_warnings {
            println!("    {} {}", "!".yellow(), warning);
        }
        if let Some(reason) = &window.reason {
            println!("    {}", reason.dimmed());
        }
    }
    Ok(())
}

async fn cmd_apply(refinery: &Refinery, index: &str, plan: &Path, dry_run: bool, json: bool) -> anyhow::Result<()> {
    let actions = match read_json(plan)? {
        Value::Array(actions) => actions,
        Value::Object(mut object) => match object.remove("actions") {
            Some(Value::Array(actions)) => actions,
            _ => anyhow::bail!("{} has no \"actions\" array", plan.display()),
        },
        _ => anyhow::bail!("{} must hold an action array", plan.display()),
    };

    let result = refinery.apply_actions(index, &actions, dry_run).await;
    if json {
        return print_json(&result);
    }

    print_status(&result);
    for outcome in result.actions.iter().flatten() {
        let status = match outcome.status {
            ActionStatus::Applied => "applied".green(),
            ActionStatus::Planned => "planned".cyan(),
            ActionStatus::Skipped => "skipped".yellow(),
        };
        let kind = outcome.kind.map(|k| k.to_string()).unwrap_or_else(|| "?".to_string());
        println!("  #{} {} [{}] {}", outcome.index, kind, status, outcome.memory_ids.join(", "));
        for error in &outcome.errors {
            println!("    {} {}", "x".red(), error);
        }
        for warning in &outcome.warnings {
            println!("    {} {}", "!".yellow(), warning);
        }
    }
    Ok(())
}

async fn cmd_reconsolidate(
    refinery: &Refinery,
    index: &str,
    plan: &Path,
    valid_ids: Vec<String>,
    json: bool,
) -> anyhow::Result<()> {
    let plan: ReconsolidationPlan = serde_json::from_value(read_json(plan)?)
        .with_context(|| format!("{} is not a reconsolidation plan", plan.display()))?;

    let report = refinery.reconsolidate(index, &plan, &valid_ids).await;
    if json {
        return print_json(&report);
    }

    println!("{}", "Reconsolidation finished".bold().green());
    println!("  Created:     {}", report.created_memory_ids.len());
    println!("  Superseded:  {}", report.superseded_pairs.len());
    println!("  Sleep cycle: {}", report.sleep_cycle_incremented_ids.len());
    println!("  Took:        {}ms", report.duration_ms);
    if let Some(notes) = &report.notes {
        println!("  {}", notes.yellow());
    }
    Ok(())
}

fn print_status(result: &RefineMemoriesResult) {
    let status = match result.status {
        RefineStatus::Ok => "ok".green().bold(),
        RefineStatus::BudgetReached => "budget reached".yellow().bold(),
        RefineStatus::Error => "error".red().bold(),
    };
    let mode = if result.dry_run { " (dry run)" } else { "" };
    println!("{} {}{}", "Status:".bold(), status, mode);
    if let Some(summary) = &result.summary {
        println!("  {}", summary);
    }
    if let Some(error) = &result.error {
        println!("  {}", error.red());
    }
}
