use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use crep_adapters::TopicCatalog;
use crep_core::MonthKey;
use crep_sync::{ReconcileVerdict, SyncConfig, SyncPipeline};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "crep-cli")]
#[command(about = "Monthly competency reconciliation and topic extraction")]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Args)]
struct Overrides {
    /// Target month as MM_YYYY; defaults to the month before today.
    #[arg(long, global = true)]
    month: Option<MonthKey>,
    /// Root holding one directory per month.
    #[arg(long, global = true)]
    data_root: Option<PathBuf>,
    /// Directory holding topics.yaml and the unit roster.
    #[arg(long, global = true)]
    workspace_root: Option<PathBuf>,
    /// Keep every competency status in the work-list, not only closed ones.
    #[arg(long, global = true)]
    all_statuses: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Full monthly run.
    Run,
    /// Refresh the competency snapshot only.
    FetchCompetencies,
    /// Decide copy or process mode and write the work-list.
    Reconcile,
    /// Consolidate already extracted topic files.
    Merge,
    /// List the topic catalog.
    Topics,
}

impl Overrides {
    fn apply(&self, mut config: SyncConfig) -> SyncConfig {
        if let Some(month) = self.month {
            config.target_month = month;
        }
        if let Some(root) = &self.data_root {
            config.data_root = root.clone();
        }
        if let Some(root) = &self.workspace_root {
            config.roster_path = root.join("unidades_tokens.csv");
            config.workspace_root = root.clone();
        }
        if self.all_statuses {
            config.closed_only = false;
        }
        config
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = cli.overrides.apply(SyncConfig::from_env());
    tracing::info!(
        month = %config.target_month,
        data_root = %config.data_root.display(),
        workspace_root = %config.workspace_root.display(),
        closed_only = config.closed_only,
        "configuration loaded"
    );

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = SyncPipeline::new(config)?.run_once().await?;
            println!(
                "run complete: run_id={} month={} mode={} work_items={} files={} requests={} success={} manifest={}",
                summary.run_id,
                summary.month,
                summary.mode,
                summary.work_items,
                summary.files.len(),
                summary.outcomes.total,
                summary.outcomes.success,
                summary.manifest.as_deref().unwrap_or("-")
            );
        }
        Commands::FetchCompetencies => {
            let month = config.target_month;
            match SyncPipeline::new(config)?.fetch_competencies().await? {
                Some(path) => println!("competencies for {month}: {}", path.display()),
                None => println!("competencies for {month}: nothing collected"),
            }
        }
        Commands::Reconcile => {
            let month = config.target_month;
            match SyncPipeline::new(config)?.reconcile()? {
                ReconcileVerdict::Copy(reason) => println!("{month}: copy ({reason:?})"),
                ReconcileVerdict::Process { work_list, entries } => {
                    println!("{month}: process {entries} entries -> {}", work_list.display())
                }
            }
        }
        Commands::Merge => {
            for (topic, outcome) in SyncPipeline::new(config)?.merge_all() {
                println!("{topic}: {}", serde_json::to_string(&outcome_label(&outcome))?);
            }
        }
        Commands::Topics => {
            let catalog = TopicCatalog::load(&config.catalog_path())?;
            for topic in &catalog.topics {
                println!(
                    "{}\t{}\t{:?}\t{}",
                    topic.id,
                    if topic.enabled { "enabled" } else { "disabled" },
                    topic.scope,
                    topic.url_env
                );
            }
        }
    }

    Ok(())
}

fn outcome_label(outcome: &crep_sync::MergeOutcome) -> serde_json::Value {
    use crep_sync::{MergeOutcome, SkipReason};
    match outcome {
        MergeOutcome::Merged {
            path,
            new_rows,
            old_rows,
            merged_rows,
            ..
        } => serde_json::json!({
            "merged": path.display().to_string(),
            "new_rows": new_rows,
            "old_rows": old_rows,
            "rows": merged_rows,
        }),
        MergeOutcome::Skipped(SkipReason::CarriedForward(path)) => {
            serde_json::json!({ "carried_forward": path.display().to_string() })
        }
        MergeOutcome::Skipped(reason) => serde_json::json!({ "skipped": format!("{reason:?}") }),
        MergeOutcome::Failed(err) => serde_json::json!({ "failed": err }),
    }
}
