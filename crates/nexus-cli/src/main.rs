//! Thin CLI over the research orchestration core.
//!
//! Exit codes: 0 success, 64 configuration error, 69 external dependency
//! unavailable, 70 internal invariant violated, 130 cancelled.

mod demo;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::error;

use nexus::error::ErrorKind;
use nexus::model::{AggregationConfig, ResearchType, TaskStatus};
use nexus::{NexusConfig, NexusContext, Orchestrator, Store, TaskRequest};

const EX_OK: u8 = 0;
const EX_CONFIG: u8 = 64;
const EX_UNAVAILABLE: u8 = 69;
const EX_SOFTWARE: u8 = 70;
const EX_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(name = "nexus", about = "Multi-agent deep-research orchestration", version)]
struct Cli {
    /// SQLite database path.
    #[arg(long, global = true, default_value = "nexus.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliResearchType {
    AnalyticalReport,
    DataAggregation,
}

impl From<CliResearchType> for ResearchType {
    fn from(value: CliResearchType) -> Self {
        match value {
            CliResearchType::AnalyticalReport => ResearchType::AnalyticalReport,
            CliResearchType::DataAggregation => ResearchType::DataAggregation,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a task and drive it to completion.
    Run {
        #[arg(long)]
        query: String,

        #[arg(long)]
        title: Option<String>,

        #[arg(long = "type", value_enum, default_value = "analytical-report")]
        research_type: CliResearchType,

        #[arg(long)]
        project: Option<String>,

        /// Entity kinds for data aggregation, comma separated.
        #[arg(long)]
        entities: Option<String>,

        /// Attribute columns for data aggregation, comma separated.
        #[arg(long)]
        attributes: Option<String>,

        #[arg(long)]
        search_space: Option<String>,

        #[arg(long)]
        domain_hint: Option<String>,

        /// Run against deterministic offline providers.
        #[arg(long)]
        demo: bool,
    },

    /// Print a task with its counts and DOK stats.
    Show { task_id: String },

    /// Print the task's entity table as CSV.
    Export { task_id: String },

    /// Print the task's report.
    Report { task_id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("nexus=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match NexusConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(EX_CONFIG);
        }
    };

    match run(cli, config).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(EX_SOFTWARE)
        }
    }
}

async fn run(cli: Cli, config: NexusConfig) -> Result<u8> {
    let store = Store::open(&cli.db).await?;

    match cli.command {
        Commands::Run {
            query,
            title,
            research_type,
            project,
            entities,
            attributes,
            search_space,
            domain_hint,
            demo,
        } => {
            let gateway = if demo {
                demo::demo_gateway(&config)
            } else {
                // Live MCP adapters plug in through the library API; the
                // CLI itself ships none.
                error!("no live providers are configured; use --demo or embed the library");
                return Ok(EX_UNAVAILABLE);
            };

            let research_type: ResearchType = research_type.into();
            let aggregation_config = match research_type {
                ResearchType::DataAggregation => Some(AggregationConfig {
                    entities: split_csv(entities.as_deref()),
                    attributes: split_csv(attributes.as_deref()),
                    search_space: search_space.unwrap_or_default(),
                    domain_hint,
                }),
                ResearchType::AnalyticalReport => None,
            };

            let bus = nexus::EventBus::new(1024, config.event_max_bytes);
            let ctx = NexusContext::new(config, store, bus, gateway);
            let orchestrator = Orchestrator::start(ctx);

            let task = orchestrator
                .create_task(TaskRequest {
                    title: title.unwrap_or_else(|| query.clone()),
                    research_query: query,
                    research_type,
                    project_id: project,
                    aggregation_config,
                })
                .await?;
            println!("task {} created", task.id);

            let finished = tokio::select! {
                result = orchestrator.run_task(&task.id) => result?,
                _ = tokio::signal::ctrl_c() => {
                    orchestrator.cancel_task(&task.id).await;
                    orchestrator.shutdown().await;
                    eprintln!("cancelled");
                    return Ok(EX_CANCELLED);
                }
            };

            let code = match finished.status {
                TaskStatus::Completed => {
                    match finished.research_type {
                        ResearchType::AnalyticalReport => {
                            if let Some(report) =
                                orchestrator.context().store.get_report(&task.id).await?
                            {
                                println!("{report}");
                            }
                        }
                        ResearchType::DataAggregation => {
                            for artifact in
                                orchestrator.context().store.list_artifacts(&task.id).await?
                            {
                                println!("exported {}", artifact.path);
                            }
                        }
                    }
                    EX_OK
                }
                _ => {
                    let message = finished.error_message.unwrap_or_default();
                    eprintln!("task failed: {message}");
                    exit_code_for_message(&message)
                }
            };

            orchestrator.shutdown().await;
            Ok(code)
        }

        Commands::Show { task_id } => {
            let Some(task) = store.get_task(&task_id).await? else {
                eprintln!("task {task_id} not found");
                return Ok(EX_SOFTWARE);
            };
            let counts = store.task_counts(&task_id).await?;
            let stats = store.dok_stats(&task_id).await?;
            let view = serde_json::json!({
                "task": task,
                "counts": counts,
                "dok_stats": stats,
            });
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(EX_OK)
        }

        Commands::Export { task_id } => {
            let Some(task) = store.get_task(&task_id).await? else {
                eprintln!("task {task_id} not found");
                return Ok(EX_SOFTWARE);
            };
            let scope = task.project_id.clone().unwrap_or_else(|| task.id.clone());
            let entities = store.list_entities(&scope, None).await?;
            let csv = nexus::export::render_csv(&entities)
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            print!("{}", String::from_utf8_lossy(&csv));
            Ok(EX_OK)
        }

        Commands::Report { task_id } => match store.get_report(&task_id).await? {
            Some(report) => {
                println!("{report}");
                Ok(EX_OK)
            }
            None => {
                eprintln!("no report for task {task_id}");
                Ok(EX_SOFTWARE)
            }
        },
    }
}

fn split_csv(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Task error messages carry their kind as a prefix; map it back onto the
/// conventional exit codes.
fn exit_code_for_message(message: &str) -> u8 {
    let kind = message
        .split(':')
        .next()
        .and_then(|prefix| prefix.trim().parse::<ErrorKind>().ok());
    match kind {
        Some(ErrorKind::Config) => EX_CONFIG,
        Some(ErrorKind::ProviderDegraded) => EX_UNAVAILABLE,
        Some(ErrorKind::Cancelled) => EX_CANCELLED,
        _ => EX_SOFTWARE,
    }
}
