use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing::info;

use kgdedup::config::{DedupConfig, OracleBackend};
use kgdedup::db::Database;
use kgdedup::dedup::{build_clusters, find_candidates, report, Deduplicator, StoreStats};
use kgdedup::entity::EntityType;

#[derive(Parser)]
#[command(author, version, about = "Find and merge duplicate entities in a knowledge graph", long_about = None)]
struct Cli {
    /// SQLite knowledge-graph database (overrides DATABASE_PATH)
    #[arg(long, global = true)]
    database: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect, verify and merge duplicates
    Run {
        /// Entity type (topic, person, project, institution, method, application) or "all"
        #[arg(short, long, default_value = "all")]
        entity_type: String,

        /// Compute the merge plan without changing the database
        #[arg(long)]
        dry_run: bool,

        /// Cosine similarity threshold for embedding candidates (0.0-1.0)
        #[arg(short, long)]
        threshold: Option<f64>,

        /// Number of concurrent verification workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// Lexical matching only
        #[arg(long)]
        no_embeddings: bool,

        /// Verification oracle (llm, heuristic)
        #[arg(long)]
        oracle: Option<String>,

        /// Audit log file (overrides DEDUP_AUDIT_LOG)
        #[arg(long)]
        audit_log: Option<PathBuf>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show candidate pairs and clusters without verifying or merging
    Candidates {
        /// Entity type or "all"
        #[arg(short, long, default_value = "all")]
        entity_type: String,

        /// Cosine similarity threshold for embedding candidates (0.0-1.0)
        #[arg(short, long)]
        threshold: Option<f64>,

        /// Lexical matching only
        #[arg(long)]
        no_embeddings: bool,
    },

    /// Display entity and relationship counts
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

fn parse_entity_types(raw: &str) -> Result<Vec<EntityType>> {
    if raw.trim().eq_ignore_ascii_case("all") {
        return Ok(EntityType::ALL.to_vec());
    }
    raw.parse::<EntityType>()
        .map(|entity_type| vec![entity_type])
        .map_err(|e| anyhow!(e))
}

#[tokio::main]
async fn main() -> Result<()> {
    kgdedup::logging::configure_logging();

    let cli = Cli::parse();
    let mut config = DedupConfig::from_env().context("Invalid configuration")?;
    if let Some(database) = cli.database {
        config.database_path = database;
    }

    match cli.command {
        Commands::Run {
            entity_type,
            dry_run,
            threshold,
            workers,
            no_embeddings,
            oracle,
            audit_log,
            json,
        } => {
            let entity_types = parse_entity_types(&entity_type)?;
            config.dry_run = dry_run;
            if let Some(threshold) = threshold {
                config.embedding_threshold = threshold;
            }
            if let Some(workers) = workers {
                config.workers = workers;
            }
            if no_embeddings {
                config.use_embeddings = false;
            }
            if let Some(oracle) = oracle {
                config.oracle = oracle.parse::<OracleBackend>().map_err(|e| anyhow!(e))?;
            }
            if let Some(audit_log) = audit_log {
                config.audit_log_path = audit_log;
            }
            config.validate().context("Invalid configuration")?;

            let db = Database::new(&config.database_path)
                .await
                .context("Failed to open database")?;
            let oracle = config
                .build_oracle(&db)
                .context("Failed to set up the verification oracle")?;

            info!(
                "Deduplicating {} entity types with the {} oracle{}",
                entity_types.len(),
                oracle.name(),
                if dry_run { " (dry run)" } else { "" }
            );

            let deduplicator = Deduplicator::new(db, oracle, config);
            let report = deduplicator
                .run(&entity_types)
                .await
                .context("Deduplication aborted")?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }

            if dry_run {
                println!("{}", "DRY RUN: no changes were written".yellow().bold());
            }
            report.summary_table().printstd();
            if report.types.iter().any(|t| !t.plans.is_empty()) {
                report.plans_table().printstd();
            }

            let errors = report.total_merge_errors();
            if errors > 0 {
                println!("{}", format!("{} merge units failed and were rolled back:", errors).red());
                for error in report.types.iter().flat_map(|t| t.merge_errors.iter()) {
                    println!("  - {}", error);
                }
            } else if !dry_run {
                if let Some(audit) = deduplicator.audit_log() {
                    println!(
                        "{} {}",
                        "Audit log:".bright_blue(),
                        audit.path().display()
                    );
                }
            }
        }

        Commands::Candidates {
            entity_type,
            threshold,
            no_embeddings,
        } => {
            let entity_types = parse_entity_types(&entity_type)?;
            if let Some(threshold) = threshold {
                config.embedding_threshold = threshold;
            }
            if no_embeddings {
                config.use_embeddings = false;
            }
            // No oracle is consulted here
            config.oracle = OracleBackend::Heuristic;
            config.validate().context("Invalid configuration")?;

            let db = Database::new(&config.database_path)
                .await
                .context("Failed to open database")?;
            let settings = config.candidate_settings();

            for entity_type in entity_types {
                let entities = db.get_entities(entity_type).await?;
                let pairs = find_candidates(&db, entity_type, &settings).await?;
                let clusters = build_clusters(&pairs);

                println!(
                    "\n{} {} entities, {} candidate pairs, {} clusters",
                    entity_type.table().bold(),
                    entities.len(),
                    pairs.len(),
                    clusters.len()
                );
                if !clusters.is_empty() {
                    report::clusters_table(&entities, &clusters).printstd();
                }
            }
        }

        Commands::Stats { json } => {
            let db = Database::new(&config.database_path)
                .await
                .context("Failed to open database")?;
            let stats = StoreStats::collect(&db).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                stats.to_table().printstd();
                if stats.duplicate_relationships > 0 {
                    println!(
                        "{}",
                        format!(
                            "{} relationship rows violate uniqueness",
                            stats.duplicate_relationships
                        )
                        .red()
                    );
                }
            }
        }
    }

    Ok(())
}
