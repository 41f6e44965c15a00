use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod config;
mod db;
mod error;
mod features;
mod import;
mod metrics;
mod models;
mod pipeline;
mod report;
mod risk;
mod scoring;
mod seed;
mod store;

use config::{EngineConfig, RetryPolicy};
use metrics::MetricsRecorder;
use models::ModelType;
use pipeline::{Pipeline, WeekSummary};
use store::{EngineStore, MemoryStore};

#[derive(Parser)]
#[command(name = "dropout-risk")]
#[command(about = "Dropout-risk scoring and model metrics for student cohorts", long_about = None)]
struct Cli {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,
    /// Label of the simulated-ML model the hybrid combines with
    #[arg(long, env = "DROPOUT_ML_MODEL", default_value = scoring::DEFAULT_ML_MODEL, global = true)]
    ml_model: String,
    /// Students scored concurrently
    #[arg(long, default_value_t = 8, global = true)]
    concurrency: usize,
    /// Attempts at reading the hybrid model's inputs
    #[arg(long, default_value_t = 1, global = true)]
    hybrid_retries: u32,
    #[arg(long, default_value_t = 250, global = true)]
    hybrid_retry_delay_ms: u64,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load sample students and the baseline metrics table
    Seed,
    /// Import performance rows from a CSV file
    ImportPerformance {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Import model metrics rows from a CSV file
    ImportMetrics {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Run every model for a week
    Score {
        #[arg(long)]
        week: i32,
        /// Score a single student instead of the whole week
        #[arg(long)]
        student: Option<Uuid>,
    },
    /// Show a student's latest predictions
    Predictions {
        #[arg(long)]
        student: Uuid,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Print the predictions as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show recorded model metrics
    Metrics {
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Rank one week's models instead of listing recent rows
        #[arg(long)]
        week: Option<i32>,
    },
    /// Generate a markdown report
    Report {
        #[arg(long)]
        week: i32,
        #[arg(long, default_value = "holistic")]
        model: String,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Score the sample data in memory and print a report
    Demo {
        #[arg(long, default_value_t = 2)]
        week: i32,
    },
}

impl Cli {
    fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let config = EngineConfig {
            ml_model: self.ml_model.trim().to_string(),
            concurrency: self.concurrency,
            hybrid_retry: RetryPolicy {
                attempts: self.hybrid_retries,
                delay: Duration::from_millis(self.hybrid_retry_delay_ms),
            },
        };
        config.validate()?;
        Ok(config)
    }
}

async fn connect(database_url: Option<&str>) -> anyhow::Result<PgPool> {
    let database_url =
        database_url.context("DATABASE_URL must be set to a production Postgres instance")?;
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

fn print_summary(summary: &WeekSummary) {
    if summary.runs.is_empty() && summary.failed.is_empty() {
        println!("No performance rows found for this week.");
        return;
    }

    for run in &summary.runs {
        println!("Student {} (week {}):", run.student_id, run.week_number);
        for outcome in &run.outcomes {
            match &outcome.result {
                Ok(prediction) => println!(
                    "- {}: {} ({:.2}, confidence {:.2}){}",
                    outcome.model_type,
                    prediction.risk_level,
                    prediction.dropout_probability,
                    prediction.confidence,
                    if outcome.already_scored { " (already scored)" } else { "" }
                ),
                Err(err) => println!("- {}: unavailable ({err})", outcome.model_type),
            }
        }
    }
    for (student_id, err) in &summary.failed {
        println!("Student {student_id}: failed ({err})");
    }
    println!(
        "Recorded {} predictions for {} students.",
        summary.recorded_count(),
        summary.runs.len()
    );
}

async fn run_demo(config: EngineConfig, week: i32) -> anyhow::Result<()> {
    let data = seed::sample()?;
    let store = MemoryStore::new();
    for student in &data.students {
        store.add_student(student.id, student.full_name).await;
    }
    for record in data.performance {
        store.add_performance(record).await;
    }
    for state in data.gamification {
        store.set_gamification(state).await;
    }

    let recorder = MetricsRecorder::new(&store);
    recorder
        .record_all(&metrics::baseline_table(week, &config.ml_model))
        .await?;

    let pipeline = Pipeline::new(&store, config);
    let summary = pipeline.score_week(week).await?;
    print_summary(&summary);

    let model = ModelType::Holistic;
    let rows = report::collect_rows(&store, week, &model).await?;
    let comparison = recorder.compare(week).await?;
    println!();
    print!("{}", report::build_report(week, &model, &rows, &comparison));
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.engine_config()?;

    if let Commands::Demo { week } = cli.command {
        return run_demo(config, week).await;
    }

    let pool = connect(cli.database_url.as_deref()).await?;
    let store = db::PgStore::new(pool);

    match cli.command {
        Commands::InitDb => {
            db::init_db(store.pool()).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let data = seed::sample()?;
            let inserted = db::seed(store.pool(), &data).await?;
            let recorder = MetricsRecorder::new(&store);
            let weeks: std::collections::BTreeSet<i32> =
                data.performance.iter().map(|r| r.week_number).collect();
            for week in weeks {
                recorder
                    .record_all(&metrics::baseline_table(week, &config.ml_model))
                    .await?;
            }
            println!("Seed data inserted ({inserted} new performance rows).");
        }
        Commands::ImportPerformance { csv } => {
            let rows = import::read_performance(&csv)?;
            let inserted = db::import_performance(store.pool(), &rows).await?;
            println!("Inserted {inserted} performance rows from {}.", csv.display());
        }
        Commands::ImportMetrics { csv } => {
            let rows = import::read_metrics(&csv)?;
            let recorded = MetricsRecorder::new(&store)
                .record_all(&rows)
                .await
                .with_context(|| format!("failed to import {}", csv.display()))?;
            println!("Recorded {recorded} metrics rows from {}.", csv.display());
        }
        Commands::Score { week, student } => {
            let pipeline = Pipeline::new(&store, config);
            let summary = match student {
                Some(student_id) => {
                    let run = pipeline.score_student(student_id, week).await?;
                    WeekSummary {
                        runs: vec![run],
                        failed: Vec::new(),
                    }
                }
                None => pipeline.score_week(week).await?,
            };
            print_summary(&summary);
        }
        Commands::Predictions {
            student,
            limit,
            json,
        } => {
            let predictions = store.latest_predictions(student, limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&predictions)?);
                return Ok(());
            }
            if predictions.is_empty() {
                println!("No predictions recorded for {student}.");
                return Ok(());
            }
            for prediction in predictions {
                println!(
                    "- week {} {}: {} ({:.2}) {}",
                    prediction.week_number,
                    prediction.model_type,
                    prediction.risk_level,
                    prediction.dropout_probability,
                    prediction.explanation
                );
            }
        }
        Commands::Metrics { limit, week } => {
            let recorder = MetricsRecorder::new(&store);
            let rows = match week {
                Some(week) => recorder.compare(week).await?,
                None => recorder.recent(limit).await?,
            };
            if rows.is_empty() {
                println!("No model metrics recorded.");
                return Ok(());
            }
            for row in rows {
                println!(
                    "- week {} {}: accuracy {:.3}, precision {:.3}, recall {:.3}, f1 {:.3}, roc-auc {:.3}",
                    row.week_number,
                    row.model_type,
                    row.accuracy,
                    row.precision,
                    row.recall,
                    row.f1_score,
                    row.roc_auc
                );
            }
        }
        Commands::Report { week, model, out } => {
            let model = ModelType::from(model.trim());
            let rows = report::collect_rows(&store, week, &model).await?;
            let comparison = MetricsRecorder::new(&store).compare(week).await?;
            let report = report::build_report(week, &model, &rows, &comparison);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Demo { .. } => {}
    }

    Ok(())
}
