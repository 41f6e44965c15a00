use std::io::Read;
use std::path::Path;

use anyhow::Context;
use chrono::Utc;
use serde::Deserialize;

use crate::models::{ModelMetrics, ModelType};

#[derive(Debug, Clone, Deserialize)]
pub struct PerformanceRow {
    pub full_name: String,
    pub email: String,
    pub cohort: String,
    pub subject: String,
    pub week_number: i32,
    pub attendance: f64,
    pub grade: f64,
    pub engagement: f64,
    pub behavior_score: f64,
    pub assignments_completed: i32,
    pub assignments_total: i32,
}

#[derive(Debug, Clone, Deserialize)]
struct MetricsRow {
    model_type: String,
    week_number: i32,
    accuracy: f64,
    precision: f64,
    recall: f64,
    f1_score: f64,
    roc_auc: f64,
}

pub fn read_performance(path: &Path) -> anyhow::Result<Vec<PerformanceRow>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    parse_performance(file)
}

pub fn parse_performance<R: Read>(input: R) -> anyhow::Result<Vec<PerformanceRow>> {
    let mut reader = csv::Reader::from_reader(input);
    let mut rows = Vec::new();
    for (index, result) in reader.deserialize::<PerformanceRow>().enumerate() {
        rows.push(result.with_context(|| format!("invalid performance row {}", index + 1))?);
    }
    Ok(rows)
}

pub fn read_metrics(path: &Path) -> anyhow::Result<Vec<ModelMetrics>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    parse_metrics(file)
}

pub fn parse_metrics<R: Read>(input: R) -> anyhow::Result<Vec<ModelMetrics>> {
    let mut reader = csv::Reader::from_reader(input);
    let recorded_at = Utc::now();
    let mut rows = Vec::new();
    for (index, result) in reader.deserialize::<MetricsRow>().enumerate() {
        let row = result.with_context(|| format!("invalid metrics row {}", index + 1))?;
        rows.push(ModelMetrics {
            model_type: ModelType::from(row.model_type.trim()),
            week_number: row.week_number,
            accuracy: row.accuracy,
            precision: row.precision,
            recall: row.recall,
            f1_score: row.f1_score,
            roc_auc: row.roc_auc,
            recorded_at,
        });
    }
    Ok(rows)
}
