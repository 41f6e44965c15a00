use std::collections::HashMap;

use chrono::Utc;

use crate::error::{ensure_range, EngineResult};
use crate::models::{ModelMetrics, ModelType};
use crate::store::EngineStore;

/// Quality figures asserted for each model. These are configured values from
/// offline evaluation, not computed from stored predictions.
/// Columns: accuracy, precision, recall, f1, roc_auc.
const BASELINE: [(&str, [f64; 5]); 5] = [
    ("holistic", [0.94, 0.93, 0.92, 0.925, 0.97]),
    ("temporal", [0.91, 0.90, 0.89, 0.895, 0.95]),
    ("hybrid", [0.92, 0.91, 0.90, 0.905, 0.96]),
    ("", [0.89, 0.88, 0.87, 0.875, 0.93]),
    ("rule-based", [0.86, 0.85, 0.86, 0.855, 0.91]),
];

/// The configured metrics table for `week_number`. The blank label row is
/// filed under the active ML variant's name.
pub fn baseline_table(week_number: i32, ml_model: &str) -> Vec<ModelMetrics> {
    let recorded_at = Utc::now();
    BASELINE
        .iter()
        .map(|(label, [accuracy, precision, recall, f1_score, roc_auc])| ModelMetrics {
            model_type: ModelType::from(if label.is_empty() { ml_model } else { *label }),
            week_number,
            accuracy: *accuracy,
            precision: *precision,
            recall: *recall,
            f1_score: *f1_score,
            roc_auc: *roc_auc,
            recorded_at,
        })
        .collect()
}

pub fn validate(metrics: &ModelMetrics) -> EngineResult<()> {
    ensure_range("accuracy", metrics.accuracy, 0.0, 1.0)?;
    ensure_range("precision", metrics.precision, 0.0, 1.0)?;
    ensure_range("recall", metrics.recall, 0.0, 1.0)?;
    ensure_range("f1_score", metrics.f1_score, 0.0, 1.0)?;
    ensure_range("roc_auc", metrics.roc_auc, 0.0, 1.0)?;
    Ok(())
}

pub struct MetricsRecorder<'a, S: EngineStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: EngineStore + ?Sized> MetricsRecorder<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Appends a row as supplied. Values outside [0, 1] are rejected.
    pub async fn record(&self, metrics: &ModelMetrics) -> EngineResult<()> {
        validate(metrics)?;
        self.store.record_metrics(metrics).await?;
        tracing::debug!(
            model = %metrics.model_type,
            week = metrics.week_number,
            f1 = metrics.f1_score,
            "recorded model metrics"
        );
        Ok(())
    }

    pub async fn record_all(&self, rows: &[ModelMetrics]) -> EngineResult<usize> {
        for row in rows {
            self.record(row).await?;
        }
        Ok(rows.len())
    }

    pub async fn recent(&self, limit: usize) -> EngineResult<Vec<ModelMetrics>> {
        Ok(self.store.recent_metrics(limit).await?)
    }

    /// One row per model for the week (the last one recorded), ranked by F1
    /// then ROC-AUC, ties by label.
    pub async fn compare(&self, week_number: i32) -> EngineResult<Vec<ModelMetrics>> {
        let rows = self.store.metrics_for_week(week_number).await?;
        let mut latest: HashMap<ModelType, ModelMetrics> = HashMap::new();
        for row in rows {
            latest.insert(row.model_type.clone(), row);
        }

        let mut ranked: Vec<ModelMetrics> = latest.into_values().collect();
        ranked.sort_by(|a, b| {
            b.f1_score
                .total_cmp(&a.f1_score)
                .then(b.roc_auc.total_cmp(&a.roc_auc))
                .then(a.model_type.as_str().cmp(b.model_type.as_str()))
        });
        Ok(ranked)
    }
}
