use std::fmt::Write;

use crate::models::{ModelMetrics, ModelType, RiskLevel, StudentRisk};
use crate::store::EngineStore;

#[derive(Debug, Clone, PartialEq)]
pub struct RiskLevelSummary {
    pub risk_level: RiskLevel,
    pub count: usize,
    pub avg_probability: f64,
}

/// One entry per risk level, low to critical, including empty bands.
pub fn summarize_by_level(rows: &[StudentRisk]) -> Vec<RiskLevelSummary> {
    RiskLevel::ALL
        .iter()
        .map(|level| {
            let probabilities: Vec<f64> = rows
                .iter()
                .filter(|row| row.prediction.risk_level == *level)
                .map(|row| row.prediction.dropout_probability)
                .collect();
            RiskLevelSummary {
                risk_level: *level,
                count: probabilities.len(),
                avg_probability: if probabilities.is_empty() {
                    0.0
                } else {
                    probabilities.iter().sum::<f64>() / probabilities.len() as f64
                },
            }
        })
        .collect()
}

/// Each student's stored prediction for `model_type` in that week.
pub async fn collect_rows<S: EngineStore + ?Sized>(
    store: &S,
    week_number: i32,
    model_type: &ModelType,
) -> anyhow::Result<Vec<StudentRisk>> {
    let mut rows = Vec::new();
    for student_id in store.students_for_week(week_number).await? {
        let Some(prediction) = store
            .get_prediction(student_id, model_type, week_number)
            .await?
        else {
            continue;
        };
        let student_name = store
            .student_name(student_id)
            .await?
            .unwrap_or_else(|| student_id.to_string());
        rows.push(StudentRisk {
            student_id,
            student_name,
            prediction,
        });
    }
    Ok(rows)
}

pub fn build_report(
    week_number: i32,
    model_type: &ModelType,
    rows: &[StudentRisk],
    metrics: &[ModelMetrics],
) -> String {
    let summaries = summarize_by_level(rows);
    let mut output = String::new();

    let _ = writeln!(output, "# Dropout Risk Report");
    let _ = writeln!(
        output,
        "Generated for week {} using the {} model ({} students)",
        week_number,
        model_type,
        rows.len()
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Risk Distribution");

    if rows.is_empty() {
        let _ = writeln!(output, "No predictions recorded for this week.");
    } else {
        for summary in summaries.iter() {
            let _ = writeln!(
                output,
                "- {}: {} students (avg probability {:.2})",
                summary.risk_level, summary.count, summary.avg_probability
            );
        }
    }

    let mut ranked: Vec<&StudentRisk> = rows.iter().collect();
    ranked.sort_by(|a, b| {
        b.prediction
            .dropout_probability
            .total_cmp(&a.prediction.dropout_probability)
            .then(a.student_id.cmp(&b.student_id))
    });
    let _ = writeln!(output);
    let _ = writeln!(output, "## Highest Risk Students");

    if ranked.is_empty() {
        let _ = writeln!(output, "No students scored for this week.");
    } else {
        for row in ranked.iter().take(10) {
            let _ = writeln!(
                output,
                "- {} ({}) probability {:.2}: {}",
                row.student_name,
                row.prediction.risk_level,
                row.prediction.dropout_probability,
                row.prediction.explanation
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Model Comparison");

    if metrics.is_empty() {
        let _ = writeln!(output, "No model metrics recorded for this week.");
    } else {
        let _ = writeln!(output, "| Model | Accuracy | Precision | Recall | F1 | ROC-AUC |");
        let _ = writeln!(output, "|---|---|---|---|---|---|");
        for row in metrics {
            let _ = writeln!(
                output,
                "| {} | {:.3} | {:.3} | {:.3} | {:.3} | {:.3} |",
                row.model_type, row.accuracy, row.precision, row.recall, row.f1_score, row.roc_auc
            );
        }
    }

    output
}
