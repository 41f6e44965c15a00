use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const XP_PER_LEVEL: i64 = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub student_id: Uuid,
    pub subject: String,
    pub week_number: i32,
    /// Percentage of sessions attended, 0–100.
    pub attendance: f64,
    /// 0–100.
    pub grade: f64,
    /// Fraction of expected interaction completed, 0–1.
    pub engagement: f64,
    pub behavior_score: f64,
    pub assignments_completed: i32,
    pub assignments_total: i32,
}

/// Per-student, per-week averages. Attendance and grade are kept as 0–1
/// fractions; use the `_pct` accessors for the 0–100 view.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub attendance: f64,
    pub grade: f64,
    pub engagement: f64,
    pub behavior: f64,
    pub subject_count: usize,
    pub assignment_completion: Option<f64>,
}

impl FeatureVector {
    pub fn attendance_pct(&self) -> f64 {
        self.attendance * 100.0
    }

    pub fn grade_pct(&self) -> f64 {
        self.grade * 100.0
    }

    pub fn engagement_pct(&self) -> f64 {
        self.engagement * 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GamificationState {
    pub student_id: Uuid,
    pub xp: i64,
    pub streak: i32,
    pub badges: BTreeSet<String>,
    pub last_activity: DateTime<Utc>,
}

impl GamificationState {
    pub fn level(&self) -> i64 {
        self.xp.max(0) / XP_PER_LEVEL + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 4] = [
        RiskLevel::Low,
        RiskLevel::Medium,
        RiskLevel::High,
        RiskLevel::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            other => anyhow::bail!("unknown risk level '{other}'"),
        }
    }
}

/// Label a prediction or metrics row is filed under. Any label that is not
/// one of the built-in models names a simulated-ML variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ModelType {
    RuleBased,
    Hybrid,
    Holistic,
    Temporal,
    Ml(String),
}

impl ModelType {
    pub fn as_str(&self) -> &str {
        match self {
            ModelType::RuleBased => "rule-based",
            ModelType::Hybrid => "hybrid",
            ModelType::Holistic => "holistic",
            ModelType::Temporal => "temporal",
            ModelType::Ml(name) => name,
        }
    }
}

impl From<String> for ModelType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "rule-based" => ModelType::RuleBased,
            "hybrid" => ModelType::Hybrid,
            "holistic" => ModelType::Holistic,
            "temporal" => ModelType::Temporal,
            _ => ModelType::Ml(value),
        }
    }
}

impl From<&str> for ModelType {
    fn from(value: &str) -> Self {
        ModelType::from(value.to_string())
    }
}

impl From<ModelType> for String {
    fn from(value: ModelType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: Uuid,
    pub student_id: Uuid,
    pub model_type: ModelType,
    pub week_number: i32,
    pub dropout_probability: f64,
    pub risk_level: RiskLevel,
    pub confidence: f64,
    pub explanation: String,
    pub lhi: Option<f64>,
    pub features: FeatureVector,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub model_type: ModelType,
    pub week_number: i32,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub roc_auc: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Row backing the markdown report: a student's most recent prediction for
/// the model being reported on.
#[derive(Debug, Clone)]
pub struct StudentRisk {
    pub student_id: Uuid,
    pub student_name: String,
    pub prediction: Prediction,
}
