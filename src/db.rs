use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::features::{validate_gamification, validate_record};
use crate::import::PerformanceRow;
use crate::models::{
    FeatureVector, GamificationState, ModelMetrics, ModelType, PerformanceRecord, Prediction,
    RiskLevel,
};
use crate::seed::SeedData;
use crate::store::EngineStore;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn upsert_student(
    pool: &PgPool,
    id: Uuid,
    full_name: &str,
    email: &str,
    cohort: &str,
) -> anyhow::Result<Uuid> {
    let row = sqlx::query(
        r#"
        INSERT INTO dropout_risk.students (id, full_name, email, cohort)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (email) DO UPDATE
        SET full_name = EXCLUDED.full_name, cohort = EXCLUDED.cohort
        RETURNING id
        "#,
    )
    .bind(id)
    .bind(full_name)
    .bind(email)
    .bind(cohort)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to upsert student {email}"))?;
    Ok(row.try_get("id")?)
}

/// Returns whether a new row was written. Rows are never overwritten.
async fn insert_performance(pool: &PgPool, record: &PerformanceRecord) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO dropout_risk.performance_records
        (student_id, subject, week_number, attendance, grade, engagement,
         behavior_score, assignments_completed, assignments_total)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (student_id, subject, week_number) DO NOTHING
        "#,
    )
    .bind(record.student_id)
    .bind(&record.subject)
    .bind(record.week_number)
    .bind(record.attendance)
    .bind(record.grade)
    .bind(record.engagement)
    .bind(record.behavior_score)
    .bind(record.assignments_completed)
    .bind(record.assignments_total)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

async fn upsert_gamification(pool: &PgPool, state: &GamificationState) -> anyhow::Result<()> {
    let badges: Vec<String> = state.badges.iter().cloned().collect();
    sqlx::query(
        r#"
        INSERT INTO dropout_risk.gamification (student_id, xp, streak, badges, last_activity)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (student_id) DO UPDATE
        SET xp = EXCLUDED.xp, streak = EXCLUDED.streak,
            badges = EXCLUDED.badges, last_activity = EXCLUDED.last_activity
        "#,
    )
    .bind(state.student_id)
    .bind(state.xp)
    .bind(state.streak)
    .bind(badges)
    .bind(state.last_activity)
    .execute(pool)
    .await?;
    Ok(())
}

/// Writes the sample students, their performance rows and gamification
/// state. Safe to run repeatedly.
pub async fn seed(pool: &PgPool, data: &SeedData) -> anyhow::Result<usize> {
    for student in &data.students {
        upsert_student(pool, student.id, student.full_name, student.email, student.cohort).await?;
    }

    let mut inserted = 0usize;
    for record in &data.performance {
        if insert_performance(pool, record).await? {
            inserted += 1;
        }
    }

    for state in &data.gamification {
        validate_gamification(state)?;
        upsert_gamification(pool, state).await?;
        tracing::debug!(
            student = %state.student_id,
            level = state.level(),
            streak = state.streak,
            "seeded gamification"
        );
    }

    Ok(inserted)
}

pub async fn import_performance(pool: &PgPool, rows: &[PerformanceRow]) -> anyhow::Result<usize> {
    let mut inserted = 0usize;

    for (index, row) in rows.iter().enumerate() {
        let student_id =
            upsert_student(pool, Uuid::new_v4(), &row.full_name, &row.email, &row.cohort).await?;
        let record = PerformanceRecord {
            student_id,
            subject: row.subject.clone(),
            week_number: row.week_number,
            attendance: row.attendance,
            grade: row.grade,
            engagement: row.engagement,
            behavior_score: row.behavior_score,
            assignments_completed: row.assignments_completed,
            assignments_total: row.assignments_total,
        };
        validate_record(&record).with_context(|| format!("row {} ({})", index + 1, row.email))?;

        if insert_performance(pool, &record).await? {
            inserted += 1;
        }
    }

    Ok(inserted)
}

fn performance_from_row(row: &PgRow) -> anyhow::Result<PerformanceRecord> {
    Ok(PerformanceRecord {
        student_id: row.try_get("student_id")?,
        subject: row.try_get("subject")?,
        week_number: row.try_get("week_number")?,
        attendance: row.try_get("attendance")?,
        grade: row.try_get("grade")?,
        engagement: row.try_get("engagement")?,
        behavior_score: row.try_get("behavior_score")?,
        assignments_completed: row.try_get("assignments_completed")?,
        assignments_total: row.try_get("assignments_total")?,
    })
}

fn prediction_from_row(row: &PgRow) -> anyhow::Result<Prediction> {
    let model_type: String = row.try_get("model_type")?;
    let risk_level: String = row.try_get("risk_level")?;
    let features: Json<FeatureVector> = row.try_get("features")?;
    Ok(Prediction {
        id: row.try_get("id")?,
        student_id: row.try_get("student_id")?,
        model_type: ModelType::from(model_type),
        week_number: row.try_get("week_number")?,
        dropout_probability: row.try_get("dropout_probability")?,
        risk_level: risk_level.parse::<RiskLevel>()?,
        confidence: row.try_get("confidence")?,
        explanation: row.try_get("explanation")?,
        lhi: row.try_get("lhi")?,
        features: features.0,
        created_at: row.try_get("created_at")?,
    })
}

fn metrics_from_row(row: &PgRow) -> anyhow::Result<ModelMetrics> {
    let model_type: String = row.try_get("model_type")?;
    Ok(ModelMetrics {
        model_type: ModelType::from(model_type),
        week_number: row.try_get("week_number")?,
        accuracy: row.try_get("accuracy")?,
        precision: row.try_get("precision")?,
        recall: row.try_get("recall")?,
        f1_score: row.try_get("f1_score")?,
        roc_auc: row.try_get("roc_auc")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

const PREDICTION_COLUMNS: &str = "id, student_id, model_type, week_number, dropout_probability, \
     risk_level, confidence, explanation, lhi, features, created_at";

const METRICS_COLUMNS: &str =
    "model_type, week_number, accuracy, \"precision\", recall, f1_score, roc_auc, recorded_at";

#[async_trait]
impl EngineStore for PgStore {
    async fn list_performance(
        &self,
        student_id: Uuid,
        week_number: i32,
    ) -> anyhow::Result<Vec<PerformanceRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT student_id, subject, week_number, attendance, grade, engagement,
                   behavior_score, assignments_completed, assignments_total
            FROM dropout_risk.performance_records
            WHERE student_id = $1 AND week_number = $2
            ORDER BY id
            "#,
        )
        .bind(student_id)
        .bind(week_number)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(performance_from_row).collect()
    }

    async fn get_gamification(&self, student_id: Uuid) -> anyhow::Result<Option<GamificationState>> {
        let row = sqlx::query(
            r#"
            SELECT student_id, xp, streak, badges, last_activity
            FROM dropout_risk.gamification
            WHERE student_id = $1
            "#,
        )
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let badges: Vec<String> = row.try_get("badges")?;
        Ok(Some(GamificationState {
            student_id: row.try_get("student_id")?,
            xp: row.try_get("xp")?,
            streak: row.try_get("streak")?,
            badges: badges.into_iter().collect(),
            last_activity: row.try_get("last_activity")?,
        }))
    }

    async fn get_prediction(
        &self,
        student_id: Uuid,
        model_type: &ModelType,
        week_number: i32,
    ) -> anyhow::Result<Option<Prediction>> {
        let query = format!(
            "SELECT {PREDICTION_COLUMNS} FROM dropout_risk.predictions \
             WHERE student_id = $1 AND model_type = $2 AND week_number = $3"
        );
        let row = sqlx::query(&query)
            .bind(student_id)
            .bind(model_type.as_str())
            .bind(week_number)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(prediction_from_row).transpose()
    }

    async fn record_prediction(&self, prediction: &Prediction) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO dropout_risk.predictions
            (id, student_id, model_type, week_number, dropout_probability, risk_level,
             confidence, explanation, lhi, features, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (student_id, model_type, week_number) DO NOTHING
            "#,
        )
        .bind(prediction.id)
        .bind(prediction.student_id)
        .bind(prediction.model_type.as_str())
        .bind(prediction.week_number)
        .bind(prediction.dropout_probability)
        .bind(prediction.risk_level.as_str())
        .bind(prediction.confidence)
        .bind(&prediction.explanation)
        .bind(prediction.lhi)
        .bind(Json(prediction.features))
        .bind(prediction.created_at)
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "failed to record {} prediction for {}",
                prediction.model_type, prediction.student_id
            )
        })?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_metrics(&self, metrics: &ModelMetrics) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dropout_risk.model_metrics
            (model_type, week_number, accuracy, "precision", recall, f1_score, roc_auc, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(metrics.model_type.as_str())
        .bind(metrics.week_number)
        .bind(metrics.accuracy)
        .bind(metrics.precision)
        .bind(metrics.recall)
        .bind(metrics.f1_score)
        .bind(metrics.roc_auc)
        .bind(metrics.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_predictions(
        &self,
        student_id: Uuid,
        limit: usize,
    ) -> anyhow::Result<Vec<Prediction>> {
        let query = format!(
            "SELECT {PREDICTION_COLUMNS} FROM dropout_risk.predictions \
             WHERE student_id = $1 \
             ORDER BY week_number DESC, seq DESC LIMIT $2"
        );
        let rows = sqlx::query(&query)
            .bind(student_id)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(prediction_from_row).collect()
    }

    async fn recent_metrics(&self, limit: usize) -> anyhow::Result<Vec<ModelMetrics>> {
        let query = format!(
            "SELECT {METRICS_COLUMNS} FROM dropout_risk.model_metrics \
             ORDER BY week_number DESC, seq DESC LIMIT $1"
        );
        let rows = sqlx::query(&query)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(metrics_from_row).collect()
    }

    async fn metrics_for_week(&self, week_number: i32) -> anyhow::Result<Vec<ModelMetrics>> {
        let query = format!(
            "SELECT {METRICS_COLUMNS} FROM dropout_risk.model_metrics \
             WHERE week_number = $1 ORDER BY seq"
        );
        let rows = sqlx::query(&query)
            .bind(week_number)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(metrics_from_row).collect()
    }

    async fn students_for_week(&self, week_number: i32) -> anyhow::Result<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT student_id
            FROM dropout_risk.performance_records
            WHERE week_number = $1
            ORDER BY student_id
            "#,
        )
        .bind(week_number)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get("student_id").map_err(anyhow::Error::from))
            .collect()
    }

    async fn student_name(&self, student_id: Uuid) -> anyhow::Result<Option<String>> {
        let row = sqlx::query("SELECT full_name FROM dropout_risk.students WHERE id = $1")
            .bind(student_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| row.try_get("full_name").map_err(anyhow::Error::from))
            .transpose()
    }
}
