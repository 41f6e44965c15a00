use futures::stream::{self, StreamExt};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::features::{self, validate_gamification};
use crate::models::{FeatureVector, GamificationState, ModelType, Prediction};
use crate::scoring::{combine_hybrid, Holistic, RuleBased, Scorer, ScoringInput, SimulatedMl, Temporal};
use crate::store::EngineStore;

#[derive(Debug)]
pub struct ModelOutcome {
    pub model_type: ModelType,
    pub result: EngineResult<Prediction>,
    /// The prediction was already stored by an earlier run.
    pub already_scored: bool,
}

impl ModelOutcome {
    fn recorded(model_type: ModelType, prediction: Prediction) -> Self {
        Self {
            model_type,
            result: Ok(prediction),
            already_scored: false,
        }
    }

    fn existing(model_type: ModelType, prediction: Prediction) -> Self {
        Self {
            model_type,
            result: Ok(prediction),
            already_scored: true,
        }
    }

    fn failed(model_type: ModelType, err: EngineError) -> Self {
        Self {
            model_type,
            result: Err(err),
            already_scored: false,
        }
    }
}

#[derive(Debug)]
pub struct StudentRun {
    pub student_id: Uuid,
    pub week_number: i32,
    pub outcomes: Vec<ModelOutcome>,
}

impl StudentRun {
    pub fn predictions(&self) -> impl Iterator<Item = &Prediction> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().ok())
    }

    /// Predictions written by this run.
    pub fn recorded(&self) -> impl Iterator<Item = &Prediction> {
        self.outcomes
            .iter()
            .filter(|o| !o.already_scored)
            .filter_map(|o| o.result.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&ModelType, &EngineError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (&o.model_type, e)))
    }
}

#[derive(Debug, Default)]
pub struct WeekSummary {
    pub runs: Vec<StudentRun>,
    /// Students whose run stopped on a store error.
    pub failed: Vec<(Uuid, EngineError)>,
}

impl WeekSummary {
    pub fn recorded_count(&self) -> usize {
        self.runs.iter().map(|run| run.recorded().count()).sum()
    }
}

/// Scores students against a store: feature models first, then the hybrid
/// combiner over what was just committed. Models that already have a
/// prediction for the week are reported as already scored and left alone.
pub struct Pipeline<'a, S: EngineStore + ?Sized> {
    store: &'a S,
    config: EngineConfig,
    ml: SimulatedMl,
    scorers: Vec<Box<dyn Scorer>>,
}

impl<'a, S: EngineStore + ?Sized> Pipeline<'a, S> {
    pub fn new(store: &'a S, config: EngineConfig) -> Self {
        let ml = SimulatedMl::named(config.ml_model.clone());
        let scorers: Vec<Box<dyn Scorer>> = vec![
            Box::new(RuleBased::default()),
            Box::new(ml.clone()),
            Box::new(Holistic),
            Box::new(Temporal),
        ];
        Self {
            store,
            config,
            ml,
            scorers,
        }
    }

    pub async fn score_week(&self, week_number: i32) -> EngineResult<WeekSummary> {
        let students = self.store.students_for_week(week_number).await?;
        tracing::info!(
            week = week_number,
            students = students.len(),
            "scoring week"
        );

        let results: Vec<(Uuid, EngineResult<StudentRun>)> = stream::iter(students)
            .map(|student_id| async move {
                (student_id, self.score_student(student_id, week_number).await)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut summary = WeekSummary::default();
        for (student_id, result) in results {
            match result {
                Ok(run) => summary.runs.push(run),
                Err(err) => {
                    tracing::error!(student = %student_id, error = %err, "student run failed");
                    summary.failed.push((student_id, err));
                }
            }
        }
        summary.runs.sort_by_key(|run| run.student_id);
        Ok(summary)
    }

    /// Runs every model for one student. Missing or invalid data fails the
    /// affected models only; `Err` means the store itself failed.
    pub async fn score_student(&self, student_id: Uuid, week_number: i32) -> EngineResult<StudentRun> {
        let records = self.store.list_performance(student_id, week_number).await?;
        let current = features::aggregate(student_id, week_number, &records);
        let (previous, gamification) = match &current {
            Ok(_) => (
                self.previous_features(student_id, week_number).await?,
                self.gamification(student_id).await?,
            ),
            Err(err) => {
                tracing::warn!(
                    student = %student_id,
                    week = week_number,
                    error = %err,
                    "skipping feature models"
                );
                (None, Ok(None))
            }
        };

        let mut outcomes = Vec::with_capacity(self.scorers.len() + 1);
        for scorer in &self.scorers {
            let model_type = scorer.model_type();
            if let Some(outcome) = self.stored(student_id, &model_type, week_number).await? {
                outcomes.push(outcome);
                continue;
            }
            let scored = match (&current, &model_type, &gamification) {
                (Err(err), _, _) => Err(replicate(err)),
                (Ok(_), ModelType::Holistic, Err(err)) => Err(replicate(err)),
                (Ok(features), _, _) => {
                    let input = ScoringInput {
                        features,
                        gamification: gamification.as_ref().ok().and_then(Option::as_ref),
                        previous: previous.as_ref(),
                    };
                    Ok(scorer.score(&input).into_prediction(student_id, week_number))
                }
            };
            outcomes.push(self.commit(model_type, scored).await);
        }

        let hybrid = match self.stored(student_id, &ModelType::Hybrid, week_number).await? {
            Some(outcome) => outcome,
            None => match self.failed_prerequisite(&outcomes) {
                Some(model) => {
                    tracing::warn!(
                        student = %student_id,
                        week = week_number,
                        model = %model,
                        "hybrid prerequisite failed in this run"
                    );
                    ModelOutcome::failed(
                        ModelType::Hybrid,
                        EngineError::MissingPrerequisite {
                            student_id,
                            week_number,
                            model,
                        },
                    )
                }
                None => {
                    let scored = self.score_hybrid(student_id, week_number).await;
                    self.commit(ModelType::Hybrid, scored).await
                }
            },
        };
        outcomes.push(hybrid);

        let run = StudentRun {
            student_id,
            week_number,
            outcomes,
        };
        tracing::info!(
            student = %student_id,
            week = week_number,
            recorded = run.recorded().count(),
            failures = run.failures().count(),
            "scored student"
        );
        Ok(run)
    }

    /// Combines the stored rule-based and ML predictions, re-reading them per
    /// the retry policy while either is missing. The result is not stored.
    pub async fn score_hybrid(&self, student_id: Uuid, week_number: i32) -> EngineResult<Prediction> {
        let policy = self.config.hybrid_retry;
        let attempts = policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.hybrid_once(student_id, week_number).await {
                Err(err) if err.is_retryable() && attempt < attempts => {
                    tracing::debug!(
                        student = %student_id,
                        week = week_number,
                        attempt,
                        "hybrid prerequisites not ready, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(policy.delay).await;
                }
                Err(err) if err.is_retryable() => {
                    tracing::warn!(student = %student_id, week = week_number, error = %err, "hybrid unavailable");
                    return Err(err);
                }
                other => return other,
            }
        }
    }

    async fn hybrid_once(&self, student_id: Uuid, week_number: i32) -> EngineResult<Prediction> {
        let ml_type = self.ml.model_type();
        let rule_based = self
            .store
            .get_prediction(student_id, &ModelType::RuleBased, week_number)
            .await?
            .ok_or(EngineError::MissingPrerequisite {
                student_id,
                week_number,
                model: ModelType::RuleBased,
            })?;
        let ml = self
            .store
            .get_prediction(student_id, &ml_type, week_number)
            .await?
            .ok_or(EngineError::MissingPrerequisite {
                student_id,
                week_number,
                model: ml_type.clone(),
            })?;

        Ok(combine_hybrid(&rule_based, &ml).into_prediction(student_id, week_number))
    }

    /// A hybrid input that failed earlier in the same run.
    fn failed_prerequisite(&self, outcomes: &[ModelOutcome]) -> Option<ModelType> {
        let ml_type = self.ml.model_type();
        outcomes
            .iter()
            .find(|o| {
                o.result.is_err() && (o.model_type == ModelType::RuleBased || o.model_type == ml_type)
            })
            .map(|o| o.model_type.clone())
    }

    async fn stored(
        &self,
        student_id: Uuid,
        model_type: &ModelType,
        week_number: i32,
    ) -> EngineResult<Option<ModelOutcome>> {
        let Some(prediction) = self
            .store
            .get_prediction(student_id, model_type, week_number)
            .await?
        else {
            return Ok(None);
        };
        tracing::debug!(
            student = %student_id,
            model = %model_type,
            week = week_number,
            "already scored"
        );
        Ok(Some(ModelOutcome::existing(model_type.clone(), prediction)))
    }

    /// Writes a fresh prediction. If another run filled the key first, its
    /// prediction is reported instead.
    async fn commit(&self, model_type: ModelType, scored: EngineResult<Prediction>) -> ModelOutcome {
        let prediction = match scored {
            Ok(prediction) => prediction,
            Err(err) => return ModelOutcome::failed(model_type, err),
        };
        match self.store.record_prediction(&prediction).await {
            Ok(true) => {
                tracing::debug!(
                    student = %prediction.student_id,
                    model = %prediction.model_type,
                    week = prediction.week_number,
                    probability = prediction.dropout_probability,
                    risk = %prediction.risk_level,
                    "recorded prediction"
                );
                ModelOutcome::recorded(model_type, prediction)
            }
            Ok(false) => match self
                .store
                .get_prediction(prediction.student_id, &model_type, prediction.week_number)
                .await
            {
                Ok(stored) => ModelOutcome::existing(model_type, stored.unwrap_or(prediction)),
                Err(err) => ModelOutcome::failed(model_type, err.into()),
            },
            Err(err) => ModelOutcome::failed(model_type, err.into()),
        }
    }

    async fn previous_features(
        &self,
        student_id: Uuid,
        week_number: i32,
    ) -> EngineResult<Option<FeatureVector>> {
        let Some(previous_week) = week_number.checked_sub(1) else {
            return Ok(None);
        };
        let records = self.store.list_performance(student_id, previous_week).await?;
        if records.is_empty() {
            return Ok(None);
        }
        match features::aggregate(student_id, previous_week, &records) {
            Ok(features) => Ok(Some(features)),
            Err(err) => {
                tracing::warn!(
                    student = %student_id,
                    week = previous_week,
                    error = %err,
                    "ignoring invalid prior week"
                );
                Ok(None)
            }
        }
    }

    /// Outer error is the store; inner error is an invalid state.
    async fn gamification(
        &self,
        student_id: Uuid,
    ) -> EngineResult<EngineResult<Option<GamificationState>>> {
        let state = self.store.get_gamification(student_id).await?;
        Ok(match state {
            Some(state) => validate_gamification(&state).map(|()| Some(state)),
            None => Ok(None),
        })
    }
}

/// Copies a data error so it can be reported against several models.
fn replicate(err: &EngineError) -> EngineError {
    match err {
        EngineError::InsufficientData {
            student_id,
            week_number,
        } => EngineError::InsufficientData {
            student_id: *student_id,
            week_number: *week_number,
        },
        EngineError::OutOfRange { field, value } => EngineError::OutOfRange {
            field: *field,
            value: *value,
        },
        EngineError::MissingPrerequisite {
            student_id,
            week_number,
            model,
        } => EngineError::MissingPrerequisite {
            student_id: *student_id,
            week_number: *week_number,
            model: model.clone(),
        },
        EngineError::Store(inner) => EngineError::Store(anyhow::anyhow!("{inner:#}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::tests::record;
    use crate::models::{PerformanceRecord, RiskLevel};
    use crate::store::MemoryStore;
    use crate::config::RetryPolicy;
    use chrono::Utc;
    use std::collections::BTreeSet;
    use std::time::Duration;

    impl StudentRun {
        fn prediction_for(&self, model_type: &ModelType) -> Option<&Prediction> {
            self.outcomes
                .iter()
                .find(|o| &o.model_type == model_type)
                .and_then(|o| o.result.as_ref().ok())
        }
    }

    fn week(mut row: PerformanceRecord, week_number: i32) -> PerformanceRecord {
        row.week_number = week_number;
        row
    }

    async fn store_with_student(student: Uuid) -> MemoryStore {
        let store = MemoryStore::new();
        store.add_student(student, "Avery Lee").await;
        store
            .add_performance(record(student, "Mathematics", 65.0, 45.0, 0.5, 0.6))
            .await;
        store
            .add_performance(record(student, "Physics", 65.0, 45.0, 0.5, 0.6))
            .await;
        store
    }

    #[tokio::test]
    async fn scores_every_model_and_commits_them() {
        let student = Uuid::new_v4();
        let store = store_with_student(student).await;
        let pipeline = Pipeline::new(&store, EngineConfig::default());

        let run = pipeline.score_student(student, 1).await.unwrap();
        assert_eq!(run.failures().count(), 0);
        assert_eq!(run.predictions().count(), 5);

        let rule = run.prediction_for(&ModelType::RuleBased).unwrap();
        assert_eq!(rule.dropout_probability, 1.0);
        assert_eq!(rule.risk_level, RiskLevel::Critical);

        let ml = run
            .prediction_for(&ModelType::Ml("random-forest".to_string()))
            .unwrap();
        let hybrid = run.prediction_for(&ModelType::Hybrid).unwrap();
        let expected = 0.4 * rule.dropout_probability + 0.6 * ml.dropout_probability;
        assert!((hybrid.dropout_probability - expected).abs() < 1e-9);
        assert_eq!(hybrid.features, ml.features);

        let stored = store.latest_predictions(student, 10).await.unwrap();
        assert_eq!(stored.len(), 5);
        assert_eq!(stored[0].model_type, ModelType::Hybrid);
    }

    #[tokio::test]
    async fn missing_rows_fail_softly() {
        let student = Uuid::new_v4();
        let store = MemoryStore::new();
        let pipeline = Pipeline::new(&store, EngineConfig::default());

        let run = pipeline.score_student(student, 3).await.unwrap();
        assert_eq!(run.predictions().count(), 0);
        assert_eq!(run.failures().count(), 5);
        assert!(matches!(
            run.outcomes[0].result,
            Err(EngineError::InsufficientData { week_number: 3, .. })
        ));
        let hybrid = run.outcomes.last().unwrap();
        assert_eq!(hybrid.model_type, ModelType::Hybrid);
        assert!(hybrid.result.as_ref().unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn rescoring_a_week_keeps_one_prediction_per_model() {
        let student = Uuid::new_v4();
        let store = store_with_student(student).await;
        let pipeline = Pipeline::new(&store, EngineConfig::default());

        let first = pipeline.score_week(1).await.unwrap();
        assert_eq!(first.recorded_count(), 5);

        let second = pipeline.score_week(1).await.unwrap();
        assert_eq!(second.recorded_count(), 0);
        let run = &second.runs[0];
        assert_eq!(run.predictions().count(), 5);
        assert!(run.outcomes.iter().all(|o| o.already_scored));

        let first_ids: Vec<Uuid> = first.runs[0].predictions().map(|p| p.id).collect();
        let second_ids: Vec<Uuid> = run.predictions().map(|p| p.id).collect();
        assert_eq!(first_ids, second_ids);
        assert_eq!(store.latest_predictions(student, 20).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn failed_prerequisite_skips_hybrid_retries() {
        let student = Uuid::new_v4();
        let store = MemoryStore::new();
        let pipeline = Pipeline::new(
            &store,
            EngineConfig {
                hybrid_retry: RetryPolicy {
                    attempts: 5,
                    delay: Duration::from_secs(30),
                },
                ..EngineConfig::default()
            },
        );

        let run = tokio::time::timeout(Duration::from_secs(5), pipeline.score_student(student, 2))
            .await
            .unwrap()
            .unwrap();
        let hybrid = run.outcomes.last().unwrap();
        assert!(matches!(
            hybrid.result,
            Err(EngineError::MissingPrerequisite {
                model: ModelType::RuleBased,
                week_number: 2,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn hybrid_waits_for_prerequisites() {
        let student = Uuid::new_v4();
        let store = store_with_student(student).await;
        let pipeline = Pipeline::new(&store, EngineConfig::default());

        let early = pipeline.score_hybrid(student, 1).await.unwrap_err();
        assert!(matches!(
            early,
            EngineError::MissingPrerequisite {
                model: ModelType::RuleBased,
                ..
            }
        ));

        pipeline.score_student(student, 1).await.unwrap();
        let later = pipeline.score_hybrid(student, 1).await.unwrap();
        assert_eq!(later.model_type, ModelType::Hybrid);
    }

    #[tokio::test]
    async fn invalid_gamification_only_fails_holistic() {
        let student = Uuid::new_v4();
        let store = store_with_student(student).await;
        store
            .set_gamification(GamificationState {
                student_id: student,
                xp: 100,
                streak: -3,
                badges: BTreeSet::new(),
                last_activity: Utc::now(),
            })
            .await;
        let pipeline = Pipeline::new(&store, EngineConfig::default());

        let run = pipeline.score_student(student, 1).await.unwrap();
        let failures: Vec<&ModelType> = run.failures().map(|(model, _)| model).collect();
        assert_eq!(failures, vec![&ModelType::Holistic]);
        assert_eq!(run.predictions().count(), 4);
    }

    #[tokio::test]
    async fn temporal_reads_previous_week() {
        let student = Uuid::new_v4();
        let store = MemoryStore::new();
        store
            .add_performance(week(record(student, "History", 95.0, 95.0, 0.95, 0.95), 1))
            .await;
        store
            .add_performance(week(record(student, "History", 60.0, 60.0, 0.6, 0.6), 2))
            .await;
        let pipeline = Pipeline::new(&store, EngineConfig::default());

        let run = pipeline.score_student(student, 2).await.unwrap();
        let temporal = run.prediction_for(&ModelType::Temporal).unwrap();
        assert!((temporal.dropout_probability - 0.575).abs() < 1e-9);
        assert!(temporal.explanation.contains("previous week"));
    }

    #[tokio::test]
    async fn week_scoring_isolates_students() {
        let healthy = Uuid::new_v4();
        let broken = Uuid::new_v4();
        let store = store_with_student(healthy).await;
        store
            .add_performance(record(broken, "Mathematics", 140.0, 70.0, 0.5, 0.5))
            .await;
        let pipeline = Pipeline::new(
            &store,
            EngineConfig {
                concurrency: 2,
                ..EngineConfig::default()
            },
        );

        let summary = pipeline.score_week(1).await.unwrap();
        assert!(summary.failed.is_empty());
        assert_eq!(summary.runs.len(), 2);
        assert_eq!(summary.recorded_count(), 5);

        let broken_run = summary
            .runs
            .iter()
            .find(|run| run.student_id == broken)
            .unwrap();
        assert!(broken_run
            .failures()
            .take(4)
            .all(|(_, err)| matches!(err, EngineError::OutOfRange { field: "attendance", .. })));
    }
}
