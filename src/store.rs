use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{GamificationState, ModelMetrics, ModelType, PerformanceRecord, Prediction};

/// Everything the engine reads from and appends to. Metrics are append-only.
/// A prediction is written once per (student, model, week) and never
/// replaced. A write must be visible to the next read on the same store.
#[async_trait]
pub trait EngineStore: Send + Sync {
    async fn list_performance(
        &self,
        student_id: Uuid,
        week_number: i32,
    ) -> anyhow::Result<Vec<PerformanceRecord>>;

    async fn get_gamification(&self, student_id: Uuid) -> anyhow::Result<Option<GamificationState>>;

    /// The prediction stored for the key, if any.
    async fn get_prediction(
        &self,
        student_id: Uuid,
        model_type: &ModelType,
        week_number: i32,
    ) -> anyhow::Result<Option<Prediction>>;

    /// `false` when the key already had a prediction; the stored one is kept.
    async fn record_prediction(&self, prediction: &Prediction) -> anyhow::Result<bool>;

    async fn record_metrics(&self, metrics: &ModelMetrics) -> anyhow::Result<()>;

    /// Newest first: highest week, then latest insertion.
    async fn latest_predictions(
        &self,
        student_id: Uuid,
        limit: usize,
    ) -> anyhow::Result<Vec<Prediction>>;

    /// Newest first: highest week, then latest insertion.
    async fn recent_metrics(&self, limit: usize) -> anyhow::Result<Vec<ModelMetrics>>;

    /// Insertion order.
    async fn metrics_for_week(&self, week_number: i32) -> anyhow::Result<Vec<ModelMetrics>>;

    async fn students_for_week(&self, week_number: i32) -> anyhow::Result<Vec<Uuid>>;

    async fn student_name(&self, student_id: Uuid) -> anyhow::Result<Option<String>>;
}

#[derive(Default)]
struct MemoryState {
    students: HashMap<Uuid, String>,
    performance: Vec<PerformanceRecord>,
    gamification: HashMap<Uuid, GamificationState>,
    predictions: Vec<Prediction>,
    metrics: Vec<ModelMetrics>,
}

/// Process-local store. Vector position doubles as insertion order.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_student(&self, student_id: Uuid, full_name: &str) {
        self.state
            .lock()
            .await
            .students
            .insert(student_id, full_name.to_string());
    }

    pub async fn add_performance(&self, record: PerformanceRecord) {
        self.state.lock().await.performance.push(record);
    }

    pub async fn set_gamification(&self, state: GamificationState) {
        self.state
            .lock()
            .await
            .gamification
            .insert(state.student_id, state);
    }
}

#[async_trait]
impl EngineStore for MemoryStore {
    async fn list_performance(
        &self,
        student_id: Uuid,
        week_number: i32,
    ) -> anyhow::Result<Vec<PerformanceRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .performance
            .iter()
            .filter(|r| r.student_id == student_id && r.week_number == week_number)
            .cloned()
            .collect())
    }

    async fn get_gamification(&self, student_id: Uuid) -> anyhow::Result<Option<GamificationState>> {
        Ok(self.state.lock().await.gamification.get(&student_id).cloned())
    }

    async fn get_prediction(
        &self,
        student_id: Uuid,
        model_type: &ModelType,
        week_number: i32,
    ) -> anyhow::Result<Option<Prediction>> {
        let state = self.state.lock().await;
        Ok(state
            .predictions
            .iter()
            .find(|p| {
                p.student_id == student_id
                    && p.week_number == week_number
                    && &p.model_type == model_type
            })
            .cloned())
    }

    async fn record_prediction(&self, prediction: &Prediction) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        let taken = state.predictions.iter().any(|p| {
            p.student_id == prediction.student_id
                && p.week_number == prediction.week_number
                && p.model_type == prediction.model_type
        });
        if taken {
            return Ok(false);
        }
        state.predictions.push(prediction.clone());
        Ok(true)
    }

    async fn record_metrics(&self, metrics: &ModelMetrics) -> anyhow::Result<()> {
        self.state.lock().await.metrics.push(metrics.clone());
        Ok(())
    }

    async fn latest_predictions(
        &self,
        student_id: Uuid,
        limit: usize,
    ) -> anyhow::Result<Vec<Prediction>> {
        let state = self.state.lock().await;
        let mut matching: Vec<(usize, &Prediction)> = state
            .predictions
            .iter()
            .enumerate()
            .filter(|(_, p)| p.student_id == student_id)
            .collect();
        matching.sort_by(|(seq_a, a), (seq_b, b)| {
            b.week_number.cmp(&a.week_number).then(seq_b.cmp(seq_a))
        });
        Ok(matching
            .into_iter()
            .take(limit)
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn recent_metrics(&self, limit: usize) -> anyhow::Result<Vec<ModelMetrics>> {
        let state = self.state.lock().await;
        let mut rows: Vec<(usize, &ModelMetrics)> = state.metrics.iter().enumerate().collect();
        rows.sort_by(|(seq_a, a), (seq_b, b)| {
            b.week_number.cmp(&a.week_number).then(seq_b.cmp(seq_a))
        });
        Ok(rows.into_iter().take(limit).map(|(_, m)| m.clone()).collect())
    }

    async fn metrics_for_week(&self, week_number: i32) -> anyhow::Result<Vec<ModelMetrics>> {
        let state = self.state.lock().await;
        Ok(state
            .metrics
            .iter()
            .filter(|m| m.week_number == week_number)
            .cloned()
            .collect())
    }

    async fn students_for_week(&self, week_number: i32) -> anyhow::Result<Vec<Uuid>> {
        let state = self.state.lock().await;
        let ids: BTreeSet<Uuid> = state
            .performance
            .iter()
            .filter(|r| r.week_number == week_number)
            .map(|r| r.student_id)
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn student_name(&self, student_id: Uuid) -> anyhow::Result<Option<String>> {
        Ok(self.state.lock().await.students.get(&student_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::tests::record;
    use crate::scoring::tests::features;
    use chrono::Utc;

    fn prediction(student_id: Uuid, model_type: ModelType, week_number: i32, p: f64) -> Prediction {
        Prediction {
            id: Uuid::new_v4(),
            student_id,
            model_type,
            week_number,
            dropout_probability: p,
            risk_level: crate::risk::classify(p),
            confidence: 0.88,
            explanation: "stored".to_string(),
            lhi: None,
            features: features(0.9, 0.8, 0.7, 0.6),
            created_at: Utc::now(),
        }
    }

    fn metrics(model: &str, week_number: i32) -> ModelMetrics {
        ModelMetrics {
            model_type: ModelType::from(model),
            week_number,
            accuracy: 0.9,
            precision: 0.9,
            recall: 0.9,
            f1_score: 0.9,
            roc_auc: 0.95,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn round_trip_preserves_exact_values() {
        let store = MemoryStore::new();
        let student = Uuid::new_v4();
        let original = prediction(student, ModelType::Holistic, 2, 0.1 + 0.2);

        store.record_prediction(&original).await.unwrap();
        let loaded = store
            .get_prediction(student, &ModelType::Holistic, 2)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            loaded.dropout_probability.to_bits(),
            original.dropout_probability.to_bits()
        );
        assert_eq!(loaded.risk_level, original.risk_level);
        assert_eq!(loaded.confidence.to_bits(), original.confidence.to_bits());
        assert_eq!(loaded, original);
    }

    #[tokio::test]
    async fn keeps_first_prediction_per_key() {
        let store = MemoryStore::new();
        let student = Uuid::new_v4();
        assert!(store
            .record_prediction(&prediction(student, ModelType::RuleBased, 1, 0.2))
            .await
            .unwrap());
        assert!(!store
            .record_prediction(&prediction(student, ModelType::RuleBased, 1, 0.6))
            .await
            .unwrap());
        assert!(store
            .record_prediction(&prediction(student, ModelType::Holistic, 1, 0.6))
            .await
            .unwrap());

        let found = store
            .get_prediction(student, &ModelType::RuleBased, 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.dropout_probability, 0.2);
        assert_eq!(store.latest_predictions(student, 10).await.unwrap().len(), 2);
        assert!(store
            .get_prediction(student, &ModelType::RuleBased, 2)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn latest_orders_by_week_then_insertion() {
        let store = MemoryStore::new();
        let student = Uuid::new_v4();
        let other = Uuid::new_v4();
        for (model, week) in [("rule-based", 2), ("holistic", 1), ("hybrid", 2)] {
            store
                .record_prediction(&prediction(student, ModelType::from(model), week, 0.3))
                .await
                .unwrap();
        }
        store
            .record_prediction(&prediction(other, ModelType::Hybrid, 3, 0.3))
            .await
            .unwrap();

        let latest = store.latest_predictions(student, 10).await.unwrap();
        let order: Vec<&str> = latest.iter().map(|p| p.model_type.as_str()).collect();
        assert_eq!(order, vec!["hybrid", "rule-based", "holistic"]);

        let limited = store.latest_predictions(student, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn recent_metrics_are_newest_first() {
        let store = MemoryStore::new();
        store.record_metrics(&metrics("rule-based", 1)).await.unwrap();
        store.record_metrics(&metrics("hybrid", 2)).await.unwrap();
        store.record_metrics(&metrics("holistic", 2)).await.unwrap();

        let rows = store.recent_metrics(2).await.unwrap();
        let order: Vec<&str> = rows.iter().map(|m| m.model_type.as_str()).collect();
        assert_eq!(order, vec!["holistic", "hybrid"]);
    }

    #[tokio::test]
    async fn performance_is_scoped_to_student_and_week() {
        let store = MemoryStore::new();
        let student = Uuid::new_v4();
        let mut later = record(student, "Chemistry", 80.0, 70.0, 0.6, 0.7);
        later.week_number = 2;
        store
            .add_performance(record(student, "Chemistry", 80.0, 70.0, 0.6, 0.7))
            .await;
        store.add_performance(later).await;
        store
            .add_performance(record(Uuid::new_v4(), "Chemistry", 80.0, 70.0, 0.6, 0.7))
            .await;

        assert_eq!(store.list_performance(student, 1).await.unwrap().len(), 1);
        assert_eq!(store.students_for_week(1).await.unwrap().len(), 2);
        assert_eq!(store.students_for_week(2).await.unwrap(), vec![student]);
    }
}
