use chrono::Utc;
use uuid::Uuid;

use crate::models::{FeatureVector, GamificationState, ModelType, Prediction, RiskLevel};
use crate::risk::{self, clamp_probability};

pub const RULE_BASED_CONFIDENCE: f64 = 0.75;
pub const ML_CONFIDENCE: f64 = 0.88;
pub const HYBRID_CONFIDENCE: f64 = 0.91;
pub const HOLISTIC_CONFIDENCE: f64 = 0.93;
pub const TEMPORAL_CONFIDENCE: f64 = 0.85;

pub const HYBRID_RULE_WEIGHT: f64 = 0.4;
pub const HYBRID_ML_WEIGHT: f64 = 0.6;

pub const STREAK_BONUS_DAYS: f64 = 30.0;
pub const STREAK_BONUS_CAP: f64 = 0.10;

/// Weight applied to the week-over-week health change by the temporal model.
pub const TEMPORAL_TREND_WEIGHT: f64 = 0.5;

pub const DEFAULT_ML_MODEL: &str = "random-forest";

/// Thresholds and penalties of the additive rule-based model. Attendance and
/// grade thresholds are fractions of 100%.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleThresholds {
    pub attendance: f64,
    pub grade: f64,
    pub engagement: f64,
    pub attendance_penalty: f64,
    pub grade_penalty: f64,
    pub engagement_penalty: f64,
}

pub const DEFAULT_RULES: RuleThresholds = RuleThresholds {
    attendance: 0.70,
    grade: 0.50,
    engagement: 0.60,
    attendance_penalty: 0.4,
    grade_penalty: 0.4,
    engagement_penalty: 0.2,
};

/// Feature weights of a linear scorer. Stand-ins for fitted coefficients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearWeights {
    pub attendance: f64,
    pub grade: f64,
    pub engagement: f64,
    pub behavior: f64,
}

impl LinearWeights {
    pub fn dot(&self, features: &FeatureVector) -> f64 {
        self.attendance * features.attendance
            + self.grade * features.grade
            + self.engagement * features.engagement
            + self.behavior * features.behavior
    }

    /// Weighted sum of each feature's shortfall from 1.
    pub fn deficit(&self, features: &FeatureVector) -> f64 {
        self.attendance * (1.0 - features.attendance)
            + self.grade * (1.0 - features.grade)
            + self.engagement * (1.0 - features.engagement)
            + self.behavior * (1.0 - features.behavior)
    }
}

pub const ML_WEIGHTS: LinearWeights = LinearWeights {
    attendance: 0.30,
    grade: 0.35,
    engagement: 0.25,
    behavior: 0.10,
};

/// Shared by the holistic LHI and the temporal health score.
pub const HEALTH_WEIGHTS: LinearWeights = LinearWeights {
    attendance: 0.25,
    grade: 0.35,
    engagement: 0.25,
    behavior: 0.15,
};

pub struct ScoringInput<'a> {
    pub features: &'a FeatureVector,
    pub gamification: Option<&'a GamificationState>,
    /// Features of the preceding week, when that week has rows.
    pub previous: Option<&'a FeatureVector>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    pub model_type: ModelType,
    pub dropout_probability: f64,
    pub risk_level: RiskLevel,
    pub confidence: f64,
    pub explanation: String,
    pub lhi: Option<f64>,
    pub features: FeatureVector,
}

impl Score {
    fn new(
        model_type: ModelType,
        dropout_probability: f64,
        confidence: f64,
        explanation: String,
        features: FeatureVector,
    ) -> Self {
        Self {
            model_type,
            dropout_probability,
            risk_level: risk::classify(dropout_probability),
            confidence,
            explanation,
            lhi: None,
            features,
        }
    }

    pub fn into_prediction(self, student_id: Uuid, week_number: i32) -> Prediction {
        Prediction {
            id: Uuid::new_v4(),
            student_id,
            model_type: self.model_type,
            week_number,
            dropout_probability: self.dropout_probability,
            risk_level: self.risk_level,
            confidence: self.confidence,
            explanation: self.explanation,
            lhi: self.lhi,
            features: self.features,
            created_at: Utc::now(),
        }
    }
}

/// A model that scores a feature vector directly.
pub trait Scorer: Send + Sync {
    fn model_type(&self) -> ModelType;
    fn score(&self, input: &ScoringInput<'_>) -> Score;
}

#[derive(Debug, Clone)]
pub struct RuleBased {
    pub rules: RuleThresholds,
}

impl Default for RuleBased {
    fn default() -> Self {
        Self {
            rules: DEFAULT_RULES,
        }
    }
}

impl Scorer for RuleBased {
    fn model_type(&self) -> ModelType {
        ModelType::RuleBased
    }

    fn score(&self, input: &ScoringInput<'_>) -> Score {
        let features = input.features;
        let rules = &self.rules;
        let mut probability = 0.0;
        let mut reasons = Vec::new();

        if features.attendance < rules.attendance {
            probability += rules.attendance_penalty;
            reasons.push(format!("Attendance below {:.0}%.", rules.attendance * 100.0));
        }
        if features.grade < rules.grade {
            probability += rules.grade_penalty;
            reasons.push(format!("Grades below {:.0}%.", rules.grade * 100.0));
        }
        if features.engagement < rules.engagement {
            probability += rules.engagement_penalty;
            reasons.push("Low engagement detected.".to_string());
        }

        let explanation = if reasons.is_empty() {
            "All metrics within acceptable range.".to_string()
        } else {
            reasons.join(" ")
        };

        Score::new(
            self.model_type(),
            clamp_probability(probability),
            RULE_BASED_CONFIDENCE,
            explanation,
            *features,
        )
    }
}

/// Fixed linear formula labelled as a trained model. Every named variant
/// shares the weights; only the label differs.
#[derive(Debug, Clone)]
pub struct SimulatedMl {
    pub name: String,
    pub weights: LinearWeights,
}

impl SimulatedMl {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weights: ML_WEIGHTS,
        }
    }
}

impl Scorer for SimulatedMl {
    fn model_type(&self) -> ModelType {
        ModelType::Ml(self.name.clone())
    }

    fn score(&self, input: &ScoringInput<'_>) -> Score {
        let features = input.features;
        let probability = clamp_probability(self.weights.deficit(features));
        let explanation = format!(
            "{} analysis: Attendance {:.1}%, Grades {:.1}%, Engagement {:.1}%",
            self.name,
            features.attendance_pct(),
            features.grade_pct(),
            features.engagement_pct()
        );
        Score::new(
            self.model_type(),
            probability,
            ML_CONFIDENCE,
            explanation,
            *features,
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct Holistic;

pub fn streak_bonus(streak: i32) -> f64 {
    (f64::from(streak.max(0)) / STREAK_BONUS_DAYS).min(STREAK_BONUS_CAP)
}

/// Learning Health Index, in [0, 1 + STREAK_BONUS_CAP].
pub fn learning_health_index(features: &FeatureVector, streak: i32) -> f64 {
    HEALTH_WEIGHTS.dot(features) + streak_bonus(streak)
}

impl Scorer for Holistic {
    fn model_type(&self) -> ModelType {
        ModelType::Holistic
    }

    fn score(&self, input: &ScoringInput<'_>) -> Score {
        let streak = input.gamification.map_or(0, |state| state.streak);
        let lhi = learning_health_index(input.features, streak);
        let probability = (1.0 - lhi).max(0.0);
        let explanation = format!(
            "Learning Health Index: {:.1}%. Holistic analysis including behavioral and motivational factors.",
            lhi * 100.0
        );
        let mut score = Score::new(
            self.model_type(),
            probability,
            HOLISTIC_CONFIDENCE,
            explanation,
            *input.features,
        );
        score.lhi = Some(lhi);
        score
    }
}

/// Current health adjusted by the change since the previous week.
#[derive(Debug, Clone, Default)]
pub struct Temporal;

impl Scorer for Temporal {
    fn model_type(&self) -> ModelType {
        ModelType::Temporal
    }

    fn score(&self, input: &ScoringInput<'_>) -> Score {
        let health = HEALTH_WEIGHTS.dot(input.features);
        let baseline = 1.0 - health;

        let (probability, explanation) = match input.previous {
            Some(previous) => {
                let trend = health - HEALTH_WEIGHTS.dot(previous);
                (
                    clamp_probability(baseline - TEMPORAL_TREND_WEIGHT * trend),
                    format!(
                        "Health {:.1}%, {:+.1} pts versus the previous week.",
                        health * 100.0,
                        trend * 100.0
                    ),
                )
            }
            None => (
                clamp_probability(baseline),
                format!(
                    "Health {:.1}%. No prior week available; scored on the current week only.",
                    health * 100.0
                ),
            ),
        };

        Score::new(
            self.model_type(),
            probability,
            TEMPORAL_CONFIDENCE,
            explanation,
            *input.features,
        )
    }
}

/// Blends a stored rule-based prediction with a stored ML prediction for the
/// same student and week. The result always lies between the two inputs.
pub fn combine_hybrid(rule_based: &Prediction, ml: &Prediction) -> Score {
    let a = rule_based.dropout_probability;
    let b = ml.dropout_probability;
    let probability = (HYBRID_RULE_WEIGHT * a + HYBRID_ML_WEIGHT * b).clamp(a.min(b), a.max(b));
    let explanation = format!(
        "Hybrid model combining rule-based and {} predictions ({:.0}/{:.0} weighting).",
        ml.model_type,
        HYBRID_RULE_WEIGHT * 100.0,
        HYBRID_ML_WEIGHT * 100.0
    );
    Score::new(
        ModelType::Hybrid,
        probability,
        HYBRID_CONFIDENCE,
        explanation,
        ml.features,
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    pub(crate) fn features(attendance: f64, grade: f64, engagement: f64, behavior: f64) -> FeatureVector {
        FeatureVector {
            attendance,
            grade,
            engagement,
            behavior,
            subject_count: 1,
            assignment_completion: None,
        }
    }

    fn input(features: &FeatureVector) -> ScoringInput<'_> {
        ScoringInput {
            features,
            gamification: None,
            previous: None,
        }
    }

    fn prediction_with(model_type: ModelType, probability: f64) -> Prediction {
        Score::new(
            model_type,
            probability,
            0.5,
            String::new(),
            features(0.8, 0.8, 0.8, 0.8),
        )
        .into_prediction(Uuid::new_v4(), 1)
    }

    #[test]
    fn rule_based_adds_all_penalties_and_clamps() {
        let f = features(0.65, 0.45, 0.5, 0.7);
        let score = RuleBased::default().score(&input(&f));
        assert_eq!(score.dropout_probability, 1.0);
        assert_eq!(score.risk_level, RiskLevel::Critical);
        assert_eq!(score.confidence, RULE_BASED_CONFIDENCE);
        assert_eq!(
            score.explanation,
            "Attendance below 70%. Grades below 50%. Low engagement detected."
        );
    }

    #[test]
    fn rule_based_nominal_student_is_low_risk() {
        let f = features(0.70, 0.50, 0.60, 0.1);
        let score = RuleBased::default().score(&input(&f));
        assert_eq!(score.dropout_probability, 0.0);
        assert_eq!(score.risk_level, RiskLevel::Low);
        assert_eq!(score.explanation, "All metrics within acceptable range.");
    }

    #[test]
    fn simulated_ml_matches_weighted_formula() {
        let f = features(0.90, 0.85, 0.9, 0.8);
        let score = SimulatedMl::named("random-forest").score(&input(&f));
        assert!((score.dropout_probability - 0.1275).abs() < 1e-9);
        assert_eq!(score.risk_level, RiskLevel::Low);
        assert_eq!(score.confidence, ML_CONFIDENCE);
        assert_eq!(score.model_type, ModelType::Ml("random-forest".to_string()));
        assert_eq!(
            score.explanation,
            "random-forest analysis: Attendance 90.0%, Grades 85.0%, Engagement 90.0%"
        );
    }

    #[test]
    fn hybrid_blends_stored_predictions() {
        let rule = prediction_with(ModelType::RuleBased, 0.2);
        let mut ml = prediction_with(ModelType::Ml("random-forest".to_string()), 0.6);
        ml.features = features(0.5, 0.4, 0.3, 0.2);

        let score = combine_hybrid(&rule, &ml);
        assert!((score.dropout_probability - 0.44).abs() < 1e-9);
        assert_eq!(score.risk_level, RiskLevel::Medium);
        assert_eq!(score.confidence, HYBRID_CONFIDENCE);
        assert_eq!(score.model_type, ModelType::Hybrid);
        assert_eq!(score.features, ml.features);
    }

    #[test]
    fn holistic_streak_bonus_is_capped() {
        assert_eq!(streak_bonus(0), 0.0);
        assert!((streak_bonus(1) - 1.0 / 30.0).abs() < 1e-12);
        assert!((streak_bonus(2) - 2.0 / 30.0).abs() < 1e-12);
        assert_eq!(streak_bonus(3), STREAK_BONUS_CAP);
        assert_eq!(streak_bonus(15), STREAK_BONUS_CAP);
        assert_eq!(streak_bonus(300), STREAK_BONUS_CAP);
        assert_eq!(streak_bonus(-4), 0.0);
    }

    #[test]
    fn holistic_uses_gamification_streak() {
        let f = features(0.8, 0.7, 0.6, 0.9);
        let state = GamificationState {
            student_id: Uuid::new_v4(),
            xp: 1200,
            streak: 6,
            badges: BTreeSet::new(),
            last_activity: Utc::now(),
        };
        let without = Holistic.score(&input(&f));
        let with = Holistic.score(&ScoringInput {
            features: &f,
            gamification: Some(&state),
            previous: None,
        });

        let base = 0.25 * 0.8 + 0.35 * 0.7 + 0.25 * 0.6 + 0.15 * 0.9;
        assert!((without.lhi.unwrap() - base).abs() < 1e-9);
        assert!((with.lhi.unwrap() - (base + STREAK_BONUS_CAP)).abs() < 1e-9);
        assert!(with.dropout_probability < without.dropout_probability);
        assert_eq!(with.confidence, HOLISTIC_CONFIDENCE);
        assert!(with.explanation.starts_with("Learning Health Index: "));
    }

    #[test]
    fn holistic_probability_never_negative() {
        let f = features(1.0, 1.0, 1.0, 1.0);
        let state = GamificationState {
            student_id: Uuid::new_v4(),
            xp: 0,
            streak: 90,
            badges: BTreeSet::new(),
            last_activity: Utc::now(),
        };
        let score = Holistic.score(&ScoringInput {
            features: &f,
            gamification: Some(&state),
            previous: None,
        });
        assert!((score.lhi.unwrap() - 1.10).abs() < 1e-9);
        assert_eq!(score.dropout_probability, 0.0);
        assert_eq!(score.risk_level, RiskLevel::Low);
    }

    #[test]
    fn temporal_penalizes_decline_and_rewards_recovery() {
        let current = features(0.6, 0.6, 0.6, 0.6);
        let better = features(0.9, 0.9, 0.9, 0.9);
        let worse = features(0.3, 0.3, 0.3, 0.3);

        let flat = Temporal.score(&input(&current));
        assert!((flat.dropout_probability - 0.4).abs() < 1e-9);
        assert!(flat.explanation.contains("No prior week"));

        let declining = Temporal.score(&ScoringInput {
            features: &current,
            gamification: None,
            previous: Some(&better),
        });
        assert!((declining.dropout_probability - 0.55).abs() < 1e-9);
        assert_eq!(declining.risk_level, RiskLevel::High);

        let recovering = Temporal.score(&ScoringInput {
            features: &current,
            gamification: None,
            previous: Some(&worse),
        });
        assert!((recovering.dropout_probability - 0.25).abs() < 1e-9);
        assert_eq!(recovering.risk_level, RiskLevel::Low);
        assert_eq!(recovering.confidence, TEMPORAL_CONFIDENCE);
    }

    fn unit() -> impl Strategy<Value = f64> {
        0.0f64..=1.0
    }

    proptest! {
        #[test]
        fn rule_based_is_zero_above_thresholds(
            attendance in 0.70f64..=1.0,
            grade in 0.50f64..=1.0,
            engagement in 0.60f64..=1.0,
            behavior in unit(),
        ) {
            let f = features(attendance, grade, engagement, behavior);
            let score = RuleBased::default().score(&input(&f));
            prop_assert_eq!(score.dropout_probability, 0.0);
            prop_assert_eq!(score.risk_level, RiskLevel::Low);
        }

        #[test]
        fn hybrid_is_convex(a in unit(), b in unit()) {
            let rule = prediction_with(ModelType::RuleBased, a);
            let ml = prediction_with(ModelType::Ml("random-forest".to_string()), b);
            let p = combine_hybrid(&rule, &ml).dropout_probability;
            prop_assert!(p >= a.min(b) && p <= a.max(b));
        }

        #[test]
        fn lhi_stays_in_range(
            attendance in unit(),
            grade in unit(),
            engagement in unit(),
            behavior in unit(),
            streak in 0i32..400,
        ) {
            let f = features(attendance, grade, engagement, behavior);
            let lhi = learning_health_index(&f, streak);
            prop_assert!(lhi >= 0.0 && lhi <= 1.10 + 1e-9);
            prop_assert!((1.0 - lhi).max(0.0) >= 0.0);
        }

        #[test]
        fn every_scorer_emits_a_probability(
            attendance in unit(),
            grade in unit(),
            engagement in unit(),
            behavior in unit(),
        ) {
            let f = features(attendance, grade, engagement, behavior);
            let scorers: Vec<Box<dyn Scorer>> = vec![
                Box::new(RuleBased::default()),
                Box::new(SimulatedMl::named("random-forest")),
                Box::new(Holistic),
                Box::new(Temporal),
            ];
            for scorer in scorers {
                let score = scorer.score(&input(&f));
                prop_assert!((0.0..=1.0).contains(&score.dropout_probability));
                prop_assert_eq!(score.risk_level, risk::classify(score.dropout_probability));
            }
        }
    }
}
