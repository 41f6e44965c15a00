use uuid::Uuid;

use crate::models::ModelType;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("insufficient data: student {student_id} has no performance rows for week {week_number}")]
    InsufficientData { student_id: Uuid, week_number: i32 },
    #[error("{model} prediction for student {student_id} week {week_number} is not available yet")]
    MissingPrerequisite {
        student_id: Uuid,
        week_number: i32,
        model: ModelType,
    },
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    /// Only a missing hybrid prerequisite can succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::MissingPrerequisite { .. })
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Fails with `OutOfRange` unless `value` is finite and within `[min, max]`.
pub fn ensure_range(field: &'static str, value: f64, min: f64, max: f64) -> EngineResult<()> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(EngineError::OutOfRange { field, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_check_rejects_nan_and_bounds() {
        assert!(ensure_range("grade", 0.0, 0.0, 100.0).is_ok());
        assert!(ensure_range("grade", 100.0, 0.0, 100.0).is_ok());
        assert!(ensure_range("grade", -0.1, 0.0, 100.0).is_err());
        assert!(ensure_range("grade", f64::NAN, 0.0, 100.0).is_err());
    }

    #[test]
    fn only_missing_prerequisite_is_retryable() {
        let missing = EngineError::MissingPrerequisite {
            student_id: Uuid::new_v4(),
            week_number: 3,
            model: ModelType::RuleBased,
        };
        assert!(missing.is_retryable());
        let insufficient = EngineError::InsufficientData {
            student_id: Uuid::new_v4(),
            week_number: 3,
        };
        assert!(!insufficient.is_retryable());
        assert!(insufficient.to_string().contains("week 3"));
    }
}
