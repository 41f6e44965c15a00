use uuid::Uuid;

use crate::error::{ensure_range, EngineError, EngineResult};
use crate::models::{FeatureVector, GamificationState, PerformanceRecord};

/// Averages one student's subject rows for a single week. Rows are weighted
/// equally regardless of subject.
pub fn aggregate(
    student_id: Uuid,
    week_number: i32,
    records: &[PerformanceRecord],
) -> EngineResult<FeatureVector> {
    if records.is_empty() {
        return Err(EngineError::InsufficientData {
            student_id,
            week_number,
        });
    }

    let mut attendance = 0.0;
    let mut grade = 0.0;
    let mut engagement = 0.0;
    let mut behavior = 0.0;
    let mut completed = 0i64;
    let mut assigned = 0i64;

    for record in records {
        validate_record(record)?;
        attendance += record.attendance;
        grade += record.grade;
        engagement += record.engagement;
        behavior += record.behavior_score;
        completed += i64::from(record.assignments_completed);
        assigned += i64::from(record.assignments_total);
    }

    let count = records.len() as f64;
    Ok(FeatureVector {
        attendance: attendance / count / 100.0,
        grade: grade / count / 100.0,
        engagement: engagement / count,
        behavior: behavior / count,
        subject_count: records.len(),
        assignment_completion: if assigned == 0 {
            None
        } else {
            Some(completed as f64 / assigned as f64)
        },
    })
}

pub fn validate_record(record: &PerformanceRecord) -> EngineResult<()> {
    ensure_range("attendance", record.attendance, 0.0, 100.0)?;
    ensure_range("grade", record.grade, 0.0, 100.0)?;
    ensure_range("engagement", record.engagement, 0.0, 1.0)?;
    ensure_range("behavior_score", record.behavior_score, 0.0, 1.0)?;
    if record.assignments_completed < 0 {
        return Err(EngineError::OutOfRange {
            field: "assignments_completed",
            value: f64::from(record.assignments_completed),
        });
    }
    if record.assignments_total < record.assignments_completed {
        return Err(EngineError::OutOfRange {
            field: "assignments_total",
            value: f64::from(record.assignments_total),
        });
    }
    Ok(())
}

pub fn validate_gamification(state: &GamificationState) -> EngineResult<()> {
    if state.streak < 0 {
        return Err(EngineError::OutOfRange {
            field: "streak",
            value: f64::from(state.streak),
        });
    }
    if state.xp < 0 {
        return Err(EngineError::OutOfRange {
            field: "xp",
            value: state.xp as f64,
        });
    }
    Ok(())
}
