use std::collections::BTreeSet;

use anyhow::Context;
use chrono::{TimeZone, Utc};
use uuid::Uuid;

use crate::models::{GamificationState, PerformanceRecord};

pub struct SeedStudent {
    pub id: Uuid,
    pub full_name: &'static str,
    pub email: &'static str,
    pub cohort: &'static str,
}

pub struct SeedData {
    pub students: Vec<SeedStudent>,
    pub performance: Vec<PerformanceRecord>,
    pub gamification: Vec<GamificationState>,
}

const SUBJECTS: [&str; 3] = ["Mathematics", "English", "Science"];

/// Per student: (week 1, week 2) rows of attendance, grade, engagement,
/// behavior, assignments completed. Values repeat across subjects with a
/// small per-subject offset.
const PROFILES: [[(f64, f64, f64, f64, i32); 2]; 3] = [
    [(94.0, 88.0, 0.9, 0.85, 10), (92.0, 86.0, 0.88, 0.85, 9)],
    [(82.0, 64.0, 0.7, 0.75, 8), (71.0, 55.0, 0.58, 0.7, 6)],
    [(66.0, 48.0, 0.52, 0.6, 5), (58.0, 41.0, 0.45, 0.55, 3)],
];

/// (xp, streak, badges)
const PROGRESS: [(i64, i32, &[&str]); 3] = [
    (12_400, 27, &["Active Learner", "Consistent Performer"]),
    (4_800, 6, &["Active Learner"]),
    (900, 0, &[]),
];

pub fn sample() -> anyhow::Result<SeedData> {
    let students = vec![
        SeedStudent {
            id: Uuid::parse_str("3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2")?,
            full_name: "Avery Lee",
            email: "avery.lee@example.edu",
            cohort: "2026",
        },
        SeedStudent {
            id: Uuid::parse_str("0c22f1f1-9184-4fd4-9b21-28c68a6a89dc")?,
            full_name: "Jules Moreno",
            email: "jules.moreno@example.edu",
            cohort: "2025",
        },
        SeedStudent {
            id: Uuid::parse_str("d5a0a1a2-2a3c-44c2-8f73-60b7897a9dd2")?,
            full_name: "Kiara Patel",
            email: "kiara.patel@example.edu",
            cohort: "2026",
        },
    ];

    let mut performance = Vec::new();
    for (student, weeks) in students.iter().zip(PROFILES.iter()) {
        for (week_index, (attendance, grade, engagement, behavior, completed)) in
            weeks.iter().enumerate()
        {
            for (offset, subject) in SUBJECTS.iter().enumerate() {
                let shift = offset as f64 - 1.0;
                performance.push(PerformanceRecord {
                    student_id: student.id,
                    subject: subject.to_string(),
                    week_number: week_index as i32 + 1,
                    attendance: (attendance + 2.0 * shift).clamp(0.0, 100.0),
                    grade: (grade + 3.0 * shift).clamp(0.0, 100.0),
                    engagement: (engagement + 0.02 * shift).clamp(0.0, 1.0),
                    behavior_score: *behavior,
                    assignments_completed: *completed,
                    assignments_total: 10,
                });
            }
        }
    }

    let last_activity = Utc
        .with_ymd_and_hms(2026, 2, 2, 9, 0, 0)
        .single()
        .context("invalid seed timestamp")?;
    let gamification = students
        .iter()
        .zip(PROGRESS.iter())
        .map(|(student, (xp, streak, badges))| GamificationState {
            student_id: student.id,
            xp: *xp,
            streak: *streak,
            badges: badges.iter().map(|b| b.to_string()).collect::<BTreeSet<_>>(),
            last_activity,
        })
        .collect();

    Ok(SeedData {
        students,
        performance,
        gamification,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{validate_gamification, validate_record};

    #[test]
    fn seed_rows_are_valid() {
        let data = sample().unwrap();
        assert_eq!(data.students.len(), 3);
        assert_eq!(data.performance.len(), 3 * 2 * SUBJECTS.len());
        assert!(data.performance.iter().all(|r| validate_record(r).is_ok()));
        assert!(data.gamification.iter().all(|g| validate_gamification(g).is_ok()));
        assert_eq!(data.gamification[0].level(), 13);
    }
}
