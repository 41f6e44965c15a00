use crate::models::RiskLevel;

pub const CRITICAL_THRESHOLD: f64 = 0.70;
pub const HIGH_THRESHOLD: f64 = 0.50;
pub const MEDIUM_THRESHOLD: f64 = 0.30;

/// Maps a dropout probability to its risk band. Boundary values belong to the
/// higher band. Every scorer goes through here.
pub fn classify(probability: f64) -> RiskLevel {
    match probability {
        p if p >= CRITICAL_THRESHOLD => RiskLevel::Critical,
        p if p >= HIGH_THRESHOLD => RiskLevel::High,
        p if p >= MEDIUM_THRESHOLD => RiskLevel::Medium,
        _ => RiskLevel::Low,
    }
}

pub fn clamp_probability(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}
