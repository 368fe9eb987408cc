/// Execution time at or above which no speed bonus is awarded
const BONUS_THRESHOLD_MS: i64 = 1000;
/// Milliseconds saved per bonus point
const BONUS_STEP_MS: i64 = 20;

/// Score awarded for an accepted run
///
/// Faster runs earn `(1000 - time) / 20` bonus points, capped so the total
/// never exceeds one and a half times the base score. Without a known
/// execution time the base score is returned unchanged.
pub fn score(base_score: u32, execution_time_ms: Option<u64>) -> u32 {
    let Some(time_ms) = execution_time_ms else {
        return base_score;
    };

    let time_ms = i64::try_from(time_ms).unwrap_or(i64::MAX);
    let bonus = (BONUS_THRESHOLD_MS.saturating_sub(time_ms) / BONUS_STEP_MS).max(0) as u64;
    let cap = u64::from(base_score) * 3 / 2;

    u32::try_from((u64::from(base_score) + bonus).min(cap)).unwrap_or(u32::MAX)
}
