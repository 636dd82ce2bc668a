//! Risk-adjusted scoring, preference filtering, ranking, and top-performer
//! selection.

use evosolve_db::models::{BusinessCase, EnrichedIdea, Preferences, ScoredIdea};

use crate::error::EngineError;

/// Outcome of ranking one generation's enriched population.
#[derive(Debug, Clone)]
pub struct RankOutcome {
    /// Non-violating ideas first (score desc), then violating (score desc).
    /// Ranks run 1..n over the whole sequence.
    pub solutions: Vec<ScoredIdea>,
    pub top_score: f64,
    pub avg_score: f64,
}

/// Score one business case.
///
/// `score = (p·npv − (1−p)·capex) / sqrt(capex / c0)` where `c0` is the
/// reference capex for the diversification penalty.
pub fn score_business_case(case: &BusinessCase, c0: f64) -> Result<f64, EngineError> {
    if case.capex_est <= 0.0 {
        return Err(EngineError::NumericValidation(format!(
            "capex_est must be positive, got {}",
            case.capex_est
        )));
    }
    if c0 <= 0.0 {
        return Err(EngineError::NumericValidation(format!(
            "diversification factor must be positive, got {c0}"
        )));
    }

    let p = case.likelihood;
    let expected_value = p * case.npv_success - (1.0 - p) * case.capex_est;
    let penalty = (case.capex_est / c0).sqrt();
    let score = expected_value / penalty;

    if !score.is_finite() {
        return Err(EngineError::NumericValidation(format!(
            "score is not finite for npv={} capex={} likelihood={}",
            case.npv_success, case.capex_est, case.likelihood
        )));
    }

    Ok(score)
}

/// Rank a generation's enriched population.
///
/// The preference filter never drops an idea: a capex breach marks it as
/// violating and pushes it behind every non-violating idea, but it still
/// carries a score so the evolutionary signal survives populations where
/// everything violates.
pub fn rank(
    enriched: &[EnrichedIdea],
    preferences: &Preferences,
    c0: f64,
) -> Result<RankOutcome, EngineError> {
    if enriched.is_empty() {
        return Err(EngineError::NumericValidation(
            "cannot rank an empty population".to_owned(),
        ));
    }

    let mut passing: Vec<ScoredIdea> = Vec::new();
    let mut violating: Vec<ScoredIdea> = Vec::new();

    for item in enriched {
        let score = score_business_case(&item.business_case, c0)?;
        let violates = item.business_case.capex_est > preferences.max_capex;
        let preference_note = violates.then(|| {
            format!(
                "capex_est {:.2}M exceeds maxCapex {:.2}M",
                item.business_case.capex_est, preferences.max_capex
            )
        });

        let scored = ScoredIdea {
            enriched: item.clone(),
            score,
            rank: 0,
            violates_preferences: violates,
            preference_note,
        };
        if violates {
            violating.push(scored);
        } else {
            passing.push(scored);
        }
    }

    // Scores are verified finite above, so the comparison is total.
    let by_score_desc =
        |a: &ScoredIdea, b: &ScoredIdea| b.score.partial_cmp(&a.score).expect("finite scores");
    passing.sort_by(by_score_desc);
    violating.sort_by(by_score_desc);

    let mut solutions = passing;
    solutions.append(&mut violating);
    for (i, s) in solutions.iter_mut().enumerate() {
        s.rank = i as u32 + 1;
    }

    let top_score = solutions
        .iter()
        .map(|s| s.score)
        .fold(f64::NEG_INFINITY, f64::max);
    let avg_score = solutions.iter().map(|s| s.score).sum::<f64>() / solutions.len() as f64;

    Ok(RankOutcome {
        solutions,
        top_score,
        avg_score,
    })
}

/// Pick the top performers to carry into the next generation.
///
/// Takes from the non-violating head first and backfills from the violating
/// head, so a fully violating population still forwards a signal.
pub fn select_top_performers(solutions: &[ScoredIdea], top_select_count: usize) -> Vec<ScoredIdea> {
    let mut selected: Vec<ScoredIdea> = solutions
        .iter()
        .filter(|s| !s.violates_preferences)
        .take(top_select_count)
        .cloned()
        .collect();

    if selected.len() < top_select_count {
        let shortfall = top_select_count - selected.len();
        selected.extend(
            solutions
                .iter()
                .filter(|s| s.violates_preferences)
                .take(shortfall)
                .cloned(),
        );
    }

    selected
}
