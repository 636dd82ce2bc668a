//! The evolutionary algorithm: population composition across generations,
//! the idea-id scheme, and risk-adjusted scoring.
//!
//! Everything in this module is a pure function of its inputs so the
//! generation-to-generation behaviour can be tested without a store or an
//! LLM in the loop.

pub mod scoring;

use evosolve_db::models::{Idea, ScoredIdea};

/// How many offspring vs. wildcards to request from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestSplit {
    pub offspring: u32,
    pub wildcards: u32,
}

/// Compute the variator request for one generation.
///
/// `carried` is the number of top performers forwarded by reference from the
/// previous generation; the model is only asked for the remaining slots.
/// Offspring are derived from prior top performers, so generation 1 (or an
/// empty carry) is all wildcards regardless of the ratio.
pub fn request_split(
    population_size: u32,
    offspring_ratio: f64,
    carried: u32,
    has_parents: bool,
) -> RequestSplit {
    let new_slots = population_size.saturating_sub(carried);

    if !has_parents {
        return RequestSplit {
            offspring: 0,
            wildcards: new_slots,
        };
    }

    let target_offspring = (population_size as f64 * offspring_ratio).floor() as u32;
    let offspring = target_offspring.min(new_slots);
    RequestSplit {
        offspring,
        wildcards: new_slots - offspring,
    }
}

/// Render the canonical idea id for a generation and ordinal: `VAR_GEN{g}_{nnn}`.
pub fn idea_id(generation: u32, ordinal: u32) -> String {
    format!("VAR_GEN{generation}_{ordinal:03}")
}

/// Check that an id matches `VAR_GEN{g}_{nnn}` for the given generation.
pub fn is_valid_idea_id(generation: u32, id: &str) -> bool {
    let Some(rest) = id.strip_prefix(&format!("VAR_GEN{generation}_")) else {
        return false;
    };
    rest.len() == 3 && rest.chars().all(|c| c.is_ascii_digit()) && rest != "000"
}

/// Normalize ids and offspring flags on the model's output.
///
/// Models drift on both fields, so the worker owns them: ids are reassigned
/// sequentially from 1, and the offspring flag is set positionally (the
/// prompt instructs the model to list offspring first).
pub fn normalize_new_ideas(ideas: &mut [Idea], generation: u32, split: RequestSplit) {
    for (i, idea) in ideas.iter_mut().enumerate() {
        idea.idea_id = idea_id(generation, i as u32 + 1);
        idea.is_offspring = (i as u32) < split.offspring;
    }
}

/// Build the persisted population for a generation: carried top performers
/// first (keeping their original ids and enrichment lineage), then the new
/// ideas.
pub fn merge_population(carried: &[ScoredIdea], new_ideas: Vec<Idea>) -> Vec<Idea> {
    let mut population: Vec<Idea> = carried
        .iter()
        .map(|s| s.enriched.idea.clone())
        .collect();
    population.extend(new_ideas);
    population
}
