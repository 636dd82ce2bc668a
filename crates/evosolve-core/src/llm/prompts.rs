//! Prompt builders for the variator and enricher phases.

use evosolve_db::models::{Idea, ScoredIdea};

use crate::evolve::RequestSplit;

/// Build the variator prompt for one generation.
///
/// When offspring are requested, the top performers are quoted verbatim
/// (id, score, description) so the model mutates and recombines real prior
/// winners rather than inventing its own memory of them.
pub fn variator_prompt(
    problem_context: &str,
    generation: u32,
    split: RequestSplit,
    top_performers: &[ScoredIdea],
) -> String {
    let total = split.offspring + split.wildcards;
    let mut prompt = format!(
        "You are generating business ideas for the following problem:\n\n\
         {problem_context}\n\n\
         This is generation {generation} of an evolutionary search. \
         Produce exactly {total} ideas as JSON: \
         {{\"ideas\": [{{\"idea_id\", \"title\", \"description\", \
         \"core_mechanism\", \"is_offspring\"}}]}}.\n"
    );

    if split.offspring > 0 && !top_performers.is_empty() {
        prompt.push_str(&format!(
            "\nFirst, produce {} OFFSPRING ideas (is_offspring: true), listed first. \
             Each offspring must mutate, recombine, or sharpen one or more of \
             these top performers from the previous generation:\n",
            split.offspring
        ));
        for performer in top_performers {
            prompt.push_str(&format!(
                "- {} (score {:.2}): {}\n",
                performer.idea_id(),
                performer.score,
                performer.enriched.idea.description
            ));
        }
    }

    if split.wildcards > 0 {
        prompt.push_str(&format!(
            "\nThen produce {} WILDCARD ideas (is_offspring: false): fresh, \
             diverse approaches unrelated to the previous generation. Favor \
             mechanisms not yet represented above.\n",
            split.wildcards
        ));
    }

    prompt.push_str(
        "\nEvery idea needs a short title, a 2-3 sentence description, and a \
         one-sentence core_mechanism naming how it makes money.\n",
    );
    prompt
}

/// Shared description of the business-case fields the enricher must fill.
fn business_case_contract() -> &'static str {
    "For each idea produce a business_case with:\n\
     - npv_success: net present value if the venture succeeds, in millions USD\n\
     - capex_est: upfront capital required, in millions USD (minimum 0.05)\n\
     - timeline_months: months to first revenue\n\
     - likelihood: probability of success, between 0 and 1\n\
     - risk_factors: at least one concrete risk\n\
     - yearly_cashflows: exactly 5 yearly net cashflows in millions USD, \
       starting with year 1 (typically negative early)\n"
}

/// Build the batch enricher prompt for a whole population.
pub fn enricher_batch_prompt(problem_context: &str, ideas: &[Idea]) -> String {
    let mut prompt = format!(
        "You are a conservative business analyst. Problem context:\n\n\
         {problem_context}\n\n\
         Project a realistic business case for each of the following ideas. \
         Respond as JSON: {{\"enriched_ideas\": [{{\"idea_id\", \
         \"business_case\"}}]}}. Keep every idea_id exactly as given and \
         return nothing else per item.\n\n"
    );
    prompt.push_str(business_case_contract());
    prompt.push_str("\nIdeas:\n");
    for idea in ideas {
        prompt.push_str(&format!(
            "- {} | {} | {} | mechanism: {}\n",
            idea.idea_id, idea.title, idea.description, idea.core_mechanism
        ));
    }
    prompt
}

/// Build the per-idea enricher prompt.
pub fn enricher_idea_prompt(problem_context: &str, idea: &Idea) -> String {
    format!(
        "You are a conservative business analyst. Problem context:\n\n\
         {problem_context}\n\n\
         Project a realistic business case for this idea:\n\
         id: {}\ntitle: {}\ndescription: {}\ncore_mechanism: {}\n\n\
         {}\n\
         Respond as JSON: {{\"enriched_ideas\": [{{\"idea_id\": \"{}\", \
         \"business_case\"}}]}}.",
        idea.idea_id,
        idea.title,
        idea.description,
        idea.core_mechanism,
        business_case_contract(),
        idea.idea_id,
    )
}
