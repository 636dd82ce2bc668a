//! Phase response schemas and item validation.
//!
//! The schemas are handed to providers that support native structured
//! output. Validation runs on everything regardless of mode: items missing
//! required fields are dropped, and a response with zero valid items fails
//! the call.

use serde::Deserialize;
use serde_json::{Value, json};

use evosolve_db::models::{BusinessCase, Idea};

use crate::error::EngineError;
use crate::llm::parse::items_for_key;

/// Minimum capex the enricher may assign: a $50K floor, in millions USD.
pub const MIN_CAPEX: f64 = 0.05;

/// Schema for the variator response: `{ideas: [Idea]}`.
pub fn variator_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "ideas": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "idea_id": {"type": "string"},
                        "title": {"type": "string"},
                        "description": {"type": "string"},
                        "core_mechanism": {"type": "string"},
                        "is_offspring": {"type": "boolean"},
                    },
                    "required": ["idea_id", "title", "description", "core_mechanism", "is_offspring"],
                    "additionalProperties": false,
                },
            },
        },
        "required": ["ideas"],
        "additionalProperties": false,
    })
}

/// Schema for the enricher response: `{enriched_ideas: [{idea_id,
/// business_case}]}`. The worker already holds the idea text, so the model
/// only returns the id and the projection; they are merged back by id.
pub fn enricher_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "enriched_ideas": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "idea_id": {"type": "string"},
                        "business_case": {
                            "type": "object",
                            "properties": {
                                "npv_success": {"type": "number"},
                                "capex_est": {"type": "number", "minimum": MIN_CAPEX},
                                "timeline_months": {"type": "number"},
                                "likelihood": {"type": "number", "minimum": 0, "maximum": 1},
                                "risk_factors": {"type": "array", "items": {"type": "string"}, "minItems": 1},
                                "yearly_cashflows": {
                                    "type": "array",
                                    "items": {"type": "number"},
                                    "minItems": 5,
                                    "maxItems": 5,
                                },
                            },
                            "required": ["npv_success", "capex_est", "timeline_months",
                                         "likelihood", "risk_factors", "yearly_cashflows"],
                            "additionalProperties": false,
                        },
                    },
                    "required": ["idea_id", "business_case"],
                    "additionalProperties": false,
                },
            },
        },
        "required": ["enriched_ideas"],
        "additionalProperties": false,
    })
}

/// Lenient intermediate for variator items: ids and flags are reassigned by
/// the worker, so only the textual fields are required.
#[derive(Deserialize)]
struct RawIdea {
    #[serde(default)]
    idea_id: String,
    title: Option<String>,
    description: Option<String>,
    core_mechanism: Option<String>,
    #[serde(default)]
    is_offspring: bool,
}

/// Extract valid ideas from a parsed variator response.
///
/// Items missing any of the textual fields are dropped; zero survivors is a
/// parse failure.
pub fn ideas_from_response(value: Value) -> Result<Vec<Idea>, EngineError> {
    let items = items_for_key(value, "ideas");
    let total = items.len();

    let ideas: Vec<Idea> = items
        .into_iter()
        .filter_map(|item| {
            let raw: RawIdea = serde_json::from_value(item).ok()?;
            Some(Idea {
                idea_id: raw.idea_id,
                title: raw.title?,
                description: raw.description?,
                core_mechanism: raw.core_mechanism?,
                is_offspring: raw.is_offspring,
            })
        })
        .collect();

    if ideas.is_empty() {
        return Err(EngineError::LlmParse(format!(
            "no valid ideas in response ({total} items, all dropped)"
        )));
    }
    Ok(ideas)
}

/// Validate a business case against the numeric contract.
pub fn validate_business_case(case: &BusinessCase) -> Result<(), EngineError> {
    if !(0.0..=1.0).contains(&case.likelihood) {
        return Err(EngineError::NumericValidation(format!(
            "likelihood {} outside [0, 1]",
            case.likelihood
        )));
    }
    if case.capex_est < MIN_CAPEX {
        return Err(EngineError::NumericValidation(format!(
            "capex_est {} below the {MIN_CAPEX} floor",
            case.capex_est
        )));
    }
    if case.yearly_cashflows.len() != 5 {
        return Err(EngineError::NumericValidation(format!(
            "yearly_cashflows has {} entries, expected 5",
            case.yearly_cashflows.len()
        )));
    }
    if case.risk_factors.is_empty() {
        return Err(EngineError::NumericValidation(
            "risk_factors must not be empty".to_owned(),
        ));
    }
    for v in [case.npv_success, case.capex_est, case.timeline_months] {
        if !v.is_finite() {
            return Err(EngineError::NumericValidation(
                "business case contains a non-finite number".to_owned(),
            ));
        }
    }
    Ok(())
}

/// One enricher response item: the id plus its business case. The worker
/// merges it back onto the idea it already holds.
#[derive(Debug, Clone, Deserialize)]
pub struct EnrichedItem {
    pub idea_id: String,
    pub business_case: BusinessCase,
}

/// Extract valid enrichment items from a parsed enricher response.
///
/// Items that fail to deserialize or violate the numeric bounds are
/// dropped; zero survivors is a parse failure.
pub fn enriched_from_response(value: Value) -> Result<Vec<EnrichedItem>, EngineError> {
    let items = items_for_key(value, "enriched_ideas");
    let total = items.len();

    let enriched: Vec<EnrichedItem> = items
        .into_iter()
        .filter_map(|item| {
            let parsed: EnrichedItem = serde_json::from_value(item).ok()?;
            validate_business_case(&parsed.business_case).ok()?;
            Some(parsed)
        })
        .collect();

    if enriched.is_empty() {
        return Err(EngineError::LlmParse(format!(
            "no valid enriched ideas in response ({total} items, all dropped)"
        )));
    }
    Ok(enriched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_case() -> Value {
        json!({
            "npv_success": 4.0,
            "capex_est": 0.5,
            "timeline_months": 18,
            "likelihood": 0.6,
            "risk_factors": ["competition"],
            "yearly_cashflows": [-0.5, 0.2, 0.8, 1.5, 2.0],
        })
    }

    #[test]
    fn ideas_drop_incomplete_items() {
        let value = json!({"ideas": [
            {"idea_id": "x", "title": "Good", "description": "d", "core_mechanism": "m", "is_offspring": false},
            {"title": "No description"},
        ]});
        let ideas = ideas_from_response(value).unwrap();
        assert_eq!(ideas.len(), 1);
        assert_eq!(ideas[0].title, "Good");
    }

    #[test]
    fn ideas_tolerate_missing_id_and_flag() {
        let value = json!({"ideas": [
            {"title": "t", "description": "d", "core_mechanism": "m"},
        ]});
        let ideas = ideas_from_response(value).unwrap();
        assert_eq!(ideas.len(), 1);
        assert!(!ideas[0].is_offspring);
    }

    #[test]
    fn zero_valid_ideas_is_parse_failure() {
        let value = json!({"ideas": [{"title": "only a title"}]});
        let err = ideas_from_response(value).unwrap_err();
        assert!(matches!(err, EngineError::LlmParse(_)));
    }

    #[test]
    fn enriched_happy_path() {
        // Exactly the shape the strict schema permits: id plus case.
        let value = json!({"enriched_ideas": [{
            "idea_id": "VAR_GEN1_001",
            "business_case": valid_case(),
        }]});
        let enriched = enriched_from_response(value).unwrap();
        assert_eq!(enriched.len(), 1);
        assert_eq!(enriched[0].idea_id, "VAR_GEN1_001");
    }

    #[test]
    fn enriched_drops_out_of_bounds_items() {
        let mut bad_case = valid_case();
        bad_case["likelihood"] = json!(1.4);
        let value = json!({"enriched_ideas": [
            {"idea_id": "a", "business_case": valid_case()},
            {"idea_id": "b", "business_case": bad_case},
        ]});
        let enriched = enriched_from_response(value).unwrap();
        assert_eq!(enriched.len(), 1);
        assert_eq!(enriched[0].idea_id, "a");
    }

    #[test]
    fn capex_floor_enforced() {
        let case = BusinessCase {
            npv_success: 1.0,
            capex_est: 0.01,
            timeline_months: 12.0,
            likelihood: 0.5,
            risk_factors: vec!["r".into()],
            yearly_cashflows: vec![0.0; 5],
        };
        assert!(validate_business_case(&case).is_err());
    }

    #[test]
    fn cashflow_length_enforced() {
        let case = BusinessCase {
            npv_success: 1.0,
            capex_est: 0.5,
            timeline_months: 12.0,
            likelihood: 0.5,
            risk_factors: vec!["r".into()],
            yearly_cashflows: vec![0.0; 4],
        };
        assert!(validate_business_case(&case).is_err());
    }

    #[test]
    fn schemas_are_objects_with_required_keys() {
        let v = variator_schema();
        assert_eq!(v["required"][0], "ideas");
        let e = enricher_schema();
        assert_eq!(e["required"][0], "enriched_ideas");
    }
}
