//! Tolerant JSON parsing for model output.
//!
//! Models that are not running in native structured-output mode wrap JSON in
//! prose, markdown fences, or cut it off mid-array. The parser tries, in
//! order: a direct parse, a parse after stripping fences, a parse of the
//! first balanced `{...}` / `[...]` substring, and finally a repair pass
//! that fixes trailing commas and closes unbalanced brackets.

use serde_json::Value;

use crate::error::EngineError;

/// Parse model output into a JSON value, applying the escalating recovery
/// steps. Fails only when every step fails.
pub fn parse_tolerant(raw: &str) -> Result<Value, EngineError> {
    let trimmed = raw.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    if let Some(stripped) = strip_fences(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(stripped.trim()) {
            return Ok(value);
        }
    }

    if let Some(candidate) = extract_balanced(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            return Ok(value);
        }
        // The extracted region is the best candidate for repair.
        if let Ok(value) = serde_json::from_str::<Value>(&repair(candidate)) {
            return Ok(value);
        }
    }

    if let Ok(value) = serde_json::from_str::<Value>(&repair(trimmed)) {
        return Ok(value);
    }

    Err(EngineError::LlmParse(format!(
        "unparseable model output (first 200 chars: {:?})",
        &trimmed.chars().take(200).collect::<String>()
    )))
}

/// Normalize a parsed response into the list of items for `key`.
///
/// Accepts `{key: [...]}`, a bare array, or a single object (treated as a
/// one-element array).
pub fn items_for_key(value: Value, key: &str) -> Vec<Value> {
    match value {
        Value::Object(mut map) => match map.remove(key) {
            Some(Value::Array(items)) => items,
            Some(single @ Value::Object(_)) => vec![single],
            // The model skipped the wrapper and returned a single item.
            _ => vec![Value::Object(map)],
        },
        Value::Array(items) => items,
        other => vec![other],
    }
}

/// Pull the contents out of the first markdown code fence.
fn strip_fences(raw: &str) -> Option<String> {
    let start = raw.find("```")?;
    let after_fence = &raw[start + 3..];
    // Skip the language tag line (e.g. "json").
    let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_fence[body_start..];
    let end = body.find("```").unwrap_or(body.len());
    Some(body[..end].to_owned())
}

/// Find the first balanced `{...}` or `[...]` region, respecting strings.
fn extract_balanced(raw: &str) -> Option<&str> {
    let start = raw.find(['{', '['])?;
    let bytes = raw.as_bytes();
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            _ if b == open => depth += 1,
            _ if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Best-effort repair: drop trailing commas and close unbalanced brackets.
fn repair(raw: &str) -> String {
    let start = raw.find(['{', '[']).unwrap_or(0);
    let candidate = &raw[start..];

    let mut out = String::with_capacity(candidate.len() + 4);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in candidate.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' => {
                stack.push('}');
                out.push(c);
            }
            '[' => {
                stack.push(']');
                out.push(c);
            }
            '}' | ']' => {
                // Drop a trailing comma left before this closer.
                while out.ends_with(|p: char| p.is_whitespace()) {
                    out.pop();
                }
                if out.ends_with(',') {
                    out.pop();
                }
                if stack.last() == Some(&c) {
                    stack.pop();
                }
                out.push(c);
            }
            _ => out.push(c),
        }
    }

    // A string cut off mid-value: terminate it before closing brackets.
    if in_string {
        out.push('"');
    }
    while out.ends_with(|p: char| p.is_whitespace()) {
        out.pop();
    }
    if out.ends_with(',') {
        out.pop();
    }
    while let Some(close) = stack.pop() {
        out.push(close);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn direct_parse() {
        let value = parse_tolerant(r#"{"ideas": [{"title": "x"}]}"#).unwrap();
        assert_eq!(value["ideas"][0]["title"], "x");
    }

    #[test]
    fn fenced_json() {
        let raw = "Here you go:\n```json\n{\"ideas\": []}\n```\nHope that helps!";
        let value = parse_tolerant(raw).unwrap();
        assert_eq!(value, json!({"ideas": []}));
    }

    #[test]
    fn fenced_without_language_tag() {
        let raw = "```\n[1, 2, 3]\n```";
        let value = parse_tolerant(raw).unwrap();
        assert_eq!(value, json!([1, 2, 3]));
    }

    #[test]
    fn embedded_object_in_prose() {
        let raw = "Sure! The answer is {\"a\": [1, 2], \"b\": \"text with } brace\"} as requested.";
        let value = parse_tolerant(raw).unwrap();
        assert_eq!(value["a"], json!([1, 2]));
        assert_eq!(value["b"], "text with } brace");
    }

    #[test]
    fn trailing_comma_repair() {
        let raw = r#"{"ideas": [{"title": "x"},]}"#;
        let value = parse_tolerant(raw).unwrap();
        assert_eq!(value["ideas"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn truncated_array_repair() {
        let raw = r#"{"ideas": [{"title": "one"}, {"title": "two""#;
        let value = parse_tolerant(raw).unwrap();
        let ideas = value["ideas"].as_array().unwrap();
        assert_eq!(ideas.len(), 2);
        assert_eq!(ideas[1]["title"], "two");
    }

    #[test]
    fn hopeless_input_fails() {
        let err = parse_tolerant("I could not produce any ideas, sorry.").unwrap_err();
        assert!(matches!(err, EngineError::LlmParse(_)));
    }

    #[test]
    fn empty_input_fails() {
        assert!(parse_tolerant("").is_err());
    }

    #[test]
    fn items_from_wrapper_object() {
        let items = items_for_key(json!({"ideas": [{"t": 1}, {"t": 2}]}), "ideas");
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn items_from_bare_array() {
        let items = items_for_key(json!([{"t": 1}]), "ideas");
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn single_object_becomes_one_element_array() {
        let items = items_for_key(json!({"title": "only one"}), "ideas");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["title"], "only one");
    }

    #[test]
    fn wrapper_with_single_object_value() {
        let items = items_for_key(json!({"ideas": {"title": "solo"}}), "ideas");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["title"], "solo");
    }
}
