//! Tolerant extraction of JSON from raw model output.
//!
//! Local models wrap JSON in markdown fences, prefix it with prose, leave
//! trailing commas, or stop mid-object when they hit the token limit. The
//! parser absorbs all of these and reports failure as a value, never a panic.

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedShape {
    Object,
    Array,
    /// An array, either bare or under the named key of a wrapper object.
    ArrayField(&'static str),
    Any,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseResult {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    /// True when the JSON only parsed after repair.
    pub repaired: bool,
}

impl ParseResult {
    fn ok(data: Value, repaired: bool) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            repaired,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            repaired: false,
        }
    }

    pub fn into_typed<T: DeserializeOwned>(self) -> Result<T, String> {
        match self.data {
            Some(data) if self.success => {
                serde_json::from_value(data).map_err(|e| format!("unexpected JSON structure: {}", e))
            }
            _ => Err(self.error.unwrap_or_else(|| "no data".to_string())),
        }
    }
}

pub struct LlmResponseParser;

impl LlmResponseParser {
    pub fn parse(raw_text: &str, expected: ExpectedShape) -> ParseResult {
        let trimmed = raw_text.trim();
        if trimmed.is_empty() {
            return ParseResult::failed("empty response".to_string());
        }

        let unfenced = strip_code_fences(trimmed);
        let mut last_error = String::new();
        let candidates: &[&str] = if unfenced != trimmed {
            &[unfenced, trimmed]
        } else {
            &[trimmed]
        };

        for candidate in candidates {
            let Some(json_text) = strip_leading_prose(candidate, expected) else {
                last_error = format!("no JSON object or array found in: {}", preview(candidate));
                continue;
            };

            let (value, repaired) = match parse_first_value(json_text) {
                Ok(value) => (value, false),
                Err(strict_error) => match repair(json_text) {
                    Some(value) => (value, true),
                    None => {
                        last_error = format!(
                            "invalid JSON ({}) and repair failed: {}",
                            strict_error,
                            preview(json_text)
                        );
                        continue;
                    }
                },
            };

            match conform(value, expected) {
                Ok(mut value) => {
                    clamp_confidence(&mut value);
                    return ParseResult::ok(value, repaired);
                }
                Err(e) => last_error = e,
            }
        }

        ParseResult::failed(last_error)
    }

    /// Parse an array response and deserialize each element independently.
    /// Elements that do not fit `T` are dropped and reported by index.
    pub fn parse_items<T: DeserializeOwned>(
        raw_text: &str,
        expected: ExpectedShape,
    ) -> Result<(Vec<T>, Vec<String>), String> {
        let result = Self::parse(raw_text, expected);
        match result.data {
            Some(data) if result.success => Self::deserialize_items(data),
            _ => Err(result.error.unwrap_or_else(|| "no data".to_string())),
        }
    }

    pub fn deserialize_items<T: DeserializeOwned>(data: Value) -> Result<(Vec<T>, Vec<String>), String> {
        let Value::Array(elements) = data else {
            return Err("expected a JSON array".to_string());
        };

        let mut items = Vec::new();
        let mut rejected = Vec::new();
        for (index, element) in elements.into_iter().enumerate() {
            match serde_json::from_value::<T>(element) {
                Ok(item) => items.push(item),
                Err(e) => rejected.push(format!("item {} dropped: {}", index, e)),
            }
        }
        Ok((items, rejected))
    }
}

/// Accept a string, a list of strings/numbers, or null where a list of
/// strings is expected.
pub fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<Value>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(value)) if value.trim().is_empty() => Vec::new(),
        Some(OneOrMany::One(value)) => vec![value.trim().to_string()],
        Some(OneOrMany::Many(values)) => values
            .into_iter()
            .filter_map(|value| match value {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
    })
}

fn strip_code_fences(text: &str) -> &str {
    let Some(open) = text.find("```") else {
        return text;
    };
    let after = &text[open + 3..];
    let body_start = match after.find('\n') {
        Some(newline)
            if after[..newline]
                .trim()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') =>
        {
            newline + 1
        }
        _ => 0,
    };
    let body = &after[body_start..];
    match body.find("```") {
        Some(close) => body[..close].trim(),
        // Unterminated fence: the response was cut off.
        None => body.trim(),
    }
}

fn strip_leading_prose(text: &str, expected: ExpectedShape) -> Option<&str> {
    let object = text.find('{');
    let array = text.find('[');
    let start = match expected {
        ExpectedShape::Object => object.or(array),
        ExpectedShape::Array => array.or(object),
        ExpectedShape::ArrayField(_) | ExpectedShape::Any => match (object, array) {
            (Some(o), Some(a)) => Some(o.min(a)),
            (o, a) => o.or(a),
        },
    }?;
    Some(&text[start..])
}

/// Parse the first JSON value, ignoring any trailing prose.
fn parse_first_value(text: &str) -> Result<Value, String> {
    let mut stream = serde_json::Deserializer::from_str(text).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) => Ok(value),
        Some(Err(e)) => Err(e.to_string()),
        None => Err("no JSON value".to_string()),
    }
}

fn trailing_comma() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r",(\s*[}\]])").expect("static regex"))
}

fn repair(text: &str) -> Option<Value> {
    let without_commas = trailing_comma().replace_all(text, "$1");
    if let Ok(value) = parse_first_value(&without_commas) {
        return Some(value);
    }

    let balanced = close_truncated(&without_commas)?;
    let balanced = trailing_comma().replace_all(&balanced, "$1");
    parse_first_value(&balanced).ok()
}

/// Cut the text after the last complete nested value and close whatever is
/// still open.
fn close_truncated(text: &str) -> Option<String> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut last_safe: Option<(usize, Vec<char>)> = None;

    for (index, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(ch) {
                    break;
                }
                if stack.is_empty() {
                    return Some(text[..=index].to_string());
                }
                last_safe = Some((index + 1, stack.clone()));
            }
            _ => {}
        }
    }

    let (end, open) = last_safe?;
    let mut repaired = text[..end].trim_end().to_string();
    for closer in open.iter().rev() {
        repaired.push(*closer);
    }
    Some(repaired)
}

fn conform(value: Value, expected: ExpectedShape) -> Result<Value, String> {
    match expected {
        ExpectedShape::Any => Ok(value),
        ExpectedShape::Object => match value {
            Value::Object(_) => Ok(value),
            Value::Array(mut items) if items.len() == 1 && items[0].is_object() => {
                Ok(items.remove(0))
            }
            _ => Err("expected a JSON object".to_string()),
        },
        ExpectedShape::Array => match value {
            Value::Array(_) => Ok(value),
            Value::Object(map) => {
                let mut arrays: Vec<Value> =
                    map.into_iter().map(|(_, v)| v).filter(Value::is_array).collect();
                if arrays.len() == 1 {
                    Ok(arrays.remove(0))
                } else {
                    Err("expected a JSON array".to_string())
                }
            }
            _ => Err("expected a JSON array".to_string()),
        },
        ExpectedShape::ArrayField(key) => match value {
            Value::Array(_) => Ok(value),
            Value::Object(mut map) => {
                if let Some(field) = map.remove(key) {
                    return if field.is_array() {
                        Ok(field)
                    } else {
                        Err(format!("field '{}' is not an array", key))
                    };
                }
                let array_fields: Vec<&String> =
                    map.iter().filter(|(_, v)| v.is_array()).map(|(k, _)| k).collect();
                match array_fields.len() {
                    0 => Ok(Value::Array(vec![Value::Object(map)])),
                    1 => {
                        let only = array_fields[0].clone();
                        Ok(map.remove(&only).unwrap_or(Value::Null))
                    }
                    _ => Err(format!("missing '{}' array in response", key)),
                }
            }
            _ => Err(format!("expected '{}' array", key)),
        },
    }
}

fn clamp_confidence(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, field) in map.iter_mut() {
                if key == "confidence" {
                    let number = match field {
                        Value::Number(n) => n.as_f64(),
                        Value::String(s) => s.trim().parse::<f64>().ok(),
                        _ => None,
                    };
                    if let Some(number) = number {
                        let clamped = if number.is_finite() { number.clamp(0.0, 1.0) } else { 0.0 };
                        if let Some(n) = serde_json::Number::from_f64(clamped) {
                            *field = Value::Number(n);
                        }
                    }
                } else {
                    clamp_confidence(field);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(clamp_confidence),
        _ => {}
    }
}

fn preview(text: &str) -> String {
    let short: String = text.chars().take(120).collect();
    if short.len() < text.len() {
        format!("{}...", short)
    } else {
        short
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_object() {
        let result = LlmResponseParser::parse(r#"{"a": 1}"#, ExpectedShape::Object);
        assert!(result.success);
        assert_eq!(result.data, Some(json!({"a": 1})));
        assert!(!result.repaired);
    }

    #[test]
    fn test_fenced_json_block() {
        let raw = "```json\n{\"features\": [{\"description\": \"Alarm handling\"}]}\n```";
        let result = LlmResponseParser::parse(raw, ExpectedShape::ArrayField("features"));
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.data, Some(json!([{"description": "Alarm handling"}])));
    }

    #[test]
    fn test_leading_prose_before_object() {
        let raw = "Sure! Here is the analysis you asked for:\n{\"hazard\": \"Overdose\", \"severity\": \"SERIOUS\"}\nLet me know if you need more.";
        let result = LlmResponseParser::parse(raw, ExpectedShape::Object);
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.data.unwrap()["hazard"], "Overdose");
    }

    #[test]
    fn test_trailing_comma_repaired() {
        let raw = r#"{"items": [1, 2, 3,], "name": "x",}"#;
        let result = LlmResponseParser::parse(raw, ExpectedShape::Object);
        assert!(result.success, "{:?}", result.error);
        assert!(result.repaired);
        assert_eq!(result.data, Some(json!({"items": [1, 2, 3], "name": "x"})));
    }

    #[test]
    fn test_truncated_response_keeps_complete_items() {
        let raw = r#"{"features": [{"description": "Dose limit"}, {"description": "Alarm", "confid"#;
        let result = LlmResponseParser::parse(raw, ExpectedShape::ArrayField("features"));
        assert!(result.success, "{:?}", result.error);
        assert!(result.repaired);
        assert_eq!(result.data, Some(json!([{"description": "Dose limit"}])));
    }

    #[test]
    fn test_unterminated_fence() {
        let raw = "```json\n[{\"description\": \"Pump control\"}]";
        let result = LlmResponseParser::parse(raw, ExpectedShape::Array);
        assert!(result.success, "{:?}", result.error);
    }

    #[test]
    fn test_garbage_reports_error_without_panicking() {
        let result = LlmResponseParser::parse("I cannot help with that.", ExpectedShape::Object);
        assert!(!result.success);
        assert!(result.data.is_none());
        assert!(result.error.unwrap().contains("no JSON"));

        let result = LlmResponseParser::parse("", ExpectedShape::Any);
        assert!(!result.success);

        let result = LlmResponseParser::parse("{{{{", ExpectedShape::Object);
        assert!(!result.success);
    }

    #[test]
    fn test_confidence_is_clamped() {
        let raw = r#"[{"confidence": 1.7}, {"confidence": -0.2}, {"confidence": "0.4"}, {"nested": {"confidence": 3}}]"#;
        let data = LlmResponseParser::parse(raw, ExpectedShape::Array).data.unwrap();
        assert_eq!(data[0]["confidence"], json!(1.0));
        assert_eq!(data[1]["confidence"], json!(0.0));
        assert_eq!(data[2]["confidence"], json!(0.4));
        assert_eq!(data[3]["nested"]["confidence"], json!(1.0));
    }

    #[test]
    fn test_array_field_accepts_single_object() {
        let raw = r#"{"hazard": "Data loss", "severity": "MINOR"}"#;
        let data = LlmResponseParser::parse(raw, ExpectedShape::ArrayField("hazards"))
            .data
            .unwrap();
        assert_eq!(data, json!([{"hazard": "Data loss", "severity": "MINOR"}]));
    }

    #[test]
    fn test_object_expected_but_array_of_many() {
        let result = LlmResponseParser::parse("[1, 2]", ExpectedShape::Object);
        assert!(!result.success);
    }

    #[test]
    fn test_parse_items_drops_bad_elements() {
        #[derive(serde::Deserialize)]
        struct Item {
            text: String,
        }
        let raw = r#"{"items": [{"text": "ok"}, {"other": 1}, {"text": "also ok"}]}"#;
        let (items, rejected) =
            LlmResponseParser::parse_items::<Item>(raw, ExpectedShape::ArrayField("items")).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].text, "also ok");
        assert_eq!(rejected.len(), 1);
        assert!(rejected[0].starts_with("item 1 dropped"));
    }
}
