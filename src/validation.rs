//! Request body validation.
//!
//! Bodies are parsed to a JSON value first, checked against the type's
//! [`Schema`] rules, and only then deserialized. Every rule that fails is
//! reported, formatted as `"<path>: <message>"` and joined with `", "`.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt;

use crate::models::{ChatRequest, CodeRequest};

pub const INVALID_JSON: &str = "Invalid JSON body";

const MAX_MESSAGES: usize = 100;
const MAX_MODEL_ID: usize = 100;
const MAX_LANGUAGE: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(String);

impl ValidationError {
    pub fn message(&self) -> &str {
        &self.0
    }

    fn from_issues(issues: &[Issue]) -> Self {
        let joined = issues
            .iter()
            .map(Issue::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        Self(joined)
    }
}

pub type ValidatedRequest<T> = Result<T, ValidationError>;

// Single failed rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub path: String,
    pub message: String,
}

impl Issue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Structural rules for a request body type.
pub trait Schema: DeserializeOwned {
    fn check(value: &Value, issues: &mut Vec<Issue>);
}

pub fn validate<T: Schema>(body: &[u8]) -> ValidatedRequest<T> {
    let value: Value =
        serde_json::from_slice(body).map_err(|_| ValidationError(INVALID_JSON.to_string()))?;

    let mut issues = Vec::new();
    T::check(&value, &mut issues);
    if !issues.is_empty() {
        return Err(ValidationError::from_issues(&issues));
    }

    // rules passed, anything serde still rejects is reported at the root
    serde_json::from_value(value)
        .map_err(|e| ValidationError::from_issues(&[Issue::new("", e.to_string())]))
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn expect_object<'a>(
    value: &'a Value,
    path: &str,
    issues: &mut Vec<Issue>,
) -> Option<&'a Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map),
        other => {
            issues.push(Issue::new(
                path,
                format!("Expected object, received {}", type_name(other)),
            ));
            None
        }
    }
}

fn string_field(
    obj: &Map<String, Value>,
    path: &str,
    key: &str,
    bounds: (usize, usize),
    required: bool,
    issues: &mut Vec<Issue>,
) -> Option<String> {
    let field = join(path, key);
    match obj.get(key) {
        None if required => {
            issues.push(Issue::new(field, "Required"));
            None
        }
        None => None,
        Some(Value::String(s)) => {
            let len = s.chars().count();
            if len < bounds.0 {
                issues.push(Issue::new(
                    field,
                    format!("String must contain at least {} character(s)", bounds.0),
                ));
            } else if len > bounds.1 {
                issues.push(Issue::new(
                    field,
                    format!("String must contain at most {} character(s)", bounds.1),
                ));
            }
            Some(s.clone())
        }
        Some(other) => {
            issues.push(Issue::new(
                field,
                format!("Expected string, received {}", type_name(other)),
            ));
            None
        }
    }
}

fn array_field<'a>(
    obj: &'a Map<String, Value>,
    path: &str,
    key: &str,
    bounds: (usize, usize),
    required: bool,
    issues: &mut Vec<Issue>,
) -> Option<&'a Vec<Value>> {
    let field = join(path, key);
    match obj.get(key) {
        None if required => {
            issues.push(Issue::new(field, "Required"));
            None
        }
        None => None,
        Some(Value::Array(items)) => {
            if items.len() < bounds.0 {
                issues.push(Issue::new(
                    field,
                    format!("Array must contain at least {} element(s)", bounds.0),
                ));
            } else if items.len() > bounds.1 {
                issues.push(Issue::new(
                    field,
                    format!("Array must contain at most {} element(s)", bounds.1),
                ));
            }
            Some(items)
        }
        Some(other) => {
            issues.push(Issue::new(
                field,
                format!("Expected array, received {}", type_name(other)),
            ));
            None
        }
    }
}

fn check_message(value: &Value, path: &str, issues: &mut Vec<Issue>) {
    let Some(obj) = expect_object(value, path, issues) else {
        return;
    };

    let role_path = join(path, "role");
    match obj.get("role") {
        None => issues.push(Issue::new(role_path, "Required")),
        Some(Value::String(role)) if matches!(role.as_str(), "system" | "user" | "assistant") => {}
        Some(Value::String(role)) => issues.push(Issue::new(
            role_path,
            format!(
                "Invalid enum value. Expected 'system' | 'user' | 'assistant', received '{role}'"
            ),
        )),
        Some(other) => issues.push(Issue::new(
            role_path,
            format!("Expected string, received {}", type_name(other)),
        )),
    }

    string_field(obj, path, "content", (0, usize::MAX), false, issues);
    if let Some(parts) = array_field(obj, path, "parts", (0, usize::MAX), false, issues) {
        for (i, part) in parts.iter().enumerate() {
            check_part(part, &join(&join(path, "parts"), &i.to_string()), issues);
        }
    }
    if !obj.contains_key("content") && !obj.contains_key("parts") {
        issues.push(Issue::new(path, "Message must have content or parts"));
    }
}

// Text-bearing parts need their text, other part types pass through
fn check_part(value: &Value, path: &str, issues: &mut Vec<Issue>) {
    let Some(part) = expect_object(value, path, issues) else {
        return;
    };
    let kind = string_field(part, path, "type", (1, usize::MAX), true, issues);
    if matches!(kind.as_deref(), Some("text" | "reasoning")) {
        string_field(part, path, "text", (0, usize::MAX), true, issues);
    }
}

// Rules shared by both AI routes
fn check_messages_and_model(obj: &Map<String, Value>, issues: &mut Vec<Issue>) {
    if let Some(messages) = array_field(obj, "", "messages", (1, MAX_MESSAGES), true, issues) {
        for (i, message) in messages.iter().enumerate() {
            check_message(message, &format!("messages.{i}"), issues);
        }
    }
    string_field(obj, "", "modelId", (1, MAX_MODEL_ID), true, issues);
}

impl Schema for ChatRequest {
    fn check(value: &Value, issues: &mut Vec<Issue>) {
        if let Some(obj) = expect_object(value, "", issues) {
            check_messages_and_model(obj, issues);
        }
    }
}

impl Schema for CodeRequest {
    fn check(value: &Value, issues: &mut Vec<Issue>) {
        if let Some(obj) = expect_object(value, "", issues) {
            check_messages_and_model(obj, issues);
            string_field(obj, "", "language", (1, MAX_LANGUAGE), false, issues);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    #[test]
    fn unparseable_body_is_invalid_json() {
        for body in [&b"{not json"[..], &b""[..], &b"\xff\xfe"[..]] {
            let err = validate::<ChatRequest>(body).unwrap_err();
            assert_eq!(err.message(), INVALID_JSON);
        }
    }

    #[test]
    fn valid_chat_body_yields_typed_data() {
        let body = br#"{"messages":[{"role":"user","content":"hi"}],"modelId":"openai/gpt-4o"}"#;
        let req = validate::<ChatRequest>(body).unwrap();
        assert_eq!(req.model_id, "openai/gpt-4o");
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].role, Role::User);
    }

    #[test]
    fn missing_field_mentions_its_path() {
        let err = validate::<ChatRequest>(br#"{"messages":[{"role":"user","content":"hi"}]}"#)
            .unwrap_err();
        assert_eq!(err.message(), "modelId: Required");
    }

    #[test]
    fn empty_messages_is_rejected() {
        let err = validate::<ChatRequest>(br#"{"messages":[],"modelId":"m"}"#).unwrap_err();
        assert_eq!(
            err.message(),
            "messages: Array must contain at least 1 element(s)"
        );
    }

    #[test]
    fn issues_are_joined_in_order() {
        let err = validate::<CodeRequest>(br#"{"messages":"nope","modelId":"","language":""}"#)
            .unwrap_err();
        assert_eq!(
            err.message(),
            "messages: Expected array, received string, \
             modelId: String must contain at least 1 character(s), \
             language: String must contain at least 1 character(s)"
        );
    }

    #[test]
    fn nested_message_paths_are_reported() {
        let err = validate::<ChatRequest>(
            br#"{"messages":[{"role":"user","content":"a"},{"role":"robot","content":"b"},{"content":"c"}],"modelId":"m"}"#,
        )
        .unwrap_err();
        assert!(err.message().contains("messages.1.role: Invalid enum value"));
        assert!(err.message().contains("messages.2.role: Required"));
    }

    #[test]
    fn text_parts_must_carry_text() {
        let err = validate::<ChatRequest>(
            br#"{"messages":[{"role":"user","parts":[{"type":"text"}]}],"modelId":"m"}"#,
        )
        .unwrap_err();
        assert_eq!(err.message(), "messages.0.parts.0.text: Required");

        let err = validate::<ChatRequest>(
            br#"{"messages":[{"role":"user","parts":[{"type":"step-start"},{"type":"reasoning","text":7}]}],"modelId":"m"}"#,
        )
        .unwrap_err();
        assert_eq!(
            err.message(),
            "messages.0.parts.1.text: Expected string, received number"
        );
    }

    #[test]
    fn too_many_messages_and_long_model_id() {
        let messages: Vec<_> = (0..101)
            .map(|_| serde_json::json!({"role": "user", "content": "x"}))
            .collect();
        let body = serde_json::json!({"messages": messages, "modelId": "m".repeat(101)});
        let err = validate::<ChatRequest>(body.to_string().as_bytes()).unwrap_err();
        assert!(err.message().contains("messages: Array must contain at most 100 element(s)"));
        assert!(err.message().contains("modelId: String must contain at most 100 character(s)"));
    }

    #[test]
    fn language_is_optional_for_code() {
        let req = validate::<CodeRequest>(
            br#"{"messages":[{"role":"user","parts":[{"type":"text","text":"fizzbuzz"}]}],"modelId":"m"}"#,
        )
        .unwrap();
        assert!(req.language.is_none());
        assert_eq!(req.messages[0].plain_text(), "fizzbuzz");
    }

    #[test]
    fn non_object_root_is_rejected() {
        let err = validate::<ChatRequest>(b"[1,2]").unwrap_err();
        assert_eq!(err.message(), "Expected object, received array");
    }
}
