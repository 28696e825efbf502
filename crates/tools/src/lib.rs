//! Tool-argument validation and output encoding.
//!
//! Model-produced tool calls arrive as raw JSON text. Before a tool function
//! runs, its arguments are parsed and checked against the tool's declared
//! JSON Schema; failures become typed, per-field messages that flow back to
//! the model as error outputs instead of invoking the tool.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// JSON pointer into the argument object (empty for the root).
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("arguments are not valid JSON: {0}")]
    ArgumentsNotJson(String),
    #[error("arguments do not match the declared schema: {}", format_field_errors(.0))]
    ArgumentsInvalid(Vec<FieldError>),
    #[error("schema is invalid: {0}")]
    SchemaInvalid(String),
    #[error("tool execution failed: {0}")]
    Execution(String),
}

fn format_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, ToolError>;

/// Parse `raw_arguments` and validate it against `schema`.
///
/// Returns the parsed argument object on success. Parse failures and schema
/// violations are distinct errors so callers can phrase the report back to
/// the model precisely.
pub fn validate_arguments(schema: &Value, raw_arguments: &str) -> Result<Value> {
    let parsed: Value = serde_json::from_str(raw_arguments)
        .map_err(|e| ToolError::ArgumentsNotJson(e.to_string()))?;

    let validator =
        jsonschema::validator_for(schema).map_err(|e| ToolError::SchemaInvalid(e.to_string()))?;

    let errors: Vec<FieldError> = validator
        .iter_errors(&parsed)
        .map(|error| FieldError {
            path: error.instance_path().to_string(),
            message: error.to_string(),
        })
        .collect();

    if errors.is_empty() {
        Ok(parsed)
    } else {
        Err(ToolError::ArgumentsInvalid(errors))
    }
}

/// Encode a tool's return value for the chat history. Strings come out
/// double-quoted; `null` maps to an empty output.
pub fn encode_output(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        other => serde_json::to_string(other).unwrap_or_else(|_| other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn weather_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "location": { "type": "string" },
                "unit": { "type": "string", "enum": ["celsius", "fahrenheit"] }
            },
            "required": ["location"],
            "additionalProperties": false
        })
    }

    #[test]
    fn valid_arguments_pass_through() {
        let parsed =
            validate_arguments(&weather_schema(), r#"{"location":"Paris"}"#).unwrap();
        assert_eq!(parsed["location"], "Paris");
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = validate_arguments(&weather_schema(), r#"{"location":"#).unwrap_err();
        assert!(matches!(err, ToolError::ArgumentsNotJson(_)));
    }

    #[test]
    fn wrong_type_reports_the_field() {
        let err = validate_arguments(&weather_schema(), r#"{"location":123}"#).unwrap_err();
        match err {
            ToolError::ArgumentsInvalid(errors) => {
                assert!(!errors.is_empty());
                assert!(errors[0].path.contains("location"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_required_field_is_reported() {
        let err = validate_arguments(&weather_schema(), r#"{}"#).unwrap_err();
        assert!(matches!(err, ToolError::ArgumentsInvalid(_)));
        assert!(err.to_string().contains("location"));
    }

    #[test]
    fn string_outputs_are_double_quoted() {
        assert_eq!(encode_output(&json!("22°C")), "\"22°C\"");
        assert_eq!(encode_output(&json!({"temp": 22})), r#"{"temp":22}"#);
        assert_eq!(encode_output(&Value::Null), "");
    }
}
