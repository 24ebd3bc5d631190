use control_plane::{EffectivePolicy, GuardrailKind, PolicyAction};
use serde_json::{json, Value};

use crate::guardrails::{scan_direction, EvaluationResult, GuardrailConfigError, ScanDirection};

const DEFAULT_MAX_CHARS: usize = 10_000;
const DEFAULT_CODE_MAX_CHARS: usize = 5_000;
const DEFAULT_MAX_ROWS: usize = 50;

/// Size limits on body content. Detection is a single pass that stops at
/// the first violation.
pub struct ContentSizeConfig {
    pub kind: GuardrailKind,
    pub direction: ScanDirection,
    log_only: bool,
    max_chars: usize,
    max_rows: usize,
}

impl ContentSizeConfig {
    pub fn from_policy(policy: &EffectivePolicy) -> Result<Self, GuardrailConfigError> {
        let max_chars = usize_field(&policy.config, "max_chars")?.unwrap_or(match policy.guardrail
        {
            GuardrailKind::ContentSourceCode => DEFAULT_CODE_MAX_CHARS,
            _ => DEFAULT_MAX_CHARS,
        });
        let max_rows = usize_field(&policy.config, "max_rows")?.unwrap_or(DEFAULT_MAX_ROWS);
        Ok(Self {
            kind: policy.guardrail,
            direction: scan_direction(&policy.config),
            log_only: matches!(policy.action, PolicyAction::LogOnly | PolicyAction::Allow),
            max_chars,
            max_rows,
        })
    }

    pub fn evaluate(&self, current: &Value) -> EvaluationResult {
        let violation = match self.kind {
            GuardrailKind::ContentLargeDocuments => oversize_string(current, self.max_chars)
                .map(|size| json!({ "size": size, "max_chars": self.max_chars })),
            GuardrailKind::ContentStructuredData => oversize_array(current, self.max_rows)
                .map(|rows| json!({ "rows": rows, "max_rows": self.max_rows })),
            GuardrailKind::ContentSourceCode => oversize_code(current, self.max_chars)
                .map(|size| json!({ "size": size, "max_chars": self.max_chars })),
            _ => None,
        };

        match violation {
            None => EvaluationResult::allow(),
            Some(details) if self.log_only => EvaluationResult::log_only(details),
            Some(details) => EvaluationResult::block(details),
        }
    }
}

fn usize_field(config: &Value, field: &str) -> Result<Option<usize>, GuardrailConfigError> {
    match config.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|value| Some(value as usize))
            .ok_or_else(|| {
                GuardrailConfigError::new("content", format!("{field} must be a positive integer"))
            }),
    }
}

fn oversize_string(value: &Value, max_chars: usize) -> Option<usize> {
    match value {
        Value::String(text) if text.chars().count() > max_chars => Some(text.chars().count()),
        Value::Array(items) => items
            .iter()
            .find_map(|item| oversize_string(item, max_chars)),
        Value::Object(map) => map
            .values()
            .find_map(|item| oversize_string(item, max_chars)),
        _ => None,
    }
}

fn oversize_array(value: &Value, max_rows: usize) -> Option<usize> {
    match value {
        Value::Array(items) => {
            if items.len() > max_rows {
                return Some(items.len());
            }
            items.iter().find_map(|item| oversize_array(item, max_rows))
        }
        Value::Object(map) => map.values().find_map(|item| oversize_array(item, max_rows)),
        _ => None,
    }
}

/// A leaf counts as code when the text is triple-backtick fenced, or when
/// it sits in an object tagged `"type": "code"`.
fn oversize_code(value: &Value, max_chars: usize) -> Option<usize> {
    match value {
        Value::String(text) => {
            let length = text.chars().count();
            if text.contains("```") && length > max_chars {
                Some(length)
            } else {
                None
            }
        }
        Value::Array(items) => items.iter().find_map(|item| oversize_code(item, max_chars)),
        Value::Object(map) => {
            if map.get("type").and_then(Value::as_str) == Some("code") {
                let text = map
                    .get("text")
                    .or_else(|| map.get("content"))
                    .and_then(Value::as_str);
                if let Some(text) = text {
                    let length = text.chars().count();
                    if length > max_chars {
                        return Some(length);
                    }
                }
            }
            map.values().find_map(|item| oversize_code(item, max_chars))
        }
        _ => None,
    }
}
