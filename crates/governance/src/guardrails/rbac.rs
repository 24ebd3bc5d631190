use control_plane::EffectivePolicy;
use regex::Regex;
use serde_json::{json, Value};

use crate::guardrails::{EvaluationResult, GuardrailConfigError};
use crate::jsonrpc;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DefaultAction {
    Allow,
    Deny,
}

pub struct ToolPattern {
    source: String,
    regex: Regex,
}

impl ToolPattern {
    fn compile(pattern: &str) -> Result<Self, GuardrailConfigError> {
        // `*` is the only wildcard: zero or more of any character,
        // anchored full-string, case-sensitive.
        let escaped = regex::escape(pattern).replace(r"\*", ".*");
        let regex = Regex::new(&format!("^{escaped}$"))
            .map_err(|err| GuardrailConfigError::new("rbac", err.to_string()))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    fn matches(&self, tool: &str) -> bool {
        self.regex.is_match(tool)
    }
}

/// Tool access control on the request direction.
pub struct RbacConfig {
    default_action: DefaultAction,
    allowed: Vec<ToolPattern>,
    denied: Vec<ToolPattern>,
}

impl RbacConfig {
    pub fn from_policy(policy: &EffectivePolicy) -> Result<Self, GuardrailConfigError> {
        let default_action = match policy.config.get("default_action").and_then(Value::as_str) {
            Some("allow") => DefaultAction::Allow,
            Some("deny") | None => DefaultAction::Deny,
            Some(other) => {
                return Err(GuardrailConfigError::new(
                    "rbac",
                    format!("default_action must be allow or deny, got {other}"),
                ))
            }
        };
        Ok(Self {
            default_action,
            allowed: compile_patterns(&policy.config, "allowed_tools")?,
            denied: compile_patterns(&policy.config, "denied_tools")?,
        })
    }

    pub fn evaluate(&self, body: &Value) -> EvaluationResult {
        let Some(tool) = jsonrpc::effective_tool_name(body) else {
            return EvaluationResult::allow();
        };

        if let Some(pattern) = self.denied.iter().find(|pattern| pattern.matches(&tool)) {
            return EvaluationResult::block(json!({
                "tool": tool,
                "matched_pattern": pattern.source,
                "match_type": "denied_tools",
            }));
        }

        if let Some(pattern) = self.allowed.iter().find(|pattern| pattern.matches(&tool)) {
            return EvaluationResult::allow_with(json!({
                "tool": tool,
                "matched_pattern": pattern.source,
                "match_type": "allowed_tools",
            }));
        }

        if !self.allowed.is_empty() {
            return EvaluationResult::block(json!({
                "tool": tool,
                "match_type": "not_in_allowed_list",
            }));
        }

        match self.default_action {
            DefaultAction::Deny => EvaluationResult::block(json!({
                "tool": tool,
                "match_type": "default_deny",
            })),
            DefaultAction::Allow => EvaluationResult::allow_with(json!({
                "tool": tool,
                "match_type": "default_allow",
            })),
        }
    }
}

fn compile_patterns(config: &Value, field: &str) -> Result<Vec<ToolPattern>, GuardrailConfigError> {
    let Some(values) = config.get(field) else {
        return Ok(Vec::new());
    };
    let values = values
        .as_array()
        .ok_or_else(|| GuardrailConfigError::new("rbac", format!("{field} must be a list")))?;
    let mut patterns = Vec::with_capacity(values.len());
    for value in values {
        let pattern = value
            .as_str()
            .ok_or_else(|| GuardrailConfigError::new("rbac", format!("{field} entries must be strings")))?;
        patterns.push(ToolPattern::compile(pattern)?);
    }
    Ok(patterns)
}
