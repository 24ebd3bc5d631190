pub mod content;
pub mod pii;
pub mod rate_limit;
pub mod rbac;

use control_plane::{
    Direction, EffectivePolicy, GuardrailKind, RateCounterStore, RequestContext,
};
use serde_json::{json, Value};
use thiserror::Error;

/// Per-policy direction narrowing for PII and content guardrails.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScanDirection {
    Request,
    Response,
    Both,
}

impl ScanDirection {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "request" => Some(Self::Request),
            "response" => Some(Self::Response),
            "both" => Some(Self::Both),
            _ => None,
        }
    }

    pub fn covers(&self, direction: Direction) -> bool {
        match self {
            Self::Both => true,
            Self::Request => direction == Direction::Request,
            Self::Response => direction == Direction::Response,
        }
    }
}

pub(crate) fn scan_direction(config: &Value) -> ScanDirection {
    config
        .get("direction")
        .and_then(Value::as_str)
        .and_then(ScanDirection::parse)
        .unwrap_or(ScanDirection::Both)
}

#[derive(Debug)]
pub enum EvalAction {
    Allow,
    Block,
    RedactWith(Value),
    Throttle(u64),
    LogOnly,
}

impl EvalAction {
    pub fn label(&self) -> &'static str {
        match self {
            EvalAction::Allow => "allow",
            EvalAction::Block => "block",
            EvalAction::RedactWith(_) => "redact",
            EvalAction::Throttle(_) => "throttle",
            EvalAction::LogOnly => "log_only",
        }
    }
}

#[derive(Debug)]
pub struct EvaluationResult {
    pub action: EvalAction,
    pub triggered: bool,
    pub details: Value,
}

impl EvaluationResult {
    pub fn allow() -> Self {
        Self {
            action: EvalAction::Allow,
            triggered: false,
            details: json!({}),
        }
    }

    pub fn allow_with(details: Value) -> Self {
        Self {
            action: EvalAction::Allow,
            triggered: false,
            details,
        }
    }

    pub fn block(details: Value) -> Self {
        Self {
            action: EvalAction::Block,
            triggered: true,
            details,
        }
    }

    pub fn redact(body: Value, details: Value) -> Self {
        Self {
            action: EvalAction::RedactWith(body),
            triggered: true,
            details,
        }
    }

    pub fn throttle(retry_after_seconds: u64, details: Value) -> Self {
        Self {
            action: EvalAction::Throttle(retry_after_seconds),
            triggered: true,
            details,
        }
    }

    pub fn log_only(details: Value) -> Self {
        Self {
            action: EvalAction::LogOnly,
            triggered: true,
            details,
        }
    }
}

#[derive(Debug, Error)]
#[error("invalid {guardrail} config: {reason}")]
pub struct GuardrailConfigError {
    pub guardrail: &'static str,
    pub reason: String,
}

impl GuardrailConfigError {
    pub fn new(guardrail: &'static str, reason: impl Into<String>) -> Self {
        Self {
            guardrail,
            reason: reason.into(),
        }
    }
}

/// One configured guardrail as a value: kind, typed config, and a pure
/// evaluation function. The pipeline is a sequence of these.
pub enum Evaluator {
    Rbac(rbac::RbacConfig),
    Pii(pii::PiiConfig),
    ContentSize(content::ContentSizeConfig),
    RateLimit(rate_limit::RateLimitConfig),
}

impl Evaluator {
    pub fn from_policy(policy: &EffectivePolicy) -> Result<Self, GuardrailConfigError> {
        match policy.guardrail {
            GuardrailKind::Rbac => Ok(Self::Rbac(rbac::RbacConfig::from_policy(policy)?)),
            GuardrailKind::PiiSsn
            | GuardrailKind::PiiCreditCard
            | GuardrailKind::PiiEmail
            | GuardrailKind::PiiPhone
            | GuardrailKind::PiiIpAddress => Ok(Self::Pii(pii::PiiConfig::from_policy(policy)?)),
            GuardrailKind::ContentLargeDocuments
            | GuardrailKind::ContentStructuredData
            | GuardrailKind::ContentSourceCode => Ok(Self::ContentSize(
                content::ContentSizeConfig::from_policy(policy)?,
            )),
            GuardrailKind::RateLimitPerMinute | GuardrailKind::RateLimitPerHour => Ok(
                Self::RateLimit(rate_limit::RateLimitConfig::from_policy(policy)?),
            ),
        }
    }

    pub fn kind(&self) -> GuardrailKind {
        match self {
            Self::Rbac(_) => GuardrailKind::Rbac,
            Self::Pii(config) => config.kind,
            Self::ContentSize(config) => config.kind,
            Self::RateLimit(config) => config.kind,
        }
    }

    pub fn applies_to(&self, direction: Direction) -> bool {
        if !self.kind().applies_to(direction) {
            return false;
        }
        match self {
            Self::Pii(config) => config.direction.covers(direction),
            Self::ContentSize(config) => config.direction.covers(direction),
            Self::Rbac(_) | Self::RateLimit(_) => true,
        }
    }

    pub fn evaluate(
        &self,
        body: &Value,
        ctx: &RequestContext,
        counters: &dyn RateCounterStore,
    ) -> EvaluationResult {
        match self {
            Self::Rbac(config) => config.evaluate(body),
            Self::Pii(config) => config.evaluate(body),
            Self::ContentSize(config) => config.evaluate(body),
            Self::RateLimit(config) => config.evaluate(body, ctx, counters),
        }
    }
}
