use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use control_plane::{
    EffectivePolicy, GuardrailKind, RateCounterStore, RequestContext,
};
use serde_json::{json, Value};
use tracing::warn;

use crate::guardrails::{EvaluationResult, GuardrailConfigError};
use crate::jsonrpc;

const DEFAULT_LIMIT_PER_MINUTE: u64 = 60;
const DEFAULT_LIMIT_PER_HOUR: u64 = 1_000;

/// Window counters shared across workers through the counter store.
/// Request direction only.
pub struct RateLimitConfig {
    pub kind: GuardrailKind,
    limit: u64,
    window_seconds: u64,
    sliding: bool,
    per_tool_limits: HashMap<String, u64>,
}

impl RateLimitConfig {
    pub fn from_policy(policy: &EffectivePolicy) -> Result<Self, GuardrailConfigError> {
        let (window_seconds, default_limit) = match policy.guardrail {
            GuardrailKind::RateLimitPerMinute => (60, DEFAULT_LIMIT_PER_MINUTE),
            GuardrailKind::RateLimitPerHour => (3_600, DEFAULT_LIMIT_PER_HOUR),
            _ => {
                return Err(GuardrailConfigError::new(
                    "rate_limit",
                    "not a rate limit guardrail",
                ))
            }
        };
        let limit = match policy.config.get("limit") {
            None | Some(Value::Null) => default_limit,
            Some(value) => value.as_u64().ok_or_else(|| {
                GuardrailConfigError::new("rate_limit", "limit must be a positive integer")
            })?,
        };
        let mut per_tool_limits = HashMap::new();
        if let Some(tools) = policy.config.get("per_tool_limits") {
            let tools = tools.as_object().ok_or_else(|| {
                GuardrailConfigError::new("rate_limit", "per_tool_limits must be a map")
            })?;
            for (tool, value) in tools {
                let tool_limit = value.as_u64().ok_or_else(|| {
                    GuardrailConfigError::new(
                        "rate_limit",
                        format!("per_tool_limits.{tool} must be a positive integer"),
                    )
                })?;
                per_tool_limits.insert(tool.clone(), tool_limit);
            }
        }
        Ok(Self {
            kind: policy.guardrail,
            limit,
            window_seconds,
            sliding: policy
                .config
                .get("sliding")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            per_tool_limits,
        })
    }

    pub fn evaluate(
        &self,
        body: &Value,
        ctx: &RequestContext,
        counters: &dyn RateCounterStore,
    ) -> EvaluationResult {
        let tool = jsonrpc::tool_name(body);
        let (limit, tool_scope) = match tool.as_deref().and_then(|name| {
            self.per_tool_limits
                .get(name)
                .map(|tool_limit| (*tool_limit, name))
        }) {
            Some((tool_limit, name)) => (tool_limit, Some(name)),
            None => (self.limit, None),
        };
        if limit == 0 {
            return EvaluationResult::allow();
        }

        let now = now_secs();
        let bucket = now / self.window_seconds;
        let key = self.counter_key(ctx, tool_scope, bucket);

        let count = match counters.increment(&key, self.window_seconds) {
            Ok(count) => count,
            Err(err) => return self.degraded(ctx, &err.to_string()),
        };

        let observed = if self.sliding {
            // Two-bucket blend: the previous bucket contributes its count
            // weighted by the unexpired fraction of the window.
            let previous = counters
                .current(&self.counter_key(ctx, tool_scope, bucket.saturating_sub(1)))
                .unwrap_or(0);
            let elapsed = now % self.window_seconds;
            let weight = (self.window_seconds - elapsed) as f64 / self.window_seconds as f64;
            count as f64 + previous as f64 * weight
        } else {
            count as f64
        };

        if observed > limit as f64 {
            let retry_after = self.window_seconds - (now % self.window_seconds);
            return EvaluationResult::throttle(
                retry_after,
                json!({
                    "limit": limit,
                    "current": count,
                    "window_seconds": self.window_seconds,
                    "retry_after_seconds": retry_after,
                    "tool": tool,
                }),
            );
        }

        EvaluationResult::allow_with(json!({
            "limit": limit,
            "current": count,
            "window_seconds": self.window_seconds,
        }))
    }

    fn counter_key(&self, ctx: &RequestContext, tool: Option<&str>, bucket: u64) -> String {
        match tool {
            Some(tool) => format!(
                "rl:{}:{}:{}:{}:{}",
                ctx.tenant_id,
                ctx.agent_id,
                self.kind.as_str(),
                tool,
                bucket
            ),
            None => format!(
                "rl:{}:{}:{}:{}",
                ctx.tenant_id,
                ctx.agent_id,
                self.kind.as_str(),
                bucket
            ),
        }
    }

    fn degraded(&self, ctx: &RequestContext, reason: &str) -> EvaluationResult {
        warn!(
            request_id = %ctx.request_id,
            fail_mode = ctx.fail_mode.as_str(),
            error = reason,
            "rate counter store unreachable"
        );
        match ctx.fail_mode {
            control_plane::FailMode::Closed => EvaluationResult::throttle(
                self.window_seconds,
                json!({ "degraded": true, "reason": reason }),
            ),
            control_plane::FailMode::Open => {
                EvaluationResult::allow_with(json!({ "degraded": true, "reason": reason }))
            }
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
