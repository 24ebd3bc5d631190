use control_plane::{
    Direction, EffectivePolicySet, FailMode, GuardrailEvent, RateCounterStore, RequestContext,
};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::guardrails::{EvalAction, Evaluator};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FinalAction {
    Allow,
    Modify,
    Block,
    Throttle,
}

impl FinalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalAction::Allow => "allow",
            FinalAction::Modify => "modify",
            FinalAction::Block => "block",
            FinalAction::Throttle => "throttle",
        }
    }
}

#[derive(Debug)]
pub struct PipelineOutcome {
    pub final_action: FinalAction,
    pub triggered: Vec<String>,
    pub transformed_body: Option<Value>,
    pub retry_after_seconds: Option<u64>,
    pub blocked_by: Option<String>,
    pub events: Vec<GuardrailEvent>,
}

impl PipelineOutcome {
    fn terminal(
        final_action: FinalAction,
        blocked_by: String,
        retry_after_seconds: Option<u64>,
        events: Vec<GuardrailEvent>,
    ) -> Self {
        Self {
            final_action,
            triggered: triggered_of(&events),
            transformed_body: None,
            retry_after_seconds,
            blocked_by: Some(blocked_by),
            events,
        }
    }
}

/// Run the effective set over one direction in canonical order. A block or
/// throttle terminates immediately; redactions replace the working body
/// and compose; allow and log-only continue.
pub fn run_pipeline(
    direction: Direction,
    body: &Value,
    ctx: &RequestContext,
    set: &EffectivePolicySet,
    counters: &dyn RateCounterStore,
) -> PipelineOutcome {
    let mut events: Vec<GuardrailEvent> = Vec::new();
    let mut working: Option<Value> = None;

    for policy in &set.entries {
        let evaluator = match Evaluator::from_policy(policy) {
            Ok(evaluator) => evaluator,
            Err(err) => {
                warn!(
                    request_id = %ctx.request_id,
                    guardrail = policy.guardrail.as_str(),
                    error = %err,
                    "guardrail config rejected"
                );
                events.push(GuardrailEvent {
                    guardrail_type: policy.guardrail.as_str().to_string(),
                    triggered: true,
                    action: "error".to_string(),
                    details: json!({ "error": err.to_string() }),
                });
                if ctx.fail_mode == FailMode::Closed {
                    return PipelineOutcome::terminal(
                        FinalAction::Block,
                        policy.guardrail.as_str().to_string(),
                        None,
                        events,
                    );
                }
                continue;
            }
        };

        if !evaluator.applies_to(direction) {
            continue;
        }

        let kind = evaluator.kind().as_str();
        let current = working.as_ref().unwrap_or(body);
        let result = evaluator.evaluate(current, ctx, counters);
        debug!(
            request_id = %ctx.request_id,
            direction = direction.as_str(),
            guardrail = kind,
            action = result.action.label(),
            triggered = result.triggered,
            "guardrail evaluated"
        );
        events.push(GuardrailEvent {
            guardrail_type: kind.to_string(),
            triggered: result.triggered,
            action: result.action.label().to_string(),
            details: result.details,
        });

        match result.action {
            EvalAction::Block => {
                return PipelineOutcome::terminal(
                    FinalAction::Block,
                    kind.to_string(),
                    None,
                    events,
                );
            }
            EvalAction::Throttle(retry_after) => {
                return PipelineOutcome::terminal(
                    FinalAction::Throttle,
                    kind.to_string(),
                    Some(retry_after),
                    events,
                );
            }
            EvalAction::RedactWith(redacted) => {
                working = Some(redacted);
            }
            EvalAction::Allow | EvalAction::LogOnly => {}
        }
    }

    let final_action = if working.is_some() {
        FinalAction::Modify
    } else {
        FinalAction::Allow
    };
    PipelineOutcome {
        final_action,
        triggered: triggered_of(&events),
        transformed_body: working,
        retry_after_seconds: None,
        blocked_by: None,
        events,
    }
}

fn triggered_of(events: &[GuardrailEvent]) -> Vec<String> {
    events
        .iter()
        .filter(|event| event.triggered)
        .map(|event| event.guardrail_type.clone())
        .collect()
}
