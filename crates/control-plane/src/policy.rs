use std::collections::hash_map::Entry;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Request => "request",
            Direction::Response => "response",
        }
    }
}

/// Workspace behavior when governance infrastructure is degraded.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailMode {
    Open,
    Closed,
}

impl FailMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailMode::Open => "open",
            FailMode::Closed => "closed",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailKind {
    Rbac,
    RateLimitPerMinute,
    RateLimitPerHour,
    PiiSsn,
    PiiCreditCard,
    PiiEmail,
    PiiPhone,
    PiiIpAddress,
    ContentLargeDocuments,
    ContentStructuredData,
    ContentSourceCode,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailCategory {
    Rbac,
    RateLimit,
    Pii,
    Content,
}

impl GuardrailKind {
    pub const ALL: [GuardrailKind; 11] = [
        GuardrailKind::Rbac,
        GuardrailKind::RateLimitPerMinute,
        GuardrailKind::RateLimitPerHour,
        GuardrailKind::PiiSsn,
        GuardrailKind::PiiCreditCard,
        GuardrailKind::PiiEmail,
        GuardrailKind::PiiPhone,
        GuardrailKind::PiiIpAddress,
        GuardrailKind::ContentLargeDocuments,
        GuardrailKind::ContentStructuredData,
        GuardrailKind::ContentSourceCode,
    ];

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rbac" => Some(Self::Rbac),
            "rate_limit_per_minute" => Some(Self::RateLimitPerMinute),
            "rate_limit_per_hour" => Some(Self::RateLimitPerHour),
            "pii_ssn" => Some(Self::PiiSsn),
            "pii_credit_card" => Some(Self::PiiCreditCard),
            "pii_email" => Some(Self::PiiEmail),
            "pii_phone" => Some(Self::PiiPhone),
            "pii_ip_address" => Some(Self::PiiIpAddress),
            "content_large_documents" => Some(Self::ContentLargeDocuments),
            "content_structured_data" => Some(Self::ContentStructuredData),
            "content_source_code" => Some(Self::ContentSourceCode),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rbac => "rbac",
            Self::RateLimitPerMinute => "rate_limit_per_minute",
            Self::RateLimitPerHour => "rate_limit_per_hour",
            Self::PiiSsn => "pii_ssn",
            Self::PiiCreditCard => "pii_credit_card",
            Self::PiiEmail => "pii_email",
            Self::PiiPhone => "pii_phone",
            Self::PiiIpAddress => "pii_ip_address",
            Self::ContentLargeDocuments => "content_large_documents",
            Self::ContentStructuredData => "content_structured_data",
            Self::ContentSourceCode => "content_source_code",
        }
    }

    pub fn category(&self) -> GuardrailCategory {
        match self {
            Self::Rbac => GuardrailCategory::Rbac,
            Self::RateLimitPerMinute | Self::RateLimitPerHour => GuardrailCategory::RateLimit,
            Self::PiiSsn
            | Self::PiiCreditCard
            | Self::PiiEmail
            | Self::PiiPhone
            | Self::PiiIpAddress => GuardrailCategory::Pii,
            Self::ContentLargeDocuments
            | Self::ContentStructuredData
            | Self::ContentSourceCode => GuardrailCategory::Content,
        }
    }

    /// Structural applicability. PII and content kinds may be narrowed
    /// further by per-policy direction config.
    pub fn applies_to(&self, direction: Direction) -> bool {
        match self.category() {
            GuardrailCategory::Rbac | GuardrailCategory::RateLimit => {
                direction == Direction::Request
            }
            GuardrailCategory::Pii | GuardrailCategory::Content => true,
        }
    }

    /// Position in the canonical pipeline order: cheap structural checks
    /// first, content scanning last.
    pub fn canonical_rank(&self) -> usize {
        match self {
            Self::Rbac => 0,
            Self::RateLimitPerMinute => 1,
            Self::RateLimitPerHour => 2,
            Self::PiiSsn => 3,
            Self::PiiCreditCard => 4,
            Self::PiiEmail => 5,
            Self::PiiPhone => 6,
            Self::PiiIpAddress => 7,
            Self::ContentLargeDocuments => 8,
            Self::ContentStructuredData => 9,
            Self::ContentSourceCode => 10,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Allow,
    Block,
    Redact,
    Throttle,
    LogOnly,
}

impl PolicyAction {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "allow" => Some(Self::Allow),
            "block" => Some(Self::Block),
            "redact" => Some(Self::Redact),
            "throttle" => Some(Self::Throttle),
            "log_only" => Some(Self::LogOnly),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Block => "block",
            Self::Redact => "redact",
            Self::Throttle => "throttle",
            Self::LogOnly => "log_only",
        }
    }
}

/// One row of the policies table. Scope is encoded by which of
/// `workspace_id` and `agent_id` are set: both null is tenant scope,
/// workspace set is workspace scope, both set is agent scope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub id: String,
    pub tenant_id: String,
    pub workspace_id: Option<String>,
    pub agent_id: Option<String>,
    pub guardrail: GuardrailKind,
    pub action: PolicyAction,
    pub config: Value,
    pub priority: i32,
    pub enabled: bool,
}

impl PolicyRecord {
    pub fn scope_rank(&self) -> u8 {
        if self.agent_id.is_some() {
            2
        } else if self.workspace_id.is_some() {
            1
        } else {
            0
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EffectivePolicy {
    pub guardrail: GuardrailKind,
    pub action: PolicyAction,
    pub config: Value,
}

/// The precedence-resolved policies applicable to one request, ordered
/// canonically for pipeline evaluation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EffectivePolicySet {
    pub entries: Vec<EffectivePolicy>,
}

impl EffectivePolicySet {
    /// Group-by-winner reduction over a flat query result: within each
    /// guardrail kind the most specific scope wins, priority breaks ties.
    pub fn resolve(policies: &[PolicyRecord]) -> Self {
        let mut winners: HashMap<GuardrailKind, &PolicyRecord> = HashMap::new();
        for policy in policies.iter().filter(|policy| policy.enabled) {
            match winners.entry(policy.guardrail) {
                Entry::Vacant(entry) => {
                    entry.insert(policy);
                }
                Entry::Occupied(mut entry) => {
                    let current = entry.get();
                    if (policy.scope_rank(), policy.priority)
                        > (current.scope_rank(), current.priority)
                    {
                        entry.insert(policy);
                    }
                }
            }
        }

        let mut entries: Vec<EffectivePolicy> = winners
            .into_values()
            .map(|policy| EffectivePolicy {
                guardrail: policy.guardrail,
                action: policy.action,
                config: policy.config.clone(),
            })
            .collect();
        entries.sort_by_key(|entry| entry.guardrail.canonical_rank());
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn policy_cache_key(tenant_id: &str, workspace_id: &str, agent_id: &str) -> String {
    format!("policy:{tenant_id}:{workspace_id}:{agent_id}")
}

#[derive(Debug, Error)]
pub enum PolicyLoadError {
    #[error("policy store error: {0}")]
    Store(String),
}

/// Resolves the effective policy set for a request context. The data path
/// holds this behind an `Arc` and never reaches into the repository
/// directly.
pub trait PolicyProvider: Send + Sync {
    fn effective_policies(
        &self,
        ctx: &crate::auth::RequestContext,
    ) -> Result<EffectivePolicySet, PolicyLoadError>;
}
