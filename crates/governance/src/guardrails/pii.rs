use std::sync::OnceLock;

use control_plane::{EffectivePolicy, GuardrailKind, PolicyAction};
use regex::Regex;
use serde_json::{json, Value};

use crate::body;
use crate::guardrails::{scan_direction, EvaluationResult, GuardrailConfigError, ScanDirection};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PiiAction {
    Block,
    Redact,
    LogOnly,
}

/// One PII detector with its configured action. Detection runs over every
/// string leaf reachable in the JSON body.
pub struct PiiConfig {
    pub kind: GuardrailKind,
    pub direction: ScanDirection,
    action: PiiAction,
    redaction_token: String,
}

impl PiiConfig {
    pub fn from_policy(policy: &EffectivePolicy) -> Result<Self, GuardrailConfigError> {
        let action = match policy.action {
            PolicyAction::Block => PiiAction::Block,
            PolicyAction::Redact => PiiAction::Redact,
            PolicyAction::Allow | PolicyAction::LogOnly => PiiAction::LogOnly,
            PolicyAction::Throttle => {
                return Err(GuardrailConfigError::new(
                    "pii",
                    "throttle is not a valid PII action",
                ))
            }
        };
        let redaction_token = policy
            .config
            .get("redaction_token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| default_redaction_token(policy.guardrail));
        Ok(Self {
            kind: policy.guardrail,
            direction: scan_direction(&policy.config),
            action,
            redaction_token,
        })
    }

    pub fn evaluate(&self, current: &Value) -> EvaluationResult {
        let mut findings: Vec<String> = Vec::new();
        body::for_each_string_leaf(current, &mut |text| {
            for found in find_matches(self.kind, text) {
                if !findings.contains(&found) {
                    findings.push(found);
                }
            }
        });

        if findings.is_empty() {
            return EvaluationResult::allow();
        }

        let pii_type = self.kind.as_str();
        match self.action {
            PiiAction::Block => EvaluationResult::block(json!({
                "pii_type": pii_type,
                "total_findings": findings.len(),
            })),
            PiiAction::LogOnly => EvaluationResult::log_only(json!({
                "pii_type": pii_type,
                "total_findings": findings.len(),
            })),
            PiiAction::Redact => {
                let replacements: Vec<(String, String)> = findings
                    .iter()
                    .map(|found| (found.clone(), self.redaction_token.clone()))
                    .collect();
                let mut redacted = current.clone();
                body::replace_in_string_leaves(&mut redacted, &replacements);
                EvaluationResult::redact(
                    redacted,
                    json!({
                        "pii_type": pii_type,
                        "redaction_count": findings.len(),
                    }),
                )
            }
        }
    }
}

fn default_redaction_token(kind: GuardrailKind) -> String {
    let label = match kind {
        GuardrailKind::PiiSsn => "SSN",
        GuardrailKind::PiiCreditCard => "CREDIT_CARD",
        GuardrailKind::PiiEmail => "EMAIL",
        GuardrailKind::PiiPhone => "PHONE",
        GuardrailKind::PiiIpAddress => "IP",
        _ => "PII",
    };
    format!("[REDACTED:{label}]")
}

fn find_matches(kind: GuardrailKind, text: &str) -> Vec<String> {
    let (regex, validator): (&Regex, fn(&str) -> bool) = match kind {
        GuardrailKind::PiiSsn => (ssn_regex(), valid_ssn),
        GuardrailKind::PiiCreditCard => (credit_card_regex(), valid_credit_card),
        GuardrailKind::PiiEmail => (email_regex(), valid_email),
        GuardrailKind::PiiPhone => (phone_regex(), valid_phone),
        GuardrailKind::PiiIpAddress => (ipv4_regex(), valid_ipv4),
        _ => return Vec::new(),
    };
    regex
        .find_iter(text)
        .map(|found| found.as_str().to_string())
        .filter(|candidate| validator(candidate))
        .collect()
}

fn ssn_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d{3}[- ]?\d{2}[- ]?\d{4}\b").expect("ssn pattern"))
}

fn credit_card_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d(?:[- ]?\d){12,18}\b").expect("credit card pattern"))
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email pattern")
    })
}

fn phone_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\+?\d{0,3}[-. ]?\(?\d{3}\)?[-. ]?\d{3}[-. ]?\d{4}").expect("phone pattern")
    })
}

fn ipv4_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").expect("ipv4 pattern")
    })
}

fn digits_of(value: &str) -> String {
    value.chars().filter(char::is_ascii_digit).collect()
}

/// Area 001-899 excluding 666, group 01-99, serial 0001-9999.
fn valid_ssn(value: &str) -> bool {
    let digits = digits_of(value);
    if digits.len() != 9 {
        return false;
    }
    let area: u32 = digits[0..3].parse().unwrap_or(0);
    let group: u32 = digits[3..5].parse().unwrap_or(0);
    let serial: u32 = digits[5..9].parse().unwrap_or(0);
    (1..=899).contains(&area) && area != 666 && group >= 1 && serial >= 1
}

fn valid_credit_card(value: &str) -> bool {
    let digits = digits_of(value);
    if digits.len() < 13 || digits.len() > 19 {
        return false;
    }
    luhn(&digits)
}

fn luhn(digits: &str) -> bool {
    let mut total = 0u32;
    for (index, ch) in digits.chars().rev().enumerate() {
        let mut digit = ch.to_digit(10).unwrap_or(0);
        if index % 2 == 1 {
            digit *= 2;
            if digit > 9 {
                digit -= 9;
            }
        }
        total += digit;
    }
    total % 10 == 0
}

fn valid_email(value: &str) -> bool {
    let Some((_, domain)) = value.rsplit_once('@') else {
        return false;
    };
    domain.contains('.')
}

fn valid_phone(value: &str) -> bool {
    let count = digits_of(value).len();
    (10..=15).contains(&count)
}

fn valid_ipv4(value: &str) -> bool {
    let mut octets = 0;
    for part in value.split('.') {
        match part.parse::<u32>() {
            Ok(octet) if octet <= 255 => octets += 1,
            _ => return false,
        }
    }
    octets == 4
}
