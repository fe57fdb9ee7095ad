//! Verdict shapes returned by the moderation service.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ModerationError;

/// Decision carried by a verdict.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    #[default]
    Allow,
    Block,
    /// Any other action label. Never blocks.
    Other(String),
}

impl Action {
    pub fn is_block(&self) -> bool {
        matches!(self, Action::Block)
    }
}

impl From<String> for Action {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "allow" => Action::Allow,
            "block" => Action::Block,
            _ => Action::Other(value),
        }
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        match action {
            Action::Allow => "allow".to_string(),
            Action::Block => "block".to_string(),
            Action::Other(label) => label,
        }
    }
}

/// A single per-turn verdict as sent on the wire.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawVerdict {
    #[serde(default)]
    pub action: Action,
    #[serde(default)]
    pub categories: BTreeMap<String, Value>,
    #[serde(default)]
    pub raw_findings: Vec<Value>,
    #[serde(default)]
    pub anonymized_text: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// The service answers with either one verdict or one verdict per turn.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ScanResponse {
    Many(Vec<RawVerdict>),
    Single(RawVerdict),
}

impl ScanResponse {
    /// Pick the effective verdict: the first blocking verdict if any,
    /// otherwise the first verdict.
    pub fn into_verdict(self) -> Result<GuardrailVerdict, ModerationError> {
        let raw = match self {
            ScanResponse::Single(raw) => raw,
            ScanResponse::Many(verdicts) => {
                let position = verdicts.iter().position(|v| v.action.is_block()).unwrap_or(0);
                verdicts
                    .into_iter()
                    .nth(position)
                    .ok_or_else(|| ModerationError::Decode("empty verdict list".to_string()))?
            }
        };
        Ok(GuardrailVerdict::from(raw))
    }
}

/// Normalized moderation verdict.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GuardrailVerdict {
    pub action: Action,
    pub categories: BTreeMap<String, Value>,
    pub findings: Vec<Value>,
    pub anonymized_text: String,
    pub session_id: String,
}

impl GuardrailVerdict {
    pub fn allow() -> Self {
        Self::default()
    }

    pub fn block() -> Self {
        Self {
            action: Action::Block,
            ..Self::default()
        }
    }

    pub fn is_block(&self) -> bool {
        self.action.is_block()
    }

    /// Category names flagged by the service (`true` or a non-zero score).
    pub fn flagged_categories(&self) -> Vec<&str> {
        self.categories
            .iter()
            .filter(|(_, value)| match value {
                Value::Bool(flag) => *flag,
                Value::Number(n) => n.as_f64().is_some_and(|score| score > 0.0),
                Value::Null => false,
                _ => true,
            })
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

impl From<RawVerdict> for GuardrailVerdict {
    fn from(raw: RawVerdict) -> Self {
        GuardrailVerdict {
            action: raw.action,
            categories: raw.categories,
            findings: raw.raw_findings,
            anonymized_text: raw.anonymized_text.unwrap_or_default(),
            session_id: raw.session_id.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(value: Value) -> GuardrailVerdict {
        serde_json::from_value::<ScanResponse>(value)
            .unwrap()
            .into_verdict()
            .unwrap()
    }

    #[test]
    fn test_single_object() {
        let verdict = decode(json!({
            "action": "block",
            "categories": { "prompt_injection": true },
            "raw_findings": [{ "type": "jailbreak" }],
            "anonymized_text": "***",
            "session_id": "s-1"
        }));
        assert!(verdict.is_block());
        assert_eq!(verdict.flagged_categories(), vec!["prompt_injection"]);
        assert_eq!(verdict.findings.len(), 1);
        assert_eq!(verdict.session_id, "s-1");
    }

    #[test]
    fn test_block_anywhere_in_list_wins() {
        let verdict = decode(json!([
            { "action": "allow", "session_id": "first" },
            { "action": "block", "session_id": "second", "categories": { "secrets": true } },
            { "action": "allow", "session_id": "third" }
        ]));
        assert!(verdict.is_block());
        assert_eq!(verdict.session_id, "second");
    }

    #[test]
    fn test_first_verdict_when_nothing_blocks() {
        let verdict = decode(json!([
            { "action": "allow", "session_id": "first" },
            { "action": "mask", "session_id": "second" }
        ]));
        assert!(!verdict.is_block());
        assert_eq!(verdict.session_id, "first");
    }

    #[test]
    fn test_missing_fields_default_to_allow() {
        let verdict = decode(json!({}));
        assert_eq!(verdict.action, Action::Allow);
        assert!(verdict.categories.is_empty());
        assert_eq!(verdict.anonymized_text, "");
    }

    #[test]
    fn test_unknown_action_is_kept_but_does_not_block() {
        let verdict = decode(json!({ "action": "flag" }));
        assert_eq!(verdict.action, Action::Other("flag".to_string()));
        assert!(!verdict.is_block());
    }

    #[test]
    fn test_empty_list_is_a_decode_error() {
        let response: ScanResponse = serde_json::from_value(json!([])).unwrap();
        assert!(matches!(response.into_verdict(), Err(ModerationError::Decode(_))));
    }

    #[test]
    fn test_flagged_categories_ignore_false_and_zero() {
        let verdict = decode(json!({
            "categories": { "pii": false, "toxicity": 0.0, "secrets": 0.93, "other": null }
        }));
        assert_eq!(verdict.flagged_categories(), vec!["secrets"]);
    }
}
