//! Tool Gate
//!
//! Default-deny policy check in front of every tool dispatch. A tool runs only
//! if the [`PolicyStore`] lists it AND its name does not look like an
//! arbitrary-execution primitive. The forbidden class wins over the allowlist.

use crate::error::OrchestrationError;
use crate::Result;
use regex::RegexSet;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

/// Name patterns that are denied regardless of allowlist contents.
const FORBIDDEN_PATTERNS: &[(&str, &str)] = &[
    (r"(?i)(^|_)exec(ute)?(_|$)", "generic execution primitive"),
    (r"(?i)(^|_)eval(_|$)", "code evaluation"),
    (r"(?i)(^|_)(shell|bash|sh|cmd|powershell)(_|$)", "shell access"),
    (r"(?i)(^|_)run_?(code|script|command)(_|$)", "arbitrary code execution"),
    (r"(?i)(^|_)(python|node|javascript)(_|$)", "interpreter access"),
    (r"(?i)(^|_)(system|spawn_process|subprocess)(_|$)", "process spawning"),
];

/// Capability: is a tool name on the allow-set?
pub trait PolicyStore: Send + Sync {
    fn is_allowed(&self, tool_name: &str) -> bool;
}

/// Fixed allowlist of tool names.
#[derive(Debug, Clone, Default)]
pub struct AllowlistPolicy {
    allowed: HashSet<String>,
}

impl AllowlistPolicy {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl PolicyStore for AllowlistPolicy {
    fn is_allowed(&self, tool_name: &str) -> bool {
        self.allowed.contains(tool_name)
    }
}

pub struct ToolGate {
    policy: Arc<dyn PolicyStore>,
    forbidden: RegexSet,
    forbidden_reasons: Vec<&'static str>,
}

impl ToolGate {
    pub fn new(policy: Arc<dyn PolicyStore>) -> Self {
        let (patterns, reasons): (Vec<_>, Vec<_>) = FORBIDDEN_PATTERNS.iter().copied().unzip();
        let forbidden = RegexSet::new(patterns)
            .unwrap_or_else(|e| panic!("invalid forbidden tool pattern: {}", e));

        Self {
            policy,
            forbidden,
            forbidden_reasons: reasons,
        }
    }

    pub fn with_allowlist<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Arc::new(AllowlistPolicy::new(names)))
    }

    /// Pure predicate form.
    pub fn is_permitted(&self, tool_name: &str) -> bool {
        self.forbidden_reason(tool_name).is_none() && self.policy.is_allowed(tool_name)
    }

    /// Validating form, called before every dispatch. Denial has no side effects.
    pub fn validate(&self, tool_name: &str, args: &Value) -> Result<()> {
        if let Some(reason) = self.forbidden_reason(tool_name) {
            warn!(tool_name, reason, "Tool denied: forbidden class");
            return Err(OrchestrationError::PolicyViolation(format!(
                "{} is a {} and is never allowed",
                tool_name, reason
            )));
        }

        if !self.policy.is_allowed(tool_name) {
            warn!(tool_name, "Tool denied: not on allowlist");
            return Err(OrchestrationError::PolicyViolation(format!(
                "{} is not on the tool allowlist",
                tool_name
            )));
        }

        if !args.is_object() {
            return Err(OrchestrationError::PolicyViolation(format!(
                "{} arguments must be a JSON object",
                tool_name
            )));
        }

        Ok(())
    }

    fn forbidden_reason(&self, tool_name: &str) -> Option<&'static str> {
        self.forbidden
            .matches(tool_name)
            .into_iter()
            .next()
            .map(|index| self.forbidden_reasons[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_deny() {
        let gate = ToolGate::with_allowlist(["x402_payment"]);
        assert!(gate.is_permitted("x402_payment"));
        assert!(!gate.is_permitted("token_swap"));
        assert!(gate.validate("token_swap", &json!({})).is_err());
    }

    #[test]
    fn test_forbidden_class_overrides_allowlist() {
        let gate = ToolGate::with_allowlist(["execute_code", "run_shell", "eval", "python_repl"]);
        for name in ["execute_code", "run_shell", "eval", "python_repl"] {
            assert!(!gate.is_permitted(name), "{} should be denied", name);
            let err = gate.validate(name, &json!({})).unwrap_err();
            assert!(matches!(err, OrchestrationError::PolicyViolation(_)));
        }
    }

    #[test]
    fn test_similar_names_not_caught_by_forbidden_class() {
        let gate = ToolGate::with_allowlist(["check_balance", "discover_services"]);
        assert!(gate.is_permitted("check_balance"));
        assert!(gate.is_permitted("discover_services"));
    }

    #[test]
    fn test_arguments_must_be_object() {
        let gate = ToolGate::with_allowlist(["x402_payment"]);
        assert!(gate.validate("x402_payment", &json!({"amount": 1.0})).is_ok());
        assert!(gate.validate("x402_payment", &json!([1, 2])).is_err());
    }
}
