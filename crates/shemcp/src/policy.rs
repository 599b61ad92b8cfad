//! Regex command policy with matched-rule diagnostics.
//!
//! Patterns are compiled once at construction and evaluated against a
//! reconstructed command line (tokens joined by single spaces). Deny rules
//! win over allow rules; commands matching neither are denied.

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use thiserror::Error;

use crate::config::ShemcpConfig;

/// Whether a matched rule came from the allow or the deny list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Allow,
    Deny,
}

impl std::fmt::Display for RuleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleType::Allow => write!(f, "allow"),
            RuleType::Deny => write!(f, "deny"),
        }
    }
}

/// The outcome of a policy check.
///
/// `matched_rule` carries the source of the pattern that decided the outcome
/// so denials can be reported with the exact rule, without exposing the rest
/// of the policy.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyCheck {
    pub allowed: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_rule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_type: Option<RuleType>,
}

/// A policy pattern failed to compile.
#[derive(Debug, Error)]
#[error("invalid {rule_type} pattern `{pattern}`: {source}")]
pub struct PolicyError {
    pub rule_type: RuleType,
    pub pattern: String,
    #[source]
    pub source: regex::Error,
}

/// Immutable per-process command policy.
///
/// Holds the compiled allow/deny patterns plus the execution ceilings and the
/// child-environment allowlist. Constructed once at startup; requests only
/// read it.
#[derive(Debug)]
pub struct Policy {
    allow: Vec<Regex>,
    deny: Vec<Regex>,
    timeout_ms: u64,
    max_output_bytes: u64,
    env_allowlist: Vec<String>,
    worktree_detection: bool,
}

impl Policy {
    /// Compile a policy from configuration. Fails on the first invalid
    /// pattern; a partially-compiled policy is never used.
    pub fn from_config(config: &ShemcpConfig) -> Result<Self, PolicyError> {
        Ok(Self {
            allow: compile_all(&config.allow, RuleType::Allow)?,
            deny: compile_all(&config.deny, RuleType::Deny)?,
            timeout_ms: config.timeout_seconds.saturating_mul(1000),
            max_output_bytes: config.max_output_bytes,
            env_allowlist: config.env_allowlist.clone(),
            worktree_detection: config.worktree_detection,
        })
    }

    /// Evaluate a reconstructed command line. Deny rules are checked first,
    /// then allow rules in configured order; no match means deny.
    pub fn check_command(&self, command_line: &str) -> PolicyCheck {
        for rule in &self.deny {
            if rule.is_match(command_line) {
                return PolicyCheck {
                    allowed: false,
                    reason: "Command matches deny rule".to_string(),
                    matched_rule: Some(rule.as_str().to_string()),
                    rule_type: Some(RuleType::Deny),
                };
            }
        }
        for rule in &self.allow {
            if rule.is_match(command_line) {
                return PolicyCheck {
                    allowed: true,
                    reason: "Command matches allow rule".to_string(),
                    matched_rule: Some(rule.as_str().to_string()),
                    rule_type: Some(RuleType::Allow),
                };
            }
        }
        PolicyCheck {
            allowed: false,
            reason: "Command does not match any allow rule".to_string(),
            matched_rule: None,
            rule_type: None,
        }
    }

    /// Timeout ceiling in milliseconds.
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Per-stream output ceiling in bytes.
    pub fn max_output_bytes(&self) -> u64 {
        self.max_output_bytes
    }

    /// Names of environment variables forwarded to children.
    pub fn env_allowlist(&self) -> &[String] {
        &self.env_allowlist
    }

    /// Whether sibling git worktrees may extend the sandbox.
    pub fn worktree_detection(&self) -> bool {
        self.worktree_detection
    }

    /// Allow pattern sources, for `shell_info`.
    pub fn allow_sources(&self) -> Vec<String> {
        self.allow.iter().map(|r| r.as_str().to_string()).collect()
    }

    /// Deny pattern sources, for `shell_info`.
    pub fn deny_sources(&self) -> Vec<String> {
        self.deny.iter().map(|r| r.as_str().to_string()).collect()
    }
}

fn compile_all(patterns: &[String], rule_type: RuleType) -> Result<Vec<Regex>, PolicyError> {
    patterns
        .iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|source| PolicyError {
                    rule_type,
                    pattern: pattern.clone(),
                    source,
                })
        })
        .collect()
}
