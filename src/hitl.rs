//! Human-in-the-loop escalation policy.
//!
//! A pure decision over failure signals: the first matching rule wins, in
//! the order missing secret, destructive change, repeated test failures,
//! ambiguous scope.

use std::fmt;

use baton_common::RiskSignals;
use serde::{Deserialize, Serialize};

pub const DEFAULT_FAILED_ATTEMPT_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HitlReason {
    MissingSecret,
    DestructiveChange,
    RepeatedTestFailures,
    AmbiguousSpec,
}

impl HitlReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingSecret => "missing-secret",
            Self::DestructiveChange => "destructive-change",
            Self::RepeatedTestFailures => "repeated-test-failures",
            Self::AmbiguousSpec => "ambiguous-spec",
        }
    }

    /// What the human is asked to provide.
    pub fn requested_input(&self) -> &'static str {
        match self {
            Self::MissingSecret => "Provide the required secret or credential.",
            Self::DestructiveChange => "Confirm the change is approved or adjust the plan.",
            Self::RepeatedTestFailures => {
                "Share context on whether to retry tests or adjust the change."
            }
            Self::AmbiguousSpec => "Clarify scope or acceptance criteria before continuing.",
        }
    }
}

impl fmt::Display for HitlReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HitlSignals {
    pub missing_secret: bool,
    pub destructive_change: bool,
    pub failed_test_attempts: u32,
    pub ambiguous_spec: bool,
}

impl HitlSignals {
    pub fn with_failed_attempts(mut self, attempts: u32) -> Self {
        self.failed_test_attempts = attempts;
        self
    }
}

impl From<RiskSignals> for HitlSignals {
    fn from(signals: RiskSignals) -> Self {
        Self {
            missing_secret: signals.missing_secret,
            destructive_change: signals.destructive_change,
            failed_test_attempts: 0,
            ambiguous_spec: signals.ambiguous_spec,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitlDecision {
    pub escalate: bool,
    pub reason: Option<HitlReason>,
    pub requested_input: Option<String>,
}

impl HitlDecision {
    pub fn proceed() -> Self {
        Self {
            escalate: false,
            reason: None,
            requested_input: None,
        }
    }

    fn escalate(reason: HitlReason) -> Self {
        Self {
            escalate: true,
            reason: Some(reason),
            requested_input: Some(reason.requested_input().to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitlPolicy {
    failed_attempt_threshold: u32,
}

impl Default for HitlPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_FAILED_ATTEMPT_THRESHOLD)
    }
}

impl HitlPolicy {
    pub fn new(failed_attempt_threshold: u32) -> Self {
        Self {
            failed_attempt_threshold,
        }
    }

    pub fn failed_attempt_threshold(&self) -> u32 {
        self.failed_attempt_threshold
    }

    pub fn evaluate(&self, signals: &HitlSignals) -> HitlDecision {
        if signals.missing_secret {
            return HitlDecision::escalate(HitlReason::MissingSecret);
        }
        if signals.destructive_change {
            return HitlDecision::escalate(HitlReason::DestructiveChange);
        }
        if signals.failed_test_attempts >= self.failed_attempt_threshold {
            return HitlDecision::escalate(HitlReason::RepeatedTestFailures);
        }
        if signals.ambiguous_spec {
            return HitlDecision::escalate(HitlReason::AmbiguousSpec);
        }
        HitlDecision::proceed()
    }
}
