//! Declarative status/message → directive table

use crate::Directive;

/// Condition on the decoded upstream error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageMatch {
    /// Matches regardless of message, including when none was decoded.
    Any,
    /// Matches when the message contains any of the substrings
    /// (case-sensitive). Never matches a missing message.
    Contains(&'static [&'static str]),
}

impl MessageMatch {
    fn matches(&self, message: Option<&str>) -> bool {
        match self {
            MessageMatch::Any => true,
            MessageMatch::Contains(needles) => {
                message.is_some_and(|m| needles.iter().any(|needle| m.contains(needle)))
            }
        }
    }
}

/// One row of the policy table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub status: u16,
    pub message: MessageMatch,
    pub directive: Directive,
    /// Short human reason used in logs.
    pub reason: &'static str,
}

/// Ordered rule table. First match wins; no match means `Abort`.
#[derive(Debug, Clone)]
pub struct Policy {
    rules: Vec<Rule>,
}

const SUSPENDED: &[&str] = &["has been suspended"];
const OVERLOADED: &[&str] = &["overloaded"];
const UNSUPPORTED_LOCATION: &[&str] = &["location is not supported"];
const BAD_KEY: &[&str] = &["API key expired", "API key not valid", "API Key not found"];

impl Default for Policy {
    fn default() -> Self {
        Self {
            rules: vec![
                Rule {
                    status: 429,
                    message: MessageMatch::Any,
                    directive: Directive::RotateAndRetry,
                    reason: "rate limited",
                },
                Rule {
                    status: 403,
                    message: MessageMatch::Contains(SUSPENDED),
                    directive: Directive::QuarantineAndRetry,
                    reason: "key suspended",
                },
                Rule {
                    status: 403,
                    message: MessageMatch::Any,
                    directive: Directive::Abort,
                    reason: "forbidden",
                },
                Rule {
                    status: 503,
                    message: MessageMatch::Contains(OVERLOADED),
                    directive: Directive::Retry,
                    reason: "model overloaded",
                },
                Rule {
                    status: 400,
                    message: MessageMatch::Contains(UNSUPPORTED_LOCATION),
                    directive: Directive::Abort,
                    reason: "user location is not supported",
                },
                Rule {
                    status: 400,
                    message: MessageMatch::Contains(BAD_KEY),
                    directive: Directive::QuarantineAndRetry,
                    reason: "key expired / invalid / not found",
                },
                Rule {
                    status: 400,
                    message: MessageMatch::Any,
                    directive: Directive::Abort,
                    reason: "bad request",
                },
            ],
        }
    }
}

impl Policy {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Replace the directive of the 503 "overloaded" row.
    pub fn with_overloaded(mut self, directive: Directive) -> Self {
        for rule in &mut self.rules {
            if rule.status == 503 && rule.message == MessageMatch::Contains(OVERLOADED) {
                rule.directive = directive;
            }
        }
        self
    }

    /// First rule matching `status` and `message`, if any.
    pub fn rule_for(&self, status: u16, message: Option<&str>) -> Option<&Rule> {
        self.rules
            .iter()
            .find(|rule| rule.status == status && rule.message.matches(message))
    }

    /// Directive for a failed upstream response.
    pub fn classify(&self, status: u16, message: Option<&str>) -> Directive {
        self.rule_for(status, message)
            .map_or(Directive::Abort, |rule| rule.directive)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }
}
