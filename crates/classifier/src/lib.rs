//! Upstream failure classification for the Gemini gateway
//!
//! Maps a failed upstream response (status plus, for structured bodies, the
//! decoded `error.message`) to the recovery `Directive` the retry engine
//! applies. The mapping is a declarative table in `rules`; the engine stays
//! generic and never inspects statuses or messages itself.

pub mod message;
pub mod rules;

pub use message::extract_message;
pub use rules::{MessageMatch, Policy, Rule};

/// What the retry engine should do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Directive {
    /// Try again with the same key.
    Retry,
    /// Acquire a different key and try again.
    RotateAndRetry,
    /// Take the key out of the pool, acquire another, and try again.
    QuarantineAndRetry,
    /// Return the upstream response to the caller as is.
    Abort,
}

impl Directive {
    /// Label for logs and the `error_type` metric.
    pub fn label(&self) -> &'static str {
        match self {
            Directive::Retry => "retry",
            Directive::RotateAndRetry => "rotate_and_retry",
            Directive::QuarantineAndRetry => "quarantine_and_retry",
            Directive::Abort => "abort",
        }
    }

    /// Whether the engine should make another attempt.
    pub fn retries(&self) -> bool {
        !matches!(self, Directive::Abort)
    }
}
