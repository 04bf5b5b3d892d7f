//! Error taxonomy for the chronicler core.
//!
//! Most recoverable conditions self-heal (clamping, coercion, ghost purges)
//! and only log. The variants here are the ones callers need to match on to
//! decide surfacing policy: abort the cycle, show a toast, or skip silently.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChroniclerError {
    /// HTTP-level failure from a model backend. The task aborts; nothing was
    /// persisted because persistence only happens after a successful response.
    #[error("model backend error: {0}")]
    TransientApi(String),

    /// The model returned something that could not be parsed even after the
    /// raw-text fallback.
    #[error("model output could not be parsed: {raw}")]
    MalformedModelOutput { raw: String },

    /// Every slice of a summarization batch came back empty.
    #[error("summarization produced no usable slices; raw output: {raw}")]
    EmptyBatch { raw: String },

    /// One or more repair rules found unrecoverable violations (enum value
    /// outside the allowed set, non-numeric string for a number field).
    /// `details` lists each offending path and value.
    #[error("status delta rejected: {details}")]
    SchemaViolation { details: String },

    /// A status snapshot was found on a message role that must not carry one.
    /// Always self-healed; this variant exists for logging, never for
    /// surfacing to the user.
    #[error("stale status data on message {message_id}")]
    StaleDataDetected { message_id: i64 },

    /// The active chat changed between capture and persistence.
    #[error("chat session changed mid-operation (was {expected}, now {actual})")]
    ConcurrentSessionSwitch { expected: String, actual: String },

    /// A manual summarization request collides with an already-persisted
    /// batch and overwrite was not confirmed.
    #[error("batch {batch_id} conflicts with existing summaries over messages {start}..={end}")]
    BatchConflict { batch_id: u64, start: i64, end: i64 },
}

impl ChroniclerError {
    /// Whether this error should produce a user-visible toast, as opposed to
    /// a log line only.
    pub fn is_user_visible(&self) -> bool {
        match self {
            ChroniclerError::TransientApi(_)
            | ChroniclerError::MalformedModelOutput { .. }
            | ChroniclerError::EmptyBatch { .. }
            | ChroniclerError::BatchConflict { .. } => true,
            ChroniclerError::SchemaViolation { .. }
            | ChroniclerError::StaleDataDetected { .. }
            | ChroniclerError::ConcurrentSessionSwitch { .. } => false,
        }
    }
}

/// Truncate a diagnostic snippet to at most `max_chars` characters, appending
/// an ellipsis when anything was cut.
pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    let mut out = String::new();
    for (idx, ch) in input.chars().enumerate() {
        if idx >= max_chars {
            out.push_str("...");
            break;
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_preserves_short_input() {
        assert_eq!(truncate_chars("hello", 10), "hello");
    }

    #[test]
    fn truncation_cuts_and_marks_long_input() {
        assert_eq!(truncate_chars("hello world", 5), "hello...");
    }

    #[test]
    fn healed_conditions_are_not_user_visible() {
        assert!(!ChroniclerError::StaleDataDetected { message_id: 3 }.is_user_visible());
        assert!(ChroniclerError::EmptyBatch { raw: "x".into() }.is_user_visible());
    }
}
