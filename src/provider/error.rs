use thiserror::Error;

/// Failure causes a generation attempt can resolve with.
///
/// Clone so the same cause can travel inside a [`super::GenerationResult`]
/// and be returned from the call that detected it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("invalid session state: {0}")]
    InvalidState(String),

    #[error("transcript has no pending user message")]
    EmptyTranscript,

    #[error("input too long: {chars} chars (limit {limit})")]
    InputTooLong { chars: usize, limit: usize },

    #[error("blocked by safety filter")]
    SafetyBlocked,

    #[error("generation cancelled")]
    Cancelled,

    #[error("generation failed: {0}")]
    GenericFailure(String),
}

impl GenerationError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, GenerationError::Cancelled)
    }
}

/// Rejected configuration values (style names, variants, sampling ranges).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("unknown style preset: {0} (expected creative, balanced or precise)")]
    UnknownStyle(String),

    #[error("unknown model variant: {0} (expected auto, small or medium)")]
    UnknownVariant(String),

    #[error("{field} must be within {min}..={max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: f32,
        min: f32,
        max: f32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_too_long_display() {
        let e = GenerationError::InputTooLong { chars: 10, limit: 4 };
        assert_eq!(e.to_string(), "input too long: 10 chars (limit 4)");
    }

    #[test]
    fn is_cancelled_check() {
        assert!(GenerationError::Cancelled.is_cancelled());
        assert!(!GenerationError::SafetyBlocked.is_cancelled());
        assert!(!GenerationError::GenericFailure("x".into()).is_cancelled());
    }
}
