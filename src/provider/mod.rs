pub mod command;
mod error;
mod options;
mod prompt;
pub mod session;
pub mod stub;
mod types;

pub use error::{ConfigError, GenerationError};
pub use options::{
    resolve_with_defaults, GenerationOptions, ModelVariant, OptionOverrides, SafetyPolicy,
    StylePreset,
};
pub use prompt::Prompt;
pub use session::{GenerationStream, Session, SessionCanceller};
pub use types::{
    Backend, BackendEvent, BackendFuture, BackendStream, FinishReason, GenerationResult,
    Provider, SessionConfig, SessionEvent, TokenUsage,
};
