mod message;
mod orchestrator;
mod thread;

pub use message::{Message, Role};
pub use orchestrator::{ChatError, CompletedTurn, Orchestrator, OrchestratorSettings, Turn};
pub use thread::{title_from_prompt, ChatThread};
