use crate::provider::{ModelVariant, OptionOverrides, StylePreset};
use clap::{Args as ClapArgs, Parser, Subcommand};

/// Chat with an on-device language model
#[derive(Debug, Parser)]
#[command(name = "localchat")]
#[command(version)]
#[command(about = "Chat with an on-device language model", long_about = None)]
pub struct Args {
    /// Backend (default: config/provider or "stub")
    #[arg(long = "provider")]
    pub provider: Option<String>,

    /// Thread id (or unique prefix) to continue; a new thread is created otherwise
    #[arg(short = 't', long = "thread")]
    pub thread: Option<String>,

    #[command(flatten)]
    pub sampling: SamplingArgs,

    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// Prompt text (positional) (used when no subcommand is given)
    #[arg(value_name = "PROMPT")]
    pub prompt: Vec<String>,
}

/// Per-turn overrides; each flag wins over the thread's style preset.
#[derive(Debug, Clone, Default, ClapArgs)]
pub struct SamplingArgs {
    /// Style preset for a newly created thread (creative, balanced, precise)
    #[arg(short = 's', long = "style")]
    pub style: Option<StylePreset>,

    /// System prompt for this turn
    #[arg(long = "system")]
    pub system: Option<String>,

    /// Sampling temperature (0.0-2.0)
    #[arg(long = "temperature")]
    pub temperature: Option<f32>,

    /// Nucleus sampling threshold (0.0-1.0)
    #[arg(long = "top-p")]
    pub top_p: Option<f32>,

    /// Model variant (auto, small, medium)
    #[arg(long = "variant")]
    pub variant: Option<ModelVariant>,
}

impl SamplingArgs {
    pub fn overrides(&self) -> OptionOverrides {
        OptionOverrides {
            system_prompt: self.system.clone(),
            temperature: self.temperature,
            top_p: self.top_p,
            model_variant: self.variant,
            safety: None,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Report whether the configured backend can run on this device
    Check,

    /// Manage chat threads
    Threads {
        #[command(subcommand)]
        cmd: ThreadCommand,
    },

    /// Run an interactive terminal chat UI
    #[cfg(feature = "tui")]
    Tui,
}

#[derive(Debug, Subcommand)]
pub enum ThreadCommand {
    /// List threads
    List,
    /// Create a thread
    New {
        /// Thread title
        title: String,
    },
    /// Print a thread's messages
    Show { id: String },
    /// Rename a thread
    Rename { id: String, title: String },
    /// Change a thread's style preset
    Style { id: String, style: StylePreset },
    /// Turn content guardrails on or off for a thread
    Guardrails {
        id: String,
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
    /// Empty a thread's history (title is kept)
    Clear { id: String },
    /// Empty every thread's history
    ClearAll,
    /// Delete a thread
    Delete { id: String },
}
