use crate::provider::command::CommandConfig;
use crate::provider::stub::StubConfig;
use crate::provider::{ModelVariant, OptionOverrides, StylePreset};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Backend to use: "stub" or "command".
    pub provider: Option<String>,

    /// Style preset for newly created threads.
    pub style: Option<StylePreset>,

    pub model_variant: Option<ModelVariant>,
    pub system_prompt: Option<String>,

    /// Global sampling overrides; normally left unset so presets apply.
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,

    /// Log every generation at info level.
    #[serde(default)]
    pub log_generations: bool,

    #[serde(default)]
    pub stub: StubConfig,

    #[serde(default)]
    pub command: CommandConfig,
}

impl Config {
    /// Load config if the file exists, otherwise return Ok(None).
    pub fn load_optional(path: impl AsRef<Path>) -> anyhow::Result<Option<Self>> {
        let path = path.as_ref();
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::Error::new(e))
                    .with_context(|| format!("failed to read config: {}", path.display()))
            }
        };

        let s = String::from_utf8(bytes).context("config is not valid UTF-8")?;
        let cfg = Self::parse(&s)
            .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
        Ok(Some(cfg))
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let cfg: Config = toml::from_str(s)?;
        cfg.overrides().validate()?;
        Ok(cfg)
    }

    /// Option overrides contributed by the config file.
    pub fn overrides(&self) -> OptionOverrides {
        OptionOverrides {
            system_prompt: self.system_prompt.clone(),
            temperature: self.temperature,
            top_p: self.top_p,
            model_variant: self.model_variant,
            safety: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = Config::parse("").unwrap();
        assert!(cfg.provider.is_none());
        assert!(cfg.stub.supported);
        assert_eq!(cfg.stub.chunk_delay_ms, 40);
        assert_eq!(cfg.overrides(), OptionOverrides::default());
    }

    #[test]
    fn parses_full_config() {
        let cfg = Config::parse(
            r#"
            provider = "command"
            style = "precise"
            model_variant = "small"
            system_prompt = "You are concise."
            log_generations = true

            [stub]
            chunk_delay_ms = 0

            [command]
            program = "llama-cli"
            args = ["-m", "model.gguf"]
            max_prompt_chars = 8000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.provider.as_deref(), Some("command"));
        assert_eq!(cfg.style, Some(StylePreset::Precise));
        assert_eq!(cfg.model_variant, Some(ModelVariant::Small));
        assert!(cfg.log_generations);
        assert_eq!(cfg.stub.chunk_delay_ms, 0);
        assert_eq!(cfg.command.args, vec!["-m", "model.gguf"]);
        assert_eq!(cfg.command.max_prompt_chars, Some(8000));
        assert_eq!(cfg.overrides().system_prompt.as_deref(), Some("You are concise."));
    }

    #[test]
    fn unknown_style_is_rejected() {
        assert!(Config::parse(r#"style = "wild""#).is_err());
    }

    #[test]
    fn out_of_range_temperature_is_rejected() {
        assert!(Config::parse("temperature = 4.0").is_err());
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load_optional(dir.path().join("config.toml")).unwrap().is_none());
    }
}
