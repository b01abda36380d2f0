//! Style presets and the resolver that turns them into sampling parameters.

use super::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Named bundle of sampling parameters a user picks per chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StylePreset {
    Creative,
    #[default]
    Balanced,
    Precise,
}

impl StylePreset {
    pub fn as_str(self) -> &'static str {
        match self {
            StylePreset::Creative => "creative",
            StylePreset::Balanced => "balanced",
            StylePreset::Precise => "precise",
        }
    }

    /// Temperature from the fixed preset table. `None` leaves the backend default.
    fn temperature(self) -> Option<f32> {
        match self {
            StylePreset::Creative => Some(0.9),
            StylePreset::Balanced => None,
            StylePreset::Precise => Some(0.25),
        }
    }
}

impl fmt::Display for StylePreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StylePreset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "creative" => Ok(StylePreset::Creative),
            "balanced" => Ok(StylePreset::Balanced),
            "precise" => Ok(StylePreset::Precise),
            _ => Err(ConfigError::UnknownStyle(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelVariant {
    #[default]
    Auto,
    Small,
    Medium,
}

impl ModelVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelVariant::Auto => "auto",
            ModelVariant::Small => "small",
            ModelVariant::Medium => "medium",
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelVariant {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(ModelVariant::Auto),
            "small" => Ok(ModelVariant::Small),
            "medium" => Ok(ModelVariant::Medium),
            _ => Err(ConfigError::UnknownVariant(s.to_string())),
        }
    }
}

/// Which backend-side content filtering applies to a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyPolicy {
    #[default]
    Guarded,
    Unguarded,
}

impl SafetyPolicy {
    pub fn from_guardrails(enabled: bool) -> Self {
        if enabled {
            SafetyPolicy::Guarded
        } else {
            SafetyPolicy::Unguarded
        }
    }
}

/// Concrete sampling parameters handed to a session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// May be empty, in which case no system line is emitted.
    pub system_prompt: String,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub model_variant: ModelVariant,
    pub safety: SafetyPolicy,
}

/// Explicit per-field overrides; each `Some` wins over the preset value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OptionOverrides {
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub model_variant: Option<ModelVariant>,
    pub safety: Option<SafetyPolicy>,
}

impl OptionOverrides {
    #[cfg(test)]
    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = Some(t);
        self
    }

    #[cfg(test)]
    pub fn top_p(mut self, p: f32) -> Self {
        self.top_p = Some(p);
        self
    }

    #[cfg(test)]
    pub fn system_prompt(mut self, s: impl Into<String>) -> Self {
        self.system_prompt = Some(s.into());
        self
    }

    /// Fill every unset field from `fallback`. Fields already set are kept.
    pub fn or(mut self, fallback: &OptionOverrides) -> Self {
        if self.system_prompt.is_none() {
            self.system_prompt = fallback.system_prompt.clone();
        }
        self.temperature = self.temperature.or(fallback.temperature);
        self.top_p = self.top_p.or(fallback.top_p);
        self.model_variant = self.model_variant.or(fallback.model_variant);
        self.safety = self.safety.or(fallback.safety);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(t) = self.temperature {
            check_range("temperature", t, 0.0, 2.0)?;
        }
        if let Some(p) = self.top_p {
            check_range("top_p", p, 0.0, 1.0)?;
        }
        Ok(())
    }
}

fn check_range(field: &'static str, value: f32, min: f32, max: f32) -> Result<(), ConfigError> {
    if value.is_nan() || value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

/// Derive options from a preset, letting explicit overrides win field by field.
pub fn resolve(preset: StylePreset, overrides: &OptionOverrides) -> GenerationOptions {
    GenerationOptions {
        system_prompt: overrides.system_prompt.clone().unwrap_or_default(),
        temperature: overrides.temperature.or(preset.temperature()),
        // No preset pins top_p.
        top_p: overrides.top_p,
        model_variant: overrides.model_variant.unwrap_or_default(),
        safety: overrides.safety.unwrap_or_default(),
    }
}

/// [`resolve`] with a lower-priority layer of `defaults`.
///
/// Sampling values in `defaults` only fill what both `overrides` and the
/// preset leave unset, so configured defaults never flatten the presets.
pub fn resolve_with_defaults(
    preset: StylePreset,
    overrides: &OptionOverrides,
    defaults: &OptionOverrides,
) -> GenerationOptions {
    let unsampled = OptionOverrides {
        temperature: None,
        top_p: None,
        ..defaults.clone()
    };
    let mut options = resolve(preset, &overrides.clone().or(&unsampled));
    options.temperature = options.temperature.or(defaults.temperature);
    options.top_p = options.top_p.or(defaults.top_p);
    options
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_without_overrides() {
        let none = OptionOverrides::default();

        let creative = resolve(StylePreset::Creative, &none);
        assert_eq!(creative.temperature, Some(0.9));
        assert_eq!(creative.top_p, None);

        let balanced = resolve(StylePreset::Balanced, &none);
        assert_eq!(balanced.temperature, None);
        assert_eq!(balanced.top_p, None);

        let precise = resolve(StylePreset::Precise, &none);
        assert_eq!(precise.temperature, Some(0.25));
        assert_eq!(precise.top_p, None);
    }

    #[test]
    fn override_wins_over_preset() {
        let o = resolve(StylePreset::Precise, &OptionOverrides::default().temperature(1.5));
        assert_eq!(o.temperature, Some(1.5));
        assert_eq!(o.top_p, None);
    }

    #[test]
    fn resolve_is_deterministic() {
        let ov = OptionOverrides::default().system_prompt("be brief").top_p(0.5);
        assert_eq!(
            resolve(StylePreset::Creative, &ov),
            resolve(StylePreset::Creative, &ov)
        );
        let o = resolve(StylePreset::Creative, &ov);
        assert_eq!(o.system_prompt, "be brief");
        assert_eq!(o.top_p, Some(0.5));
        assert_eq!(o.model_variant, ModelVariant::Auto);
        assert_eq!(o.safety, SafetyPolicy::Guarded);
    }

    #[test]
    fn defaults_rank_below_presets() {
        let cfg = OptionOverrides::default()
            .temperature(1.0)
            .top_p(0.8)
            .system_prompt("cfg");
        let none = OptionOverrides::default();

        let creative = resolve_with_defaults(StylePreset::Creative, &none, &cfg);
        assert_eq!(creative.temperature, Some(0.9));
        assert_eq!(creative.top_p, Some(0.8));
        assert_eq!(creative.system_prompt, "cfg");

        let precise = resolve_with_defaults(StylePreset::Precise, &none, &cfg);
        assert_eq!(precise.temperature, Some(0.25));

        let balanced = resolve_with_defaults(StylePreset::Balanced, &none, &cfg);
        assert_eq!(balanced.temperature, Some(1.0));

        let call = OptionOverrides::default().temperature(1.5).system_prompt("call");
        let o = resolve_with_defaults(StylePreset::Precise, &call, &cfg);
        assert_eq!(o.temperature, Some(1.5));
        assert_eq!(o.system_prompt, "call");
    }

    #[test]
    fn or_keeps_explicit_fields() {
        let cli = OptionOverrides::default().temperature(0.1);
        let cfg = OptionOverrides::default().temperature(1.0).system_prompt("cfg");
        let merged = cli.or(&cfg);
        assert_eq!(merged.temperature, Some(0.1));
        assert_eq!(merged.system_prompt.as_deref(), Some("cfg"));
    }

    #[test]
    fn unknown_style_fails_fast() {
        assert_eq!("Precise".parse::<StylePreset>(), Ok(StylePreset::Precise));
        assert!(matches!(
            "wild".parse::<StylePreset>(),
            Err(ConfigError::UnknownStyle(_))
        ));
        assert!("tiny".parse::<ModelVariant>().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range() {
        assert!(OptionOverrides::default().temperature(2.0).validate().is_ok());
        assert!(OptionOverrides::default().temperature(2.5).validate().is_err());
        assert!(OptionOverrides::default().top_p(-0.1).validate().is_err());
        assert!(OptionOverrides::default().top_p(f32::NAN).validate().is_err());
    }
}
