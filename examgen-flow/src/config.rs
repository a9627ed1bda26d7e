use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::{
    error::{FlowError, Result},
    fallback::RetryPolicyKind,
    model::{ModelDescriptor, ModelPriority, default_models},
    prompts::SYSTEM_INSTRUCTION,
};

pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 8192;

/// Runtime settings.
///
/// Layered from built-in defaults, an optional YAML file and environment variables, in
/// that order. Front ends apply their own flags on top.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Model ids in priority order.
    pub models: Vec<String>,
    pub preferred_model: Option<String>,
    pub endpoint: String,
    pub max_output_tokens: u32,
    /// No timeout unless set.
    pub timeout_secs: Option<u64>,
    pub system_instruction_file: Option<PathBuf>,
    pub retry_policy: RetryPolicyKind,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: None,
            models: default_models().into_iter().map(|m| m.id).collect(),
            preferred_model: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            timeout_secs: None,
            system_instruction_file: None,
            retry_policy: RetryPolicyKind::default(),
        }
    }
}

impl Settings {
    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    FlowError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                info!(path = %path.display(), "Loaded settings file");
                Self::from_yaml_str(&raw)?
            }
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Overrides fields from environment variables resolved through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = get("GEMINI_API_KEY").or_else(|| get("API_KEY")) {
            self.api_key = Some(key);
        }
        if let Some(models) = get("EXAMGEN_MODELS") {
            self.models = models
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(model) = get("EXAMGEN_MODEL") {
            self.preferred_model = Some(model);
        }
        if let Some(endpoint) = get("EXAMGEN_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Some(tokens) = get("EXAMGEN_MAX_OUTPUT_TOKENS") {
            self.max_output_tokens = parse_number("EXAMGEN_MAX_OUTPUT_TOKENS", &tokens)?;
        }
        if let Some(secs) = get("EXAMGEN_TIMEOUT_SECS") {
            self.timeout_secs = Some(parse_number("EXAMGEN_TIMEOUT_SECS", &secs)?);
        }
        if let Some(policy) = get("EXAMGEN_RETRY_POLICY") {
            self.retry_policy = policy.parse()?;
        }
        debug!(models = ?self.models, endpoint = %self.endpoint, "Settings resolved");
        Ok(())
    }

    /// The configured key, or `MissingInput` when there is none.
    pub fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                FlowError::MissingInput(
                    "no API key configured (set GEMINI_API_KEY or API_KEY)".to_string(),
                )
            })
    }

    /// Priority list with the preferred model first. Known ids keep their display names.
    pub fn model_priority(&self) -> Result<ModelPriority> {
        let known = default_models();
        let models = self
            .models
            .iter()
            .map(|id| {
                known
                    .iter()
                    .find(|m| &m.id == id)
                    .cloned()
                    .unwrap_or_else(|| ModelDescriptor::from_id(id.as_str()))
            })
            .collect();
        let priority = ModelPriority::new(models)?;
        Ok(match &self.preferred_model {
            Some(preferred) => priority.with_preferred(preferred),
            None => priority,
        })
    }

    /// Contents of the override file, or the built-in instruction.
    pub fn system_instruction(&self) -> Result<String> {
        match &self.system_instruction_file {
            Some(path) => std::fs::read_to_string(path).map_err(|e| {
                FlowError::Config(format!(
                    "cannot read system instruction {}: {e}",
                    path.display()
                ))
            }),
            None => Ok(SYSTEM_INSTRUCTION.to_string()),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| FlowError::Config(format!("{key} must be a number, got '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_the_backend_limits() {
        let settings = Settings::default();
        assert_eq!(settings.max_output_tokens, 8192);
        assert_eq!(settings.timeout(), None);
        assert_eq!(settings.retry_policy, RetryPolicyKind::Uniform);
        assert_eq!(settings.model_priority().unwrap().models()[0].id, "gemini-2.5-flash");
        assert!(settings.api_key().is_err());
    }

    #[test]
    fn yaml_overrides_only_what_it_names() {
        let settings = Settings::from_yaml_str(
            "models: [gemini-2.5-pro, custom-model]\nretry_policy: kind-aware\ntimeout_secs: 90\n",
        )
        .unwrap();
        assert_eq!(settings.models, ["gemini-2.5-pro", "custom-model"]);
        assert_eq!(settings.retry_policy, RetryPolicyKind::KindAware);
        assert_eq!(settings.timeout(), Some(Duration::from_secs(90)));
        assert_eq!(settings.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn malformed_yaml_is_a_config_error() {
        assert!(matches!(
            Settings::from_yaml_str("models: {"),
            Err(FlowError::Config(_))
        ));
    }

    #[test]
    fn environment_wins_over_file() {
        let mut settings = Settings::from_yaml_str("max_output_tokens: 1000\n").unwrap();
        settings
            .apply_env(env(&[
                ("API_KEY", "fallback-key"),
                ("EXAMGEN_MODELS", "a, b ,,c"),
                ("EXAMGEN_MODEL", "c"),
                ("EXAMGEN_MAX_OUTPUT_TOKENS", "4096"),
            ]))
            .unwrap();

        assert_eq!(settings.api_key().unwrap(), "fallback-key");
        assert_eq!(settings.max_output_tokens, 4096);
        let ids: Vec<_> = settings
            .model_priority()
            .unwrap()
            .models()
            .iter()
            .map(|m| m.id.clone())
            .collect();
        assert_eq!(ids, ["c", "a", "b"]);
    }

    #[test]
    fn gemini_key_takes_precedence() {
        let mut settings = Settings::default();
        settings
            .apply_env(env(&[("GEMINI_API_KEY", "primary"), ("API_KEY", "secondary")]))
            .unwrap();
        assert_eq!(settings.api_key().unwrap(), "primary");
    }

    #[test]
    fn bad_numbers_are_rejected() {
        let mut settings = Settings::default();
        let err = settings
            .apply_env(env(&[("EXAMGEN_TIMEOUT_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, FlowError::Config(_)));
    }

    #[test]
    fn empty_model_list_is_rejected() {
        let settings = Settings {
            models: Vec::new(),
            ..Settings::default()
        };
        assert_eq!(settings.model_priority().unwrap_err(), FlowError::NoModels);
    }

    #[test]
    fn missing_instruction_file_is_reported() {
        let settings = Settings {
            system_instruction_file: Some(PathBuf::from("/nonexistent/instruction.md")),
            ..Settings::default()
        };
        assert!(matches!(settings.system_instruction(), Err(FlowError::Config(_))));
        assert_eq!(Settings::default().system_instruction().unwrap(), SYSTEM_INSTRUCTION);
    }
}
