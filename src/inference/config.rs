//! Model configuration.
//!
//! The `models` section of `bridge.yaml`: endpoints, sampling defaults and
//! the fallback chain. Environment interpolation happens when the whole
//! file is loaded (see `crate::config`).

use std::collections::HashMap;

use serde::Deserialize;

use super::errors::InferenceError;

// ─── Public Types ────────────────────────────────────────────────────────────

/// A single model endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub display_name: String,
    /// OpenAI-compatible base URL, e.g. `http://localhost:11434/v1`.
    pub base_url: String,
    /// Model name sent in the request. Defaults to the config key.
    #[serde(default)]
    pub model_name: Option<String>,
    /// Bearer token. Usually `${OPENAI_API_KEY}`; empty means none.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> u32 {
    4096
}

/// Model registry and fallback chain.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelsConfig {
    pub active_model: String,
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
    /// Models tried, in order, when the active one is unreachable.
    #[serde(default)]
    pub fallback_chain: Vec<String>,
}

impl ModelsConfig {
    /// Models to try in order: the active one, then the fallback chain.
    ///
    /// Keys without a model entry are skipped; duplicates are tried once.
    pub fn candidate_chain(&self) -> Vec<(String, ModelConfig)> {
        let mut seen: Vec<&str> = Vec::new();
        std::iter::once(&self.active_model)
            .chain(self.fallback_chain.iter())
            .filter_map(|key| {
                if seen.contains(&key.as_str()) {
                    return None;
                }
                seen.push(key);
                self.models.get(key).map(|m| (key.clone(), m.clone()))
            })
            .collect()
    }
}

/// Resolve the active model configuration, respecting the fallback chain.
///
/// Returns `(model_key, ModelConfig)` for the first configured model.
/// Connectivity is checked at request time by the client.
pub fn resolve_active_model(config: &ModelsConfig) -> Result<(String, ModelConfig), InferenceError> {
    config
        .candidate_chain()
        .into_iter()
        .next()
        .ok_or_else(|| InferenceError::ConfigError {
            reason: format!(
                "active model '{}' not found in config and no fallback available",
                config.active_model
            ),
        })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
        active_model: primary
        models:
          primary:
            display_name: "Primary"
            base_url: "http://localhost:11111/v1"
            model_name: "gpt-4o-mini"
          backup:
            base_url: "http://localhost:22222/v1"
            temperature: 0.7
            max_tokens: 1024
        fallback_chain: [primary, missing, backup, backup]
    "#;

    #[test]
    fn test_parse_with_defaults() {
        let config: ModelsConfig = serde_yaml::from_str(YAML).unwrap();
        let primary = &config.models["primary"];
        assert_eq!(primary.temperature, 0.2);
        assert_eq!(primary.max_tokens, 4096);
        assert!(primary.api_key.is_none());
        assert_eq!(config.models["backup"].max_tokens, 1024);
    }

    #[test]
    fn test_candidate_chain_skips_missing_and_duplicates() {
        let config: ModelsConfig = serde_yaml::from_str(YAML).unwrap();
        let keys: Vec<String> = config.candidate_chain().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["primary", "backup"]);
    }

    #[test]
    fn test_resolve_falls_back_when_active_missing() {
        let mut config: ModelsConfig = serde_yaml::from_str(YAML).unwrap();
        config.active_model = "gone".into();
        let (key, _) = resolve_active_model(&config).unwrap();
        assert_eq!(key, "primary");
    }

    #[test]
    fn test_resolve_active_model_not_found() {
        let config = ModelsConfig {
            active_model: "nonexistent".into(),
            ..Default::default()
        };
        assert!(resolve_active_model(&config).is_err());
    }
}
