use std::env;

use lens_contracts::runs::activity_log::DEFAULT_LOG_CAPACITY;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image-preview";
pub const DRYRUN_MODEL: &str = "dryrun-image";

/// Settings read from the environment; CLI flags override individual fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LensConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub image_model: String,
    pub log_capacity: usize,
}

impl Default for LensConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

impl LensConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();
        Self {
            api_base: read("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or(defaults.api_base),
            api_key: read("GEMINI_API_KEY").or_else(|| read("GOOGLE_API_KEY")),
            image_model: read("GEMINI_IMAGE_MODEL").unwrap_or(defaults.image_model),
            log_capacity: read("GEMINI_LENS_LOG_CAPACITY")
                .and_then(|value| value.parse::<usize>().ok())
                .filter(|value| *value > 0)
                .unwrap_or(defaults.log_capacity),
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        if let Some(model) = model.map(|value| value.trim().to_string()) {
            if !model.is_empty() {
                self.image_model = model;
            }
        }
        self
    }

    pub fn is_dryrun(&self) -> bool {
        self.image_model.starts_with("dryrun")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{LensConfig, DEFAULT_API_BASE, DEFAULT_IMAGE_MODEL};

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let config = LensConfig::from_lookup(lookup(&[]));
        assert_eq!(config.api_base, DEFAULT_API_BASE);
        assert_eq!(config.image_model, DEFAULT_IMAGE_MODEL);
        assert!(config.api_key.is_none());
        assert_eq!(config.log_capacity, 50);
    }

    #[test]
    fn environment_overrides_and_key_fallback() {
        let config = LensConfig::from_lookup(lookup(&[
            ("GEMINI_API_BASE", "http://127.0.0.1:9000/v1/ "),
            ("GEMINI_API_KEY", "  "),
            ("GOOGLE_API_KEY", "google-key"),
            ("GEMINI_IMAGE_MODEL", "gemini-test"),
            ("GEMINI_LENS_LOG_CAPACITY", "0"),
        ]));
        assert_eq!(config.api_base, "http://127.0.0.1:9000/v1");
        assert_eq!(config.api_key.as_deref(), Some("google-key"));
        assert_eq!(config.image_model, "gemini-test");
        assert_eq!(config.log_capacity, 50);
    }

    #[test]
    fn model_override_and_dryrun_detection() {
        let config = LensConfig::default().with_model(Some("dryrun-image".to_string()));
        assert!(config.is_dryrun());
        let unchanged = LensConfig::default().with_model(Some(" ".to_string()));
        assert_eq!(unchanged.image_model, DEFAULT_IMAGE_MODEL);
        assert!(!unchanged.is_dryrun());
    }
}
