use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::LlmuxError;
use crate::types::{BackendName, ProviderSettings};

/// Default config file, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "llmux.toml";

/// Default settings per backend. Per-request settings are merged over these.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SettingsOfProvider {
    pub anthropic: ProviderSettings,
    #[serde(rename = "openAI")]
    pub open_ai: ProviderSettings,
    #[serde(rename = "openRouter")]
    pub open_router: ProviderSettings,
    pub deepseek: ProviderSettings,
    pub groq: ProviderSettings,
    #[serde(rename = "openAICompatible")]
    pub open_ai_compatible: ProviderSettings,
    pub gemini: ProviderSettings,
    pub ollama: ProviderSettings,
}

impl SettingsOfProvider {
    pub fn get(&self, backend: BackendName) -> &ProviderSettings {
        match backend {
            BackendName::Anthropic => &self.anthropic,
            BackendName::OpenAi => &self.open_ai,
            BackendName::OpenRouter => &self.open_router,
            BackendName::DeepSeek => &self.deepseek,
            BackendName::Groq => &self.groq,
            BackendName::OpenAiCompatible => &self.open_ai_compatible,
            BackendName::Gemini => &self.gemini,
            BackendName::Ollama => &self.ollama,
        }
    }

    pub fn get_mut(&mut self, backend: BackendName) -> &mut ProviderSettings {
        match backend {
            BackendName::Anthropic => &mut self.anthropic,
            BackendName::OpenAi => &mut self.open_ai,
            BackendName::OpenRouter => &mut self.open_router,
            BackendName::DeepSeek => &mut self.deepseek,
            BackendName::Groq => &mut self.groq,
            BackendName::OpenAiCompatible => &mut self.open_ai_compatible,
            BackendName::Gemini => &mut self.gemini,
            BackendName::Ollama => &mut self.ollama,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Events buffered per subscriber before it starts lagging.
    pub bus_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { bus_capacity: 1024 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub providers: SettingsOfProvider,
    pub transport: TransportConfig,
}

/// Environment variables that fill in settings, as `(var, backend, field)`.
const ENV_OVERRIDES: &[(&str, BackendName, EnvField)] = &[
    ("ANTHROPIC_API_KEY", BackendName::Anthropic, EnvField::ApiKey),
    ("OPENAI_API_KEY", BackendName::OpenAi, EnvField::ApiKey),
    ("OPENROUTER_API_KEY", BackendName::OpenRouter, EnvField::ApiKey),
    ("DEEPSEEK_API_KEY", BackendName::DeepSeek, EnvField::ApiKey),
    ("GROQ_API_KEY", BackendName::Groq, EnvField::ApiKey),
    ("GEMINI_API_KEY", BackendName::Gemini, EnvField::ApiKey),
    ("OLLAMA_HOST", BackendName::Ollama, EnvField::Endpoint),
];

#[derive(Clone, Copy)]
enum EnvField {
    ApiKey,
    Endpoint,
}

impl Config {
    /// Read the config file (if any), then apply environment overrides.
    pub fn load() -> Result<Self, LlmuxError> {
        let mut config = match config_path() {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|name| env::var(name).ok());

        let configured: Vec<&str> = BackendName::ALL
            .iter()
            .filter(|b| {
                let s = config.providers.get(**b);
                s.api_key().is_some() || s.endpoint().is_some()
            })
            .map(|b| b.as_str())
            .collect();
        if configured.is_empty() {
            tracing::warn!("no backend defaults configured; requests must carry their own settings");
        } else {
            tracing::info!(backends = ?configured, "loaded backend defaults");
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, LlmuxError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| LlmuxError::Config(format!("{}: {e}", path.display())))?;
        tracing::info!(path = %path.display(), "reading config file");
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, LlmuxError> {
        toml::from_str(text).map_err(|e| LlmuxError::Config(e.to_string()))
    }

    /// Overlay non-empty environment values. `lookup` is `env::var` outside
    /// of tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for (var, backend, field) in ENV_OVERRIDES {
            let Some(value) = lookup(var).filter(|v| !v.trim().is_empty()) else {
                continue;
            };
            let settings = self.providers.get_mut(*backend);
            match field {
                EnvField::ApiKey => settings.api_key = Some(value),
                EnvField::Endpoint => settings.endpoint = Some(with_scheme(&value)),
            }
        }
    }
}

/// `LLMUX_CONFIG` if set, else `./llmux.toml` if it exists.
fn config_path() -> Option<PathBuf> {
    if let Ok(path) = env::var("LLMUX_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    local.exists().then_some(local)
}

/// `OLLAMA_HOST` is often given as bare `host:port`.
fn with_scheme(host: &str) -> String {
    let host = host.trim();
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn parses_camel_case_backend_tables() {
        let config = Config::from_toml_str(
            r#"
            [providers.openAI]
            api_key = "sk-test"

            [providers.openAICompatible]
            endpoint = "http://localhost:8000/v1/"

            [providers.anthropic]
            api_key = "ak"
            max_tokens = 2048

            [transport]
            bus_capacity = 16
            "#,
        )
        .unwrap();

        assert_eq!(config.providers.get(BackendName::OpenAi).api_key(), Some("sk-test"));
        assert_eq!(
            config.providers.get(BackendName::OpenAiCompatible).endpoint(),
            Some("http://localhost:8000/v1")
        );
        assert_eq!(config.providers.anthropic.max_tokens, Some(2048));
        assert_eq!(config.transport.bus_capacity, 16);
    }

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.transport.bus_capacity, 1024);
        assert!(config.providers.gemini.api_key().is_none());
    }

    #[test]
    fn malformed_toml_is_config_error() {
        let err = Config::from_toml_str("[providers").unwrap_err();
        assert!(matches!(err, LlmuxError::Config(_)));
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = Config::from_toml_str(
            r#"
            [providers.groq]
            api_key = "from-file"
            "#,
        )
        .unwrap();
        let vars: HashMap<&str, &str> = HashMap::from([
            ("GROQ_API_KEY", "from-env"),
            ("OLLAMA_HOST", "127.0.0.1:11434"),
            ("GEMINI_API_KEY", "  "),
        ]);
        config.apply_env(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.providers.groq.api_key(), Some("from-env"));
        assert_eq!(config.providers.ollama.endpoint(), Some("http://127.0.0.1:11434"));
        assert!(config.providers.gemini.api_key().is_none());
    }

    #[test]
    fn debug_output_hides_keys() {
        let mut config = Config::default();
        config.apply_env(|name| (name == "OPENAI_API_KEY").then(|| "sk-secret".to_string()));
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret"));
    }
}
