use std::collections::{BTreeMap, HashMap};
use std::env;

use crate::types::Provider;

/// Model id the local backend falls back to when discovery cannot reach a
/// server; llama.cpp answers to any id, so the call still proceeds.
pub const LOCAL_MODEL_SENTINEL: &str = "local-model";

const DEFAULT_BASE_URLS: &[(Provider, &str)] = &[
    (Provider::OpenAi, "https://api.openai.com/v1"),
    (Provider::Anthropic, "https://api.anthropic.com/v1"),
    (
        Provider::Google,
        "https://generativelanguage.googleapis.com/v1beta",
    ),
    (Provider::DeepSeek, "https://api.deepseek.com/v1"),
    (Provider::Grok, "https://api.x.ai/v1"),
    (Provider::Mistral, "https://api.mistral.ai/v1"),
    (Provider::Perplexity, "https://api.perplexity.ai"),
];

/// Provider → {model id: display name}. The orchestrator resolves models
/// against this; UI layers read display names and per-provider lists from the
/// same map.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: BTreeMap<Provider, BTreeMap<String, String>>,
    base_urls: HashMap<Provider, String>,
}

impl ModelRegistry {
    pub fn empty() -> Self {
        Self {
            models: BTreeMap::new(),
            base_urls: DEFAULT_BASE_URLS
                .iter()
                .map(|(provider, url)| (*provider, (*url).to_string()))
                .collect(),
        }
    }

    /// The built-in catalog mirroring the upstream model list.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        let catalog: &[(Provider, &[(&str, &str)])] = &[
            (
                Provider::OpenAi,
                &[
                    ("gpt-5.2", "GPT-5.2"),
                    ("gpt-5-mini", "GPT-5 Mini"),
                    ("o3", "o3"),
                ],
            ),
            (
                Provider::Anthropic,
                &[
                    ("claude-opus-4-5", "Claude Opus 4.5"),
                    ("claude-sonnet-4-5", "Claude Sonnet 4.5"),
                    ("claude-haiku-4-5", "Claude Haiku 4.5"),
                ],
            ),
            (
                Provider::Google,
                &[
                    ("gemini-3-pro", "Gemini 3 Pro"),
                    ("gemini-3-flash", "Gemini 3 Flash"),
                    ("gemini-2.5-flash", "Gemini 2.5 Flash"),
                    ("gemini-2.5-flash-image", "Gemini 2.5 Flash Image"),
                    ("imagen-4", "Imagen 4"),
                ],
            ),
            (
                Provider::DeepSeek,
                &[
                    ("deepseek-chat", "DeepSeek Chat"),
                    ("deepseek-reasoner", "DeepSeek Reasoner"),
                ],
            ),
            (
                Provider::Grok,
                &[("grok-4", "Grok 4"), ("grok-3-mini", "Grok 3 Mini")],
            ),
            (
                Provider::Mistral,
                &[
                    ("mistral-large-latest", "Mistral Large"),
                    ("magistral-medium-latest", "Magistral Medium"),
                ],
            ),
            (
                Provider::Perplexity,
                &[
                    ("sonar", "Sonar"),
                    ("sonar-pro", "Sonar Pro"),
                    ("sonar-reasoning", "Sonar Reasoning"),
                ],
            ),
            (
                Provider::LlamaCpp,
                &[(LOCAL_MODEL_SENTINEL, "Local model")],
            ),
        ];

        for (provider, models) in catalog {
            for (id, name) in *models {
                registry.insert(*provider, id, name);
            }
        }
        registry
    }

    pub fn insert(&mut self, provider: Provider, model_id: &str, display_name: &str) {
        self.models
            .entry(provider)
            .or_default()
            .insert(model_id.to_string(), display_name.to_string());
    }

    /// Looks a model id up across every provider. Unknown ids resolve to the
    /// local backend, which accepts arbitrary ids.
    pub fn provider_for_model(&self, model_id: &str) -> Provider {
        self.models
            .iter()
            .find(|(_, models)| models.contains_key(model_id))
            .map(|(provider, _)| *provider)
            .unwrap_or(Provider::LlamaCpp)
    }

    pub fn display_name(&self, model_id: &str) -> Option<&str> {
        self.models
            .values()
            .find_map(|models| models.get(model_id))
            .map(String::as_str)
    }

    pub fn models_for_provider(&self, provider: Provider) -> Vec<(&str, &str)> {
        self.models
            .get(&provider)
            .map(|models| {
                models
                    .iter()
                    .map(|(id, name)| (id.as_str(), name.as_str()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn base_url(&self, provider: Provider) -> &str {
        self.base_urls
            .get(&provider)
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Overrides a provider endpoint, e.g. for a proxy or a test server.
    pub fn set_base_url(&mut self, provider: Provider, base_url: impl Into<String>) {
        self.base_urls.insert(provider, base_url.into());
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Caller-supplied API keys by provider, with a `{PROVIDER}_API_KEY`
/// environment fallback. The local backend never needs one.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyMap {
    keys: HashMap<Provider, String>,
}

impl ApiKeyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, provider: Provider, key: impl Into<String>) {
        self.keys.insert(provider, key.into());
    }

    pub fn get(&self, provider: Provider) -> Option<String> {
        if let Some(key) = self.keys.get(&provider) {
            if !key.trim().is_empty() {
                return Some(key.clone());
            }
        }

        let env_name = format!("{}_API_KEY", provider.as_str().to_uppercase());
        match env::var(&env_name) {
            Ok(value) if !value.trim().is_empty() => Some(value),
            _ => None,
        }
    }
}
