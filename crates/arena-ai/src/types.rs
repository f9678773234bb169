use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Google,
    DeepSeek,
    Grok,
    Mistral,
    Perplexity,
    LlamaCpp,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Google => "google",
            Provider::DeepSeek => "deepseek",
            Provider::Grok => "grok",
            Provider::Mistral => "mistral",
            Provider::Perplexity => "perplexity",
            Provider::LlamaCpp => "llamacpp",
        }
    }

    pub fn all() -> &'static [Provider] {
        &[
            Provider::OpenAi,
            Provider::Anthropic,
            Provider::Google,
            Provider::DeepSeek,
            Provider::Grok,
            Provider::Mistral,
            Provider::Perplexity,
            Provider::LlamaCpp,
        ]
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One typed unit of assistant output. `thought_signature` is an opaque
/// provider-issued continuity token, echoed back verbatim on later turns and
/// never inspected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Part {
    #[serde(rename = "text")]
    Text { content: String },
    #[serde(rename = "thought")]
    Thought {
        content: String,
        #[serde(rename = "thoughtSignature", skip_serializing_if = "Option::is_none")]
        thought_signature: Option<String>,
    },
    #[serde(rename = "image")]
    Image { content: String },
}

impl Part {
    pub fn text(content: impl Into<String>) -> Self {
        Part::Text {
            content: content.into(),
        }
    }

    pub fn thought(content: impl Into<String>) -> Self {
        Part::Thought {
            content: content.into(),
            thought_signature: None,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Part::Text { content } => content,
            Part::Thought { content, .. } => content,
            Part::Image { content } => content,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachedFile {
    pub name: String,
    pub content: String,
}

/// A conversation turn. `images` carries legacy inline data-URIs from older
/// history entries; new turns attach images as [`Part::Image`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<AttachedFile>>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Message {
            role: Role::User,
            parts: vec![Part::text(text)],
            images: None,
            files: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Message {
            role: Role::System,
            parts: vec![Part::text(text)],
            images: None,
            files: None,
        }
    }

    pub fn assistant(parts: Vec<Part>) -> Self {
        Message {
            role: Role::Assistant,
            parts,
            images: None,
            files: None,
        }
    }

    /// Concatenated text of every text part, with attached files rendered as
    /// named fenced blocks after the body.
    pub fn rendered_text(&self) -> String {
        let mut text = self
            .parts
            .iter()
            .filter_map(|part| match part {
                Part::Text { content } => Some(content.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        if let Some(files) = &self.files {
            for file in files {
                text.push_str(&format!("\n\n{}:\n```\n{}\n```", file.name, file.content));
            }
        }

        text
    }

    pub fn has_payload(&self) -> bool {
        !self.parts.is_empty()
            || self.images.as_ref().is_some_and(|images| !images.is_empty())
            || self.files.as_ref().is_some_and(|files| !files.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }
}

/// Per-call request knobs. Adapters clamp `max_tokens`/`temperature` to their
/// own per-model ceilings; the clamp is a plain `min`, never an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestConfig {
    pub temperature: f64,
    #[serde(rename = "maxTokens")]
    pub max_tokens: u32,
    #[serde(rename = "reasoningEffort", skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(rename = "webSearchEnabled", default)]
    pub web_search_enabled: bool,
    #[serde(rename = "shouldThink", default)]
    pub should_think: bool,
    #[serde(rename = "imageAspectRatio", skip_serializing_if = "Option::is_none")]
    pub image_aspect_ratio: Option<String>,
    #[serde(rename = "imageResolution", skip_serializing_if = "Option::is_none")]
    pub image_resolution: Option<String>,
    #[serde(rename = "localModelOverride", skip_serializing_if = "Option::is_none")]
    pub local_model_override: Option<String>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        RequestConfig {
            temperature: 1.0,
            max_tokens: 4096,
            reasoning_effort: None,
            web_search_enabled: false,
            should_think: false,
            image_aspect_ratio: None,
            image_resolution: None,
            local_model_override: None,
        }
    }
}

/// Capabilities resolvable from a model identifier alone. Model names are the
/// only capability signal the providers expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    Reasoning,
    Thinking,
    ThinkingToggle,
    WebSearch,
    Image,
}

/// Splits an inline `data:<mime>;base64,<payload>` URI into mime type and raw
/// base64 payload. Returns `None` when the string is not a data URI.
pub fn split_data_uri(uri: &str) -> Option<(&str, &str)> {
    let rest = uri.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let mime = header.strip_suffix(";base64").unwrap_or(header);
    Some((mime, payload))
}
