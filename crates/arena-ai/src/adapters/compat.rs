use serde_json::{json, Value};
use tracing::info;

use super::{clamp_max_tokens, clamp_temperature, collect_system_text, join_url, BuiltRequest, ProviderAdapter};
use crate::content::ContentStream;
use crate::error::{flatten_error_detail, ArenaAiError, ArenaAiErrorCode};
use crate::types::{Feature, Message, Part, Provider, ReasoningEffort, Role};
use crate::usage::{TokenCounter, UsageMode};

/// Static description of one chat/completions-speaking backend. The five
/// backends below share one adapter implementation and differ only in these
/// fields.
#[derive(Debug)]
pub struct CompatBackend {
    pub provider: Provider,
    pub ceilings: &'static [(&'static str, u32)],
    pub default_max_tokens: u32,
    pub temperature_ceiling: f64,
    /// Model-name substrings that mark a reasoning model; those requests omit
    /// `temperature`.
    pub reasoning_markers: &'static [&'static str],
    /// Subset of reasoning models that accept a `reasoning_effort` field.
    pub effort_markers: &'static [&'static str],
    /// Search is built into every model (no toggle, results always cited).
    pub web_search_always: bool,
    /// Append citations / search results as a trailing source block.
    pub cite_sources: bool,
    pub bearer_auth: bool,
    pub usage_mode: UsageMode,
}

pub(super) const BACKENDS: &[CompatBackend] = &[
    CompatBackend {
        provider: Provider::DeepSeek,
        ceilings: &[("reasoner", 64_000)],
        default_max_tokens: 8_192,
        temperature_ceiling: 2.0,
        reasoning_markers: &["reasoner"],
        effort_markers: &[],
        web_search_always: false,
        cite_sources: false,
        bearer_auth: true,
        usage_mode: UsageMode::Cumulative,
    },
    CompatBackend {
        provider: Provider::Grok,
        ceilings: &[("grok-4", 64_000)],
        default_max_tokens: 16_384,
        temperature_ceiling: 2.0,
        reasoning_markers: &["mini"],
        effort_markers: &["mini"],
        web_search_always: false,
        cite_sources: false,
        bearer_auth: true,
        usage_mode: UsageMode::Cumulative,
    },
    CompatBackend {
        provider: Provider::Mistral,
        ceilings: &[("magistral", 40_000)],
        default_max_tokens: 16_384,
        temperature_ceiling: 1.0,
        reasoning_markers: &["magistral"],
        effort_markers: &[],
        web_search_always: false,
        cite_sources: false,
        bearer_auth: true,
        usage_mode: UsageMode::Cumulative,
    },
    CompatBackend {
        provider: Provider::Perplexity,
        ceilings: &[],
        default_max_tokens: 8_192,
        temperature_ceiling: 2.0,
        reasoning_markers: &["reasoning"],
        effort_markers: &[],
        web_search_always: true,
        cite_sources: true,
        bearer_auth: true,
        usage_mode: UsageMode::Cumulative,
    },
    CompatBackend {
        provider: Provider::LlamaCpp,
        ceilings: &[],
        default_max_tokens: 8_192,
        temperature_ceiling: 2.0,
        reasoning_markers: &[],
        effort_markers: &[],
        web_search_always: false,
        cite_sources: false,
        bearer_auth: false,
        usage_mode: UsageMode::Incremental,
    },
];

pub(super) struct OpenAiCompatAdapter {
    backend: &'static CompatBackend,
    base_url: String,
    citations: Vec<String>,
}

impl OpenAiCompatAdapter {
    pub(super) fn new(backend: &'static CompatBackend, base_url: String) -> Self {
        Self {
            backend,
            base_url,
            citations: Vec::new(),
        }
    }

    fn reasoning_model(&self, model: &str) -> bool {
        self.backend
            .reasoning_markers
            .iter()
            .any(|marker| model.contains(marker))
    }

    fn collect_citations(&mut self, payload: &Value) {
        if let Some(urls) = payload.get("citations").and_then(Value::as_array) {
            for url in urls.iter().filter_map(Value::as_str) {
                if !self.citations.iter().any(|existing| existing == url) {
                    self.citations.push(url.to_string());
                }
            }
        }
        if let Some(results) = payload.get("search_results").and_then(Value::as_array) {
            for result in results {
                let Some(url) = result.get("url").and_then(Value::as_str) else {
                    continue;
                };
                let entry = match result.get("title").and_then(Value::as_str) {
                    Some(title) if !title.is_empty() => format!("{title} ({url})"),
                    _ => url.to_string(),
                };
                if !self
                    .citations
                    .iter()
                    .any(|existing| existing.contains(url))
                {
                    self.citations.push(entry);
                }
            }
        }
    }

    fn citation_trailer(&self) -> Option<String> {
        if !self.backend.cite_sources || self.citations.is_empty() {
            return None;
        }
        let mut trailer = String::from("\n\nSources:");
        for (index, citation) in self.citations.iter().enumerate() {
            trailer.push_str(&format!("\n{}. {citation}", index + 1));
        }
        Some(trailer)
    }
}

impl ProviderAdapter for OpenAiCompatAdapter {
    fn provider(&self) -> Provider {
        self.backend.provider
    }

    fn usage_mode(&self) -> UsageMode {
        self.backend.usage_mode
    }

    fn supports(&self, feature: Feature, model: &str) -> bool {
        match feature {
            Feature::Reasoning => self.reasoning_model(model),
            Feature::WebSearch => self.backend.web_search_always,
            Feature::Thinking | Feature::ThinkingToggle | Feature::Image => false,
        }
    }

    fn build_request(
        &self,
        model: &str,
        messages: &[Message],
        stream: bool,
        config: &crate::types::RequestConfig,
        api_key: &str,
    ) -> Result<BuiltRequest, ArenaAiError> {
        let mut payload = json!({
            "model": model,
            "stream": stream,
            "messages": convert_messages(messages),
            "max_tokens": clamp_max_tokens(
                model,
                config.max_tokens,
                self.backend.ceilings,
                self.backend.default_max_tokens,
            ),
        });

        if stream {
            payload["stream_options"] = json!({ "include_usage": true });
        }

        if self.reasoning_model(model) {
            if self
                .backend
                .effort_markers
                .iter()
                .any(|marker| model.contains(marker))
            {
                let effort = match config.reasoning_effort.unwrap_or(ReasoningEffort::Medium) {
                    ReasoningEffort::Low => "low",
                    ReasoningEffort::Medium | ReasoningEffort::High => "high",
                };
                payload["reasoning_effort"] = json!(effort);
            }
            // Reasoning model names take no temperature.
        } else {
            payload["temperature"] = json!(clamp_temperature(
                config.temperature,
                self.backend.temperature_ceiling,
            ));
        }

        let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        if self.backend.bearer_auth {
            headers.push(("Authorization".to_string(), format!("Bearer {api_key}")));
        }

        info!(
            target: "arena_ai::adapters::compat",
            provider = %self.backend.provider,
            model,
            stream,
            "built chat-completions request"
        );

        Ok(BuiltRequest {
            url: join_url(&self.base_url, "chat/completions"),
            headers,
            body: payload,
        })
    }

    fn on_stream_event(
        &mut self,
        event: &Value,
        usage: &mut TokenCounter,
        content: &mut ContentStream,
    ) -> Result<(), ArenaAiError> {
        if let Some(error) = event.get("error") {
            return Err(ArenaAiError::new(
                ArenaAiErrorCode::Protocol,
                flatten_error_detail(error),
            )
            .with_provider(self.backend.provider));
        }

        if let Some(usage_value) = event.get("usage").filter(|value| !value.is_null()) {
            record_chat_usage(usage, usage_value);
        }
        self.collect_citations(event);

        let Some(delta) = event
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("delta"))
        else {
            return Ok(());
        };

        if let Some(reasoning) = delta.get("reasoning_content").and_then(Value::as_str) {
            content.push_thought(reasoning);
        }
        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            content.push_text(text);
        }

        Ok(())
    }

    fn on_stream_end(
        &mut self,
        _usage: &mut TokenCounter,
        content: &mut ContentStream,
    ) -> Result<(), ArenaAiError> {
        if let Some(trailer) = self.citation_trailer() {
            content.push_text(&trailer);
        }
        Ok(())
    }

    fn on_response(
        &self,
        body: &Value,
        usage: &mut TokenCounter,
    ) -> Result<Vec<Part>, ArenaAiError> {
        if let Some(error) = body.get("error") {
            return Err(ArenaAiError::new(
                ArenaAiErrorCode::Protocol,
                flatten_error_detail(error),
            )
            .with_provider(self.backend.provider));
        }

        if let Some(usage_value) = body.get("usage").filter(|value| !value.is_null()) {
            record_chat_usage(usage, usage_value);
        }

        let Some(message) = body
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
        else {
            return Err(ArenaAiError::new(
                ArenaAiErrorCode::Protocol,
                "chat-completions document missing choices[0].message",
            )
            .with_provider(self.backend.provider)
            .with_details(body.clone()));
        };

        let mut parts = Vec::new();
        if let Some(reasoning) = message
            .get("reasoning_content")
            .and_then(Value::as_str)
            .filter(|reasoning| !reasoning.is_empty())
        {
            parts.push(Part::thought(reasoning));
        }

        let mut text = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if self.backend.cite_sources {
            let mut scratch = Self::new(self.backend, self.base_url.clone());
            scratch.collect_citations(body);
            if let Some(trailer) = scratch.citation_trailer() {
                text.push_str(&trailer);
            }
        }
        if !text.is_empty() {
            parts.push(Part::text(text));
        }

        Ok(parts)
    }
}

fn convert_messages(messages: &[Message]) -> Vec<Value> {
    let mut converted = Vec::new();

    // System text rides in the first message slot on these backends.
    if let Some(system) = collect_system_text(messages) {
        converted.push(json!({ "role": "system", "content": system }));
    }

    for message in messages {
        match message.role {
            Role::System => {}
            Role::User => {
                let text = message.rendered_text();
                let images = user_images(message);
                if images.is_empty() {
                    if !text.is_empty() {
                        converted.push(json!({ "role": "user", "content": text }));
                    }
                } else {
                    let mut blocks = Vec::new();
                    if !text.is_empty() {
                        blocks.push(json!({ "type": "text", "text": text }));
                    }
                    for image in images {
                        blocks.push(json!({
                            "type": "image_url",
                            "image_url": { "url": image },
                        }));
                    }
                    converted.push(json!({ "role": "user", "content": blocks }));
                }
            }
            Role::Assistant => {
                // Thought parts stay local: chat/completions has no slot for
                // replaying another turn's reasoning.
                let text = message
                    .parts
                    .iter()
                    .filter_map(|part| match part {
                        Part::Text { content } => Some(content.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                if !text.is_empty() {
                    converted.push(json!({ "role": "assistant", "content": text }));
                }
            }
        }
    }

    converted
}

fn user_images(message: &Message) -> Vec<String> {
    let mut images = Vec::new();
    for part in &message.parts {
        if let Part::Image { content } = part {
            images.push(content.clone());
        }
    }
    if let Some(legacy) = &message.images {
        images.extend(legacy.iter().cloned());
    }
    images
}

fn record_chat_usage(usage: &mut TokenCounter, value: &Value) {
    usage.record(
        value.get("prompt_tokens").and_then(Value::as_u64),
        value.get("completion_tokens").and_then(Value::as_u64),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RequestConfig;
    use serde_json::json;

    fn backend(provider: Provider) -> &'static CompatBackend {
        BACKENDS
            .iter()
            .find(|backend| backend.provider == provider)
            .expect("backend")
    }

    fn adapter(provider: Provider) -> OpenAiCompatAdapter {
        OpenAiCompatAdapter::new(backend(provider), "https://api.example.com/v1".to_string())
    }

    #[test]
    fn reasoning_model_names_omit_temperature() {
        let request = adapter(Provider::DeepSeek)
            .build_request(
                "deepseek-reasoner",
                &[Message::user("hi")],
                true,
                &RequestConfig::default(),
                "key",
            )
            .expect("build request");
        assert!(request.body.get("temperature").is_none());

        let request = adapter(Provider::DeepSeek)
            .build_request(
                "deepseek-chat",
                &[Message::user("hi")],
                true,
                &RequestConfig::default(),
                "key",
            )
            .expect("build request");
        assert!(request.body.get("temperature").is_some());
    }

    #[test]
    fn effort_capable_models_send_reasoning_effort() {
        let config = RequestConfig {
            reasoning_effort: Some(crate::types::ReasoningEffort::Low),
            ..RequestConfig::default()
        };
        let request = adapter(Provider::Grok)
            .build_request("grok-3-mini", &[Message::user("hi")], true, &config, "key")
            .expect("build request");
        assert_eq!(request.body["reasoning_effort"], "low");
    }

    #[test]
    fn streaming_requests_ask_for_usage_frames() {
        let request = adapter(Provider::Mistral)
            .build_request(
                "mistral-large-latest",
                &[Message::user("hi")],
                true,
                &RequestConfig::default(),
                "key",
            )
            .expect("build request");
        assert_eq!(request.body["stream_options"]["include_usage"], true);

        let request = adapter(Provider::Mistral)
            .build_request(
                "mistral-large-latest",
                &[Message::user("hi")],
                false,
                &RequestConfig::default(),
                "key",
            )
            .expect("build request");
        assert!(request.body.get("stream_options").is_none());
    }

    #[test]
    fn local_backend_sends_no_auth_header() {
        let request = adapter(Provider::LlamaCpp)
            .build_request(
                "local-model",
                &[Message::user("hi")],
                true,
                &RequestConfig::default(),
                "",
            )
            .expect("build request");
        assert!(request
            .headers
            .iter()
            .all(|(name, _)| name != "Authorization"));
    }

    #[test]
    fn system_text_lands_in_the_first_message_slot() {
        let messages = vec![Message::system("Be brief."), Message::user("hi")];
        let request = adapter(Provider::DeepSeek)
            .build_request(
                "deepseek-chat",
                &messages,
                true,
                &RequestConfig::default(),
                "key",
            )
            .expect("build request");
        let converted = request.body["messages"].as_array().expect("messages");
        assert_eq!(converted[0]["role"], "system");
        assert_eq!(converted[0]["content"], "Be brief.");
    }

    #[test]
    fn deltas_route_reasoning_and_content_separately() {
        let mut adapter = adapter(Provider::DeepSeek);
        let mut usage = TokenCounter::new(adapter.usage_mode());
        let mut content = ContentStream::new();

        let frames = [
            json!({"choices": [{"delta": {"reasoning_content": "let me think"}}]}),
            json!({"choices": [{"delta": {"content": "Hel"}}]}),
            json!({"choices": [{"delta": {"content": "lo"}}]}),
            json!({"choices": [], "usage": {"prompt_tokens": 11, "completion_tokens": 6}}),
        ];
        for frame in &frames {
            adapter
                .on_stream_event(frame, &mut usage, &mut content)
                .expect("frame");
        }

        assert_eq!((usage.input, usage.output), (11, 6));
        assert_eq!(
            content.into_parts(),
            vec![Part::thought("let me think"), Part::text("Hello")]
        );
    }

    #[test]
    fn incremental_backend_sums_usage_frames() {
        let mut adapter = adapter(Provider::LlamaCpp);
        let mut usage = TokenCounter::new(adapter.usage_mode());
        let mut content = ContentStream::new();

        for frame in [
            json!({"choices": [], "usage": {"prompt_tokens": 10, "completion_tokens": 5}}),
            json!({"choices": [], "usage": {"prompt_tokens": 15, "completion_tokens": 9}}),
        ] {
            adapter
                .on_stream_event(&frame, &mut usage, &mut content)
                .expect("frame");
        }
        assert_eq!((usage.input, usage.output), (25, 14));
    }

    #[test]
    fn citations_append_as_a_trailing_source_block() {
        let mut adapter = adapter(Provider::Perplexity);
        let mut usage = TokenCounter::new(adapter.usage_mode());
        let mut content = ContentStream::new();

        let frames = [
            json!({"choices": [{"delta": {"content": "Answer."}}], "citations": ["https://a.example", "https://b.example"]}),
            json!({"choices": [{"delta": {"content": ""}}], "citations": ["https://a.example"]}),
        ];
        for frame in &frames {
            adapter
                .on_stream_event(frame, &mut usage, &mut content)
                .expect("frame");
        }
        adapter
            .on_stream_end(&mut usage, &mut content)
            .expect("stream end");

        let parts = content.into_parts();
        assert_eq!(parts.len(), 1);
        let Part::Text { content } = &parts[0] else {
            panic!("expected text part");
        };
        assert!(content.starts_with("Answer."));
        assert!(content.contains("Sources:\n1. https://a.example\n2. https://b.example"));
    }

    #[test]
    fn non_streaming_response_carries_citations_too() {
        let adapter = adapter(Provider::Perplexity);
        let mut usage = TokenCounter::new(adapter.usage_mode());
        let body = json!({
            "choices": [{"message": {"content": "Answer."}}],
            "search_results": [{"title": "A Page", "url": "https://a.example"}],
            "usage": {"prompt_tokens": 4, "completion_tokens": 2},
        });
        let parts = adapter.on_response(&body, &mut usage).expect("parts");
        let Part::Text { content } = &parts[0] else {
            panic!("expected text part");
        };
        assert!(content.contains("Sources:\n1. A Page (https://a.example)"));
    }

    #[test]
    fn in_band_error_objects_raise() {
        let mut adapter = adapter(Provider::Grok);
        let mut usage = TokenCounter::new(adapter.usage_mode());
        let mut content = ContentStream::new();
        let error = adapter
            .on_stream_event(
                &json!({"error": {"message": "credits exhausted"}}),
                &mut usage,
                &mut content,
            )
            .expect_err("error object");
        assert_eq!(error.code, ArenaAiErrorCode::Protocol);
        assert!(error.message.contains("credits exhausted"));
    }
}
