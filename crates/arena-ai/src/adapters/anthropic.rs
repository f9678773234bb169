use serde_json::{json, Value};
use tracing::info;

use super::{clamp_max_tokens, clamp_temperature, collect_system_text, join_url, BuiltRequest, ProviderAdapter};
use crate::content::ContentStream;
use crate::error::{flatten_error_detail, ArenaAiError, ArenaAiErrorCode};
use crate::types::{split_data_uri, Feature, Message, Part, Provider, Role};
use crate::usage::TokenCounter;

const ANTHROPIC_VERSION: &str = "2023-06-01";

const MAX_TOKEN_CEILINGS: &[(&str, u32)] = &[
    ("opus", 32_000),
    ("sonnet-4", 64_000),
    ("haiku", 8_192),
];
const DEFAULT_MAX_TOKEN_CEILING: u32 = 8_192;
const TEMPERATURE_CEILING: f64 = 1.0;

const THINKING_MODEL_MARKERS: &[&str] = &["opus-4", "sonnet-4", "haiku-4", "3-7"];
const THINKING_BUDGET_TOKENS: u32 = 1_024;

/// Messages-style backend: dedicated `system` field, typed content blocks,
/// extended thinking toggled per call with an opaque signature echoed back on
/// later turns.
pub(super) struct AnthropicMessagesAdapter {
    base_url: String,
}

impl AnthropicMessagesAdapter {
    pub(super) fn new(base_url: String) -> Self {
        Self { base_url }
    }
}

impl ProviderAdapter for AnthropicMessagesAdapter {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    fn supports(&self, feature: Feature, model: &str) -> bool {
        match feature {
            Feature::Thinking | Feature::ThinkingToggle => THINKING_MODEL_MARKERS
                .iter()
                .any(|marker| model.contains(marker)),
            Feature::WebSearch => model.starts_with("claude"),
            Feature::Reasoning | Feature::Image => false,
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
        let thinking = config.should_think && self.supports(Feature::Thinking, model);

        let mut payload = json!({
            "model": model,
            "stream": stream,
            "messages": convert_messages(messages),
            "max_tokens": clamp_max_tokens(
                model,
                config.max_tokens,
                MAX_TOKEN_CEILINGS,
                DEFAULT_MAX_TOKEN_CEILING,
            ),
        });

        if let Some(system) = collect_system_text(messages) {
            payload["system"] = Value::String(system);
        }

        if thinking {
            payload["thinking"] = json!({
                "type": "enabled",
                "budget_tokens": THINKING_BUDGET_TOKENS,
            });
            // Thinking requests reject an explicit temperature.
        } else {
            payload["temperature"] =
                json!(clamp_temperature(config.temperature, TEMPERATURE_CEILING));
        }

        if config.web_search_enabled && self.supports(Feature::WebSearch, model) {
            payload["tools"] = json!([{
                "type": "web_search_20250305",
                "name": "web_search",
            }]);
        }

        info!(
            target: "arena_ai::adapters::anthropic",
            model,
            stream,
            thinking,
            "built messages request"
        );

        Ok(BuiltRequest {
            url: join_url(&self.base_url, "messages"),
            headers: vec![
                ("x-api-key".to_string(), api_key.to_string()),
                ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
                ("content-type".to_string(), "application/json".to_string()),
            ],
            body: payload,
        })
    }

    fn on_stream_event(
        &mut self,
        event: &Value,
        usage: &mut TokenCounter,
        content: &mut ContentStream,
    ) -> Result<(), ArenaAiError> {
        let Some(event_type) = event.get("type").and_then(Value::as_str) else {
            return Ok(());
        };

        match event_type {
            "message_start" => {
                if let Some(usage_value) = event
                    .get("message")
                    .and_then(|message| message.get("usage"))
                {
                    record_anthropic_usage(usage, usage_value);
                }
            }
            "content_block_start" => {
                let kind = event
                    .get("content_block")
                    .and_then(|block| block.get("type"))
                    .and_then(Value::as_str);
                match kind {
                    Some("thinking") => content.push_thought(""),
                    Some("text") => content.push_text(""),
                    _ => {}
                }
            }
            "content_block_delta" => {
                let Some(delta) = event.get("delta") else {
                    return Ok(());
                };
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        if let Some(text) = delta.get("text").and_then(Value::as_str) {
                            content.push_text(text);
                        }
                    }
                    Some("thinking_delta") => {
                        if let Some(thinking) = delta.get("thinking").and_then(Value::as_str) {
                            content.push_thought(thinking);
                        }
                    }
                    Some("signature_delta") => {
                        if let Some(signature) = delta.get("signature").and_then(Value::as_str) {
                            content.append_thought_signature(signature);
                        }
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(usage_value) = event.get("usage") {
                    record_anthropic_usage(usage, usage_value);
                }
            }
            "error" => {
                return Err(ArenaAiError::new(
                    ArenaAiErrorCode::Protocol,
                    flatten_error_detail(event),
                )
                .with_provider(Provider::Anthropic));
            }
            // message_stop, ping, content_block_stop and anything the
            // protocol grows later.
            _ => {}
        }

        Ok(())
    }

    fn on_response(
        &self,
        body: &Value,
        usage: &mut TokenCounter,
    ) -> Result<Vec<Part>, ArenaAiError> {
        if body.get("type").and_then(Value::as_str) == Some("error") {
            return Err(ArenaAiError::new(
                ArenaAiErrorCode::Protocol,
                flatten_error_detail(body),
            )
            .with_provider(Provider::Anthropic));
        }

        if let Some(usage_value) = body.get("usage") {
            record_anthropic_usage(usage, usage_value);
        }

        let Some(blocks) = body.get("content").and_then(Value::as_array) else {
            return Err(ArenaAiError::new(
                ArenaAiErrorCode::Protocol,
                "messages document missing `content` array",
            )
            .with_provider(Provider::Anthropic)
            .with_details(body.clone()));
        };

        let mut parts = Vec::new();
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        parts.push(Part::text(text));
                    }
                }
                Some("thinking") => {
                    let thinking = block
                        .get("thinking")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    parts.push(Part::Thought {
                        content: thinking.to_string(),
                        thought_signature: block
                            .get("signature")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    });
                }
                _ => {}
            }
        }

        Ok(parts)
    }
}

fn convert_messages(messages: &[Message]) -> Vec<Value> {
    let mut converted = Vec::new();

    for message in messages {
        match message.role {
            // System turns ride in the dedicated `system` field.
            Role::System => {}
            Role::User => {
                let mut blocks = Vec::new();
                let text = message.rendered_text();
                if !text.is_empty() {
                    blocks.push(json!({ "type": "text", "text": text }));
                }
                for part in &message.parts {
                    if let Part::Image { content } = part {
                        if let Some(block) = image_block(content) {
                            blocks.push(block);
                        }
                    }
                }
                if let Some(legacy) = &message.images {
                    for image in legacy {
                        if let Some(block) = image_block(image) {
                            blocks.push(block);
                        }
                    }
                }
                if !blocks.is_empty() {
                    converted.push(json!({ "role": "user", "content": blocks }));
                }
            }
            Role::Assistant => {
                let blocks = message
                    .parts
                    .iter()
                    .filter_map(|part| match part {
                        Part::Text { content } => Some(json!({
                            "type": "text",
                            "text": content,
                        })),
                        Part::Thought {
                            content,
                            thought_signature,
                        } => {
                            let mut block = json!({
                                "type": "thinking",
                                "thinking": content,
                            });
                            if let Some(signature) = thought_signature {
                                block["signature"] = Value::String(signature.clone());
                            }
                            Some(block)
                        }
                        Part::Image { .. } => None,
                    })
                    .collect::<Vec<_>>();
                if !blocks.is_empty() {
                    converted.push(json!({ "role": "assistant", "content": blocks }));
                }
            }
        }
    }

    converted
}

fn image_block(data_uri: &str) -> Option<Value> {
    let (mime, payload) = split_data_uri(data_uri)?;
    Some(json!({
        "type": "image",
        "source": {
            "type": "base64",
            "media_type": mime,
            "data": payload,
        },
    }))
}

fn record_anthropic_usage(usage: &mut TokenCounter, value: &Value) {
    usage.record(
        value.get("input_tokens").and_then(Value::as_u64),
        value.get("output_tokens").and_then(Value::as_u64),
    );
}
