use serde_json::{json, Value};
use tracing::info;

use super::{clamp_max_tokens, clamp_temperature, collect_system_text, join_url, BuiltRequest, ProviderAdapter};
use crate::content::ContentStream;
use crate::error::{flatten_error_detail, ArenaAiError, ArenaAiErrorCode};
use crate::types::{Feature, Message, Part, Provider, ReasoningEffort, Role};
use crate::usage::TokenCounter;

const MAX_TOKEN_CEILINGS: &[(&str, u32)] = &[
    ("gpt-5", 128_000),
    ("o3", 100_000),
    ("o1", 100_000),
    ("gpt-4.1", 32_768),
];
const DEFAULT_MAX_TOKEN_CEILING: u32 = 16_384;
const TEMPERATURE_CEILING: f64 = 2.0;

/// Responses-style backend: system text travels as `instructions`, history as
/// an `input` item array, reasoning as `reasoning.effort`.
pub(super) struct OpenAiResponsesAdapter {
    base_url: String,
}

impl OpenAiResponsesAdapter {
    pub(super) fn new(base_url: String) -> Self {
        Self { base_url }
    }

    fn reasoning_mode(&self, model: &str) -> bool {
        self.supports(Feature::Reasoning, model)
    }
}

impl ProviderAdapter for OpenAiResponsesAdapter {
    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    fn supports(&self, feature: Feature, model: &str) -> bool {
        match feature {
            Feature::Reasoning => {
                model.starts_with("gpt-5")
                    || model.starts_with("o1")
                    || model.starts_with("o3")
                    || model.starts_with("o4")
            }
            Feature::WebSearch => model.starts_with("gpt-") || model.starts_with("o"),
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
            "store": false,
            "input": convert_input_items(messages),
            "max_output_tokens": clamp_max_tokens(
                model,
                config.max_tokens,
                MAX_TOKEN_CEILINGS,
                DEFAULT_MAX_TOKEN_CEILING,
            ),
        });

        if let Some(instructions) = collect_system_text(messages) {
            payload["instructions"] = Value::String(instructions);
        }

        if self.reasoning_mode(model) {
            let effort = config.reasoning_effort.unwrap_or(ReasoningEffort::Medium);
            payload["reasoning"] = json!({
                "effort": effort.as_str(),
                "summary": "auto",
            });
            // Reasoning requests reject an explicit temperature.
        } else {
            payload["temperature"] =
                json!(clamp_temperature(config.temperature, TEMPERATURE_CEILING));
        }

        if config.web_search_enabled && self.supports(Feature::WebSearch, model) {
            payload["tools"] = json!([{ "type": "web_search" }]);
        }

        info!(
            target: "arena_ai::adapters::openai",
            model,
            stream,
            "built responses request"
        );

        Ok(BuiltRequest {
            url: join_url(&self.base_url, "responses"),
            headers: vec![
                ("Authorization".to_string(), format!("Bearer {api_key}")),
                ("Content-Type".to_string(), "application/json".to_string()),
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
            "response.output_text.delta" | "response.refusal.delta" => {
                if let Some(delta) = event.get("delta").and_then(Value::as_str) {
                    content.push_text(delta);
                }
            }
            "response.reasoning_summary_text.delta" | "response.reasoning_text.delta" => {
                if let Some(delta) = event.get("delta").and_then(Value::as_str) {
                    content.push_thought(delta);
                }
            }
            "response.completed" => {
                if let Some(usage_value) = event
                    .get("response")
                    .and_then(|response| response.get("usage"))
                {
                    record_responses_usage(usage, usage_value);
                }
            }
            "response.failed" => {
                let detail = event
                    .get("response")
                    .and_then(|response| response.get("error"))
                    .map(flatten_error_detail)
                    .unwrap_or_else(|| "response failed".to_string());
                return Err(
                    ArenaAiError::new(ArenaAiErrorCode::Protocol, detail)
                        .with_provider(Provider::OpenAi),
                );
            }
            "error" => {
                return Err(ArenaAiError::new(
                    ArenaAiErrorCode::Protocol,
                    flatten_error_detail(event),
                )
                .with_provider(Provider::OpenAi));
            }
            _ => {}
        }

        Ok(())
    }

    fn on_response(
        &self,
        body: &Value,
        usage: &mut TokenCounter,
    ) -> Result<Vec<Part>, ArenaAiError> {
        if let Some(usage_value) = body.get("usage") {
            record_responses_usage(usage, usage_value);
        }

        let Some(output) = body.get("output").and_then(Value::as_array) else {
            return Err(ArenaAiError::new(
                ArenaAiErrorCode::Protocol,
                "responses document missing `output` array",
            )
            .with_provider(Provider::OpenAi)
            .with_details(body.clone()));
        };

        let mut parts = Vec::new();
        for item in output {
            match item.get("type").and_then(Value::as_str) {
                Some("message") => {
                    let text = item
                        .get("content")
                        .and_then(Value::as_array)
                        .map(|blocks| {
                            blocks
                                .iter()
                                .filter_map(|block| match block.get("type").and_then(Value::as_str)
                                {
                                    Some("output_text") => {
                                        block.get("text").and_then(Value::as_str)
                                    }
                                    Some("refusal") => {
                                        block.get("refusal").and_then(Value::as_str)
                                    }
                                    _ => None,
                                })
                                .collect::<Vec<_>>()
                                .join("")
                        })
                        .unwrap_or_default();
                    if !text.is_empty() {
                        parts.push(Part::text(text));
                    }
                }
                Some("reasoning") => {
                    let summary = item
                        .get("summary")
                        .and_then(Value::as_array)
                        .map(|blocks| {
                            blocks
                                .iter()
                                .filter_map(|block| block.get("text").and_then(Value::as_str))
                                .collect::<Vec<_>>()
                                .join("\n")
                        })
                        .unwrap_or_default();
                    if !summary.is_empty() {
                        parts.push(Part::thought(summary));
                    }
                }
                _ => {}
            }
        }

        Ok(parts)
    }
}

fn convert_input_items(messages: &[Message]) -> Value {
    let mut items = Vec::new();

    for message in messages {
        match message.role {
            // System turns ride in `instructions`, not the input array.
            Role::System => {}
            Role::User => {
                let mut blocks = Vec::new();
                let text = message.rendered_text();
                if !text.is_empty() {
                    blocks.push(json!({ "type": "input_text", "text": text }));
                }
                for image in inline_images(message) {
                    blocks.push(json!({
                        "type": "input_image",
                        "detail": "auto",
                        "image_url": image,
                    }));
                }
                if !blocks.is_empty() {
                    items.push(json!({ "role": "user", "content": blocks }));
                }
            }
            Role::Assistant => {
                for part in &message.parts {
                    if let Part::Text { content } = part {
                        items.push(json!({
                            "role": "assistant",
                            "content": [{ "type": "output_text", "text": content }],
                        }));
                    }
                    // Thoughts are not replayed: the Responses API
                    // reconstructs reasoning context server-side.
                }
            }
        }
    }

    Value::Array(items)
}

fn inline_images(message: &Message) -> Vec<String> {
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

fn record_responses_usage(usage: &mut TokenCounter, value: &Value) {
    usage.record(
        value.get("input_tokens").and_then(Value::as_u64),
        value.get("output_tokens").and_then(Value::as_u64),
    );
}
