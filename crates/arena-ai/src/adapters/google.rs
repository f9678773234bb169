use serde_json::{json, Value};
use tracing::info;

use super::{clamp_max_tokens, clamp_temperature, BuiltRequest, ProviderAdapter};
use crate::content::ContentStream;
use crate::error::{flatten_error_detail, ArenaAiError, ArenaAiErrorCode};
use crate::types::{split_data_uri, Feature, Message, Part, Provider, Role};
use crate::usage::TokenCounter;

const MAX_TOKEN_CEILINGS: &[(&str, u32)] = &[("gemini-3", 65_536), ("gemini-2.5", 65_536)];
const DEFAULT_MAX_TOKEN_CEILING: u32 = 8_192;
const TEMPERATURE_CEILING: f64 = 2.0;

const THINKING_MODEL_MARKERS: &[&str] = &["gemini-2.5", "gemini-3"];
const IMAGE_MODEL_MARKERS: &[&str] = &["-image", "imagen"];

/// Generative-content backend: model name in the URL path, API key in the
/// query string, camelCase payloads, and the only backend here that generates
/// images.
pub(super) struct GoogleGenerativeAdapter {
    base_url: String,
}

impl GoogleGenerativeAdapter {
    pub(super) fn new(base_url: String) -> Self {
        Self { base_url }
    }
}

impl ProviderAdapter for GoogleGenerativeAdapter {
    fn provider(&self) -> Provider {
        Provider::Google
    }

    fn supports(&self, feature: Feature, model: &str) -> bool {
        match feature {
            Feature::Thinking => THINKING_MODEL_MARKERS
                .iter()
                .any(|marker| model.contains(marker)),
            // Pro models always think; only flash exposes the toggle.
            Feature::ThinkingToggle => {
                self.supports(Feature::Thinking, model) && model.contains("flash")
            }
            Feature::WebSearch => model.starts_with("gemini"),
            Feature::Image => IMAGE_MODEL_MARKERS
                .iter()
                .any(|marker| model.contains(marker)),
            Feature::Reasoning => false,
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
        let image_mode = self.supports(Feature::Image, model);
        let method = if stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let stream_flag = if stream { "alt=sse&" } else { "" };
        let url = format!(
            "{}/models/{model}:{method}?{stream_flag}key={api_key}",
            self.base_url.trim_end_matches('/'),
        );

        let mut generation_config = json!({
            "maxOutputTokens": clamp_max_tokens(
                model,
                config.max_tokens,
                MAX_TOKEN_CEILINGS,
                DEFAULT_MAX_TOKEN_CEILING,
            ),
            "temperature": clamp_temperature(config.temperature, TEMPERATURE_CEILING),
        });

        if image_mode {
            generation_config["responseModalities"] = json!(["TEXT", "IMAGE"]);
            let mut image_config = json!({});
            if let Some(aspect_ratio) = &config.image_aspect_ratio {
                image_config["aspectRatio"] = json!(aspect_ratio);
            }
            if let Some(resolution) = &config.image_resolution {
                image_config["imageSize"] = json!(resolution);
            }
            if image_config.as_object().is_some_and(|map| !map.is_empty()) {
                generation_config["imageConfig"] = image_config;
            }
        } else if self.supports(Feature::Thinking, model) {
            let budget = if config.should_think {
                1024
            } else if self.supports(Feature::ThinkingToggle, model) {
                // Toggled off: flash accepts an explicit zero budget.
                0
            } else {
                1024
            };
            generation_config["thinkingConfig"] = json!({
                "thinkingBudget": budget,
                "includeThoughts": budget > 0,
            });
        }

        let mut payload = json!({
            "contents": convert_contents(messages),
            "generationConfig": generation_config,
        });

        if let Some(system) = super::collect_system_text(messages) {
            payload["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }

        if config.web_search_enabled && !image_mode && self.supports(Feature::WebSearch, model) {
            payload["tools"] = json!([{ "google_search": {} }]);
        }

        info!(
            target: "arena_ai::adapters::google",
            model,
            stream,
            image_mode,
            "built generate-content request"
        );

        Ok(BuiltRequest {
            url,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
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
            .with_provider(Provider::Google));
        }

        if let Some(usage_value) = event
            .get("usageMetadata")
            .or_else(|| event.get("usage_metadata"))
        {
            record_google_usage(usage, usage_value);
        }

        for part in candidate_parts(event) {
            route_part(part, content);
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
            .with_provider(Provider::Google));
        }

        if let Some(usage_value) = body
            .get("usageMetadata")
            .or_else(|| body.get("usage_metadata"))
        {
            record_google_usage(usage, usage_value);
        }

        let parts_in = candidate_parts(body);
        if parts_in.is_empty() {
            return Err(ArenaAiError::new(
                ArenaAiErrorCode::Protocol,
                "generate-content document has no candidate parts",
            )
            .with_provider(Provider::Google)
            .with_details(body.clone()));
        }

        let mut content = ContentStream::new();
        for part in parts_in {
            route_part(part, &mut content);
        }
        Ok(content.into_parts())
    }
}

fn candidate_parts(payload: &Value) -> Vec<&Value> {
    payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| parts.iter().collect())
        .unwrap_or_default()
}

fn route_part(part: &Value, content: &mut ContentStream) {
    if let Some(inline) = part
        .get("inlineData")
        .or_else(|| part.get("inline_data"))
    {
        let mime = inline
            .get("mimeType")
            .or_else(|| inline.get("mime_type"))
            .and_then(Value::as_str)
            .unwrap_or("image/png");
        if let Some(data) = inline.get("data").and_then(Value::as_str) {
            content.push_image(&format!("data:{mime};base64,{data}"));
        }
        return;
    }

    let Some(text) = part.get("text").and_then(Value::as_str) else {
        return;
    };
    if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
        content.push_thought(text);
        if let Some(signature) = part
            .get("thoughtSignature")
            .or_else(|| part.get("thought_signature"))
            .and_then(Value::as_str)
        {
            content.append_thought_signature(signature);
        }
    } else {
        content.push_text(text);
    }
}

fn convert_contents(messages: &[Message]) -> Vec<Value> {
    let mut contents = Vec::new();

    for message in messages {
        let role = match message.role {
            // System turns ride in `systemInstruction`.
            Role::System => continue,
            Role::User => "user",
            Role::Assistant => "model",
        };

        let mut parts = Vec::new();
        match message.role {
            Role::Assistant => {
                for part in &message.parts {
                    match part {
                        Part::Text { content } => parts.push(json!({ "text": content })),
                        Part::Thought {
                            content,
                            thought_signature,
                        } => {
                            let mut value = json!({ "text": content, "thought": true });
                            if let Some(signature) = thought_signature {
                                value["thoughtSignature"] = json!(signature);
                            }
                            parts.push(value);
                        }
                        Part::Image { content } => {
                            if let Some(value) = inline_data_part(content) {
                                parts.push(value);
                            }
                        }
                    }
                }
            }
            _ => {
                let text = message.rendered_text();
                if !text.is_empty() {
                    parts.push(json!({ "text": text }));
                }
                for part in &message.parts {
                    if let Part::Image { content } = part {
                        if let Some(value) = inline_data_part(content) {
                            parts.push(value);
                        }
                    }
                }
                if let Some(legacy) = &message.images {
                    for image in legacy {
                        if let Some(value) = inline_data_part(image) {
                            parts.push(value);
                        }
                    }
                }
            }
        }

        if !parts.is_empty() {
            contents.push(json!({ "role": role, "parts": parts }));
        }
    }

    contents
}

fn inline_data_part(data_uri: &str) -> Option<Value> {
    let (mime, payload) = split_data_uri(data_uri)?;
    Some(json!({
        "inlineData": { "mimeType": mime, "data": payload },
    }))
}

fn record_google_usage(usage: &mut TokenCounter, value: &Value) {
    let input = value
        .get("promptTokenCount")
        .or_else(|| value.get("prompt_token_count"))
        .and_then(Value::as_u64);
    let output_candidates = value
        .get("candidatesTokenCount")
        .or_else(|| value.get("candidates_token_count"))
        .and_then(Value::as_u64);
    let output_thoughts = value
        .get("thoughtsTokenCount")
        .or_else(|| value.get("thoughts_token_count"))
        .and_then(Value::as_u64);

    let output = match (output_candidates, output_thoughts) {
        (None, None) => None,
        (candidates, thoughts) => Some(candidates.unwrap_or(0) + thoughts.unwrap_or(0)),
    };
    usage.record(input, output);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RequestConfig;
    use crate::usage::UsageMode;
    use serde_json::json;

    fn adapter() -> GoogleGenerativeAdapter {
        GoogleGenerativeAdapter::new(
            "https://generativelanguage.googleapis.com/v1beta".to_string(),
        )
    }

    #[test]
    fn streaming_url_selects_sse_method_and_query_key() {
        let request = adapter()
            .build_request(
                "gemini-3-flash",
                &[Message::user("hi")],
                true,
                &RequestConfig::default(),
                "g-key",
            )
            .expect("build request");
        assert!(request
            .url
            .ends_with("/models/gemini-3-flash:streamGenerateContent?alt=sse&key=g-key"));
    }

    #[test]
    fn non_streaming_url_uses_generate_content() {
        let request = adapter()
            .build_request(
                "gemini-3-flash",
                &[Message::user("hi")],
                false,
                &RequestConfig::default(),
                "g-key",
            )
            .expect("build request");
        assert!(request
            .url
            .ends_with("/models/gemini-3-flash:generateContent?key=g-key"));
    }

    #[test]
    fn thinking_toggle_zeroes_the_budget_when_off() {
        let config = RequestConfig {
            should_think: false,
            ..RequestConfig::default()
        };
        let request = adapter()
            .build_request(
                "gemini-2.5-flash",
                &[Message::user("hi")],
                true,
                &config,
                "g-key",
            )
            .expect("build request");
        let thinking = &request.body["generationConfig"]["thinkingConfig"];
        assert_eq!(thinking["thinkingBudget"], 0);
        assert_eq!(thinking["includeThoughts"], false);
    }

    #[test]
    fn image_models_request_image_modality_and_never_stream_tools() {
        let config = RequestConfig {
            web_search_enabled: true,
            image_aspect_ratio: Some("16:9".to_string()),
            image_resolution: Some("2K".to_string()),
            ..RequestConfig::default()
        };
        let request = adapter()
            .build_request(
                "gemini-2.5-flash-image",
                &[Message::user("a cat")],
                false,
                &config,
                "g-key",
            )
            .expect("build request");
        let generation = &request.body["generationConfig"];
        assert_eq!(generation["responseModalities"], json!(["TEXT", "IMAGE"]));
        assert_eq!(generation["imageConfig"]["aspectRatio"], "16:9");
        assert_eq!(generation["imageConfig"]["imageSize"], "2K");
        assert!(request.body.get("tools").is_none());
    }

    #[test]
    fn thought_parts_route_to_thought_segments_with_signature() {
        let mut adapter = adapter();
        let mut usage = TokenCounter::new(UsageMode::Cumulative);
        let mut content = ContentStream::new();

        adapter
            .on_stream_event(
                &json!({
                    "candidates": [{"content": {"parts": [
                        {"text": "plan", "thought": true, "thoughtSignature": "tok"},
                        {"text": "Hello"},
                    ]}}],
                    "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 3, "thoughtsTokenCount": 2},
                }),
                &mut usage,
                &mut content,
            )
            .expect("stream event");

        assert_eq!((usage.input, usage.output), (5, 5));
        assert_eq!(
            content.into_parts(),
            vec![
                Part::Thought {
                    content: "plan".to_string(),
                    thought_signature: Some("tok".to_string()),
                },
                Part::text("Hello"),
            ]
        );
    }

    #[test]
    fn inline_image_data_becomes_an_image_part() {
        let adapter = adapter();
        let mut usage = TokenCounter::new(UsageMode::Cumulative);
        let body = json!({
            "candidates": [{"content": {"parts": [
                {"inlineData": {"mimeType": "image/png", "data": "QUJD"}},
            ]}}],
        });
        let parts = adapter.on_response(&body, &mut usage).expect("parts");
        assert_eq!(
            parts,
            vec![Part::Image {
                content: "data:image/png;base64,QUJD".to_string(),
            }]
        );
    }

    #[test]
    fn error_payloads_raise_with_flattened_detail() {
        let mut adapter = adapter();
        let mut usage = TokenCounter::new(UsageMode::Cumulative);
        let mut content = ContentStream::new();
        let error = adapter
            .on_stream_event(
                &json!({"error": {"message": "API key not valid"}}),
                &mut usage,
                &mut content,
            )
            .expect_err("error payload");
        assert_eq!(error.code, ArenaAiErrorCode::Protocol);
        assert!(error.message.contains("API key not valid"));
    }

    #[test]
    fn assistant_thoughts_echo_their_signature_back() {
        let messages = vec![
            Message::user("hi"),
            Message::assistant(vec![Part::Thought {
                content: "prior plan".to_string(),
                thought_signature: Some("sig-1".to_string()),
            }]),
        ];
        let request = adapter()
            .build_request(
                "gemini-3-pro",
                &messages,
                true,
                &RequestConfig::default(),
                "g-key",
            )
            .expect("build request");
        let model_parts = request.body["contents"][1]["parts"]
            .as_array()
            .expect("parts");
        assert_eq!(model_parts[0]["thought"], true);
        assert_eq!(model_parts[0]["thoughtSignature"], "sig-1");
    }
}
