use std::sync::OnceLock;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::adapters::{adapter_for, ProviderAdapter};
use crate::content::{ContentConsumer, ContentStream};
use crate::error::{flatten_error_detail, ArenaAiError, ArenaAiErrorCode};
use crate::local::discover_local_endpoint;
use crate::registry::{ApiKeyMap, ModelRegistry};
use crate::sse::SseParser;
use crate::types::{Feature, Message, Part, Provider, RequestConfig};
use crate::usage::TokenCounter;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Thinking and image calls legitimately sit quiet for a long time before
/// the first byte.
const EXTENDED_TIMEOUT: Duration = Duration::from_secs(120);

const IMAGE_MODEL_MARKERS: &[&str] = &["-image", "imagen"];

#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub parts: Vec<Part>,
    pub usage: TokenCounter,
    pub provider: Provider,
    pub model: String,
}

/// Resolves the adapter for a model, builds and executes the outbound
/// request, and drives the response back through the adapter. One `call` is
/// fully self-contained: counter, stream, adapter and cancellation child all
/// live exactly as long as the call.
pub struct Orchestrator {
    keys: ApiKeyMap,
    models: ModelRegistry,
}

impl Orchestrator {
    pub fn new(keys: ApiKeyMap, models: ModelRegistry) -> Self {
        Self { keys, models }
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    pub fn models_mut(&mut self) -> &mut ModelRegistry {
        &mut self.models
    }

    pub async fn call(
        &self,
        model_id: &str,
        messages: &[Message],
        config: &RequestConfig,
        consumer: Option<Box<dyn ContentConsumer>>,
        cancel: Option<CancellationToken>,
    ) -> Result<CallResult, ArenaAiError> {
        let provider = self.models.provider_for_model(model_id);
        let image_mode = is_image_model(model_id);

        let api_key = if provider == Provider::LlamaCpp {
            String::new()
        } else {
            self.keys.get(provider).ok_or_else(|| {
                ArenaAiError::new(
                    ArenaAiErrorCode::MissingApiKey,
                    format!("No API key configured for provider '{provider}'"),
                )
                .with_provider(provider)
                .with_model(model_id)
            })?
        };

        let (base_url, effective_model) = if provider == Provider::LlamaCpp {
            let endpoint = discover_local_endpoint(
                shared_http_client("http://localhost/"),
                config.local_model_override.as_deref(),
            )
            .await;
            (endpoint.base_url, endpoint.model_id)
        } else {
            (
                self.models.base_url(provider).to_string(),
                model_id.to_string(),
            )
        };

        let mut adapter = adapter_for(provider, &base_url).ok_or_else(|| {
            ArenaAiError::new(
                ArenaAiErrorCode::UnknownProvider,
                format!("No adapter registered for provider '{provider}'"),
            )
            .with_provider(provider)
            .with_model(model_id)
        })?;

        // Image generation is always a single document, even when the caller
        // asked for a stream.
        let stream = consumer.is_some() && !image_mode;
        let mut counter = TokenCounter::new(adapter.usage_mode());
        let mut content = match consumer {
            Some(consumer) => ContentStream::with_consumer(consumer),
            None => ContentStream::new(),
        };

        let thinking_phase = adapter.supports(Feature::Reasoning, &effective_model)
            || (config.should_think && adapter.supports(Feature::Thinking, &effective_model));
        let timeout = if image_mode || thinking_phase {
            EXTENDED_TIMEOUT
        } else {
            DEFAULT_TIMEOUT
        };

        let cancel = cancel.unwrap_or_default();

        info!(
            target: "arena_ai::orchestrator",
            provider = %provider,
            model = %effective_model,
            stream,
            image_mode,
            timeout_secs = timeout.as_secs(),
            "dispatching call"
        );

        let outcome = execute(
            adapter.as_mut(),
            &effective_model,
            messages,
            stream,
            config,
            &api_key,
            timeout,
            &cancel,
            &mut counter,
            &mut content,
        )
        .await;

        match outcome {
            Ok(()) => {
                content.notify_usage(&counter);
                content.finish();
                Ok(CallResult {
                    parts: content.into_parts(),
                    usage: counter,
                    provider,
                    model: effective_model,
                })
            }
            Err(error) => {
                // Release the consumer even on failure: a throttled drain
                // must still run its finalize.
                content.finish();
                Err(tag_error(error, provider, model_id))
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn execute(
    adapter: &mut dyn ProviderAdapter,
    model: &str,
    messages: &[Message],
    stream: bool,
    config: &RequestConfig,
    api_key: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    counter: &mut TokenCounter,
    content: &mut ContentStream,
) -> Result<(), ArenaAiError> {
    let request = adapter.build_request(model, messages, stream, config, api_key)?;
    let client = shared_http_client(&request.url);

    let mut http = client.post(&request.url);
    for (name, value) in &request.headers {
        http = http.header(name, value);
    }

    // One watchdog covers the whole call, connect through last byte.
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let send = http.json(&request.body).send();
    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(aborted()),
        _ = &mut deadline => return Err(timed_out(timeout)),
        result = send => result.map_err(|error| {
            ArenaAiError::new(
                ArenaAiErrorCode::Transport,
                format!("transport failed: {error}"),
            )
        })?,
    };

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unable to read error body".to_string());
        let detail = serde_json::from_str::<Value>(&body)
            .map(|payload| flatten_error_detail(&payload))
            .unwrap_or(body);
        return Err(ArenaAiError::new(
            ArenaAiErrorCode::Http,
            format!("HTTP {status}: {detail}"),
        )
        .with_status(status));
    }

    if stream {
        let mut parser = SseParser::new();
        let mut chunks = Utf8Chunks::default();
        let mut bytes = response.bytes_stream();

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(aborted()),
                _ = &mut deadline => return Err(timed_out(timeout)),
                next = bytes.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|error| {
                ArenaAiError::new(
                    ArenaAiErrorCode::Transport,
                    format!("stream read failed: {error}"),
                )
            })?;

            let text = chunks.push(&chunk);
            for event in parser.feed(&text) {
                adapter.on_stream_event(&event, counter, content)?;
            }
        }

        for event in parser.finish() {
            adapter.on_stream_event(&event, counter, content)?;
        }
        adapter.on_stream_end(counter, content)?;
    } else {
        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(aborted()),
            _ = &mut deadline => return Err(timed_out(timeout)),
            body = response.text() => body.map_err(|error| {
                ArenaAiError::new(
                    ArenaAiErrorCode::Transport,
                    format!("response read failed: {error}"),
                )
            })?,
        };
        let payload: Value = serde_json::from_str(&body).map_err(|error| {
            ArenaAiError::new(
                ArenaAiErrorCode::Protocol,
                format!("invalid response JSON: {error}"),
            )
        })?;

        let parts = adapter.on_response(&payload, counter)?;
        replay_parts(&parts, content);
    }

    Ok(())
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(ApiKeyMap::new(), ModelRegistry::builtin())
    }
}

pub(crate) fn is_image_model(model: &str) -> bool {
    IMAGE_MODEL_MARKERS
        .iter()
        .any(|marker| model.contains(marker))
}

fn aborted() -> ArenaAiError {
    ArenaAiError::new(ArenaAiErrorCode::Aborted, "call aborted by caller")
}

fn timed_out(timeout: Duration) -> ArenaAiError {
    ArenaAiError::new(
        ArenaAiErrorCode::TimedOut,
        format!("call exceeded the {}s watchdog", timeout.as_secs()),
    )
}

fn tag_error(mut error: ArenaAiError, provider: Provider, model: &str) -> ArenaAiError {
    if error.provider.is_none() {
        error.provider = Some(provider);
    }
    if error.model.is_none() {
        error.model = Some(model.to_string());
    }
    error
}

/// Replays a finished content-part array through the stream so an attached
/// consumer observes non-streaming results the same way it observes live
/// ones.
fn replay_parts(parts: &[Part], content: &mut ContentStream) {
    for part in parts {
        match part {
            Part::Text { content: text } => content.push_text(text),
            Part::Thought {
                content: thought,
                thought_signature,
            } => {
                content.push_thought(thought);
                if let Some(signature) = thought_signature {
                    content.append_thought_signature(signature);
                }
            }
            Part::Image { content: image } => content.push_image(image),
        }
    }
}

/// Accumulates raw bytes and hands back the longest valid UTF-8 prefix, so a
/// multi-byte character split across two network chunks survives intact.
#[derive(Default)]
struct Utf8Chunks {
    pending: Vec<u8>,
}

impl Utf8Chunks {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let valid_len = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(error) => error.valid_up_to(),
        };
        let rest = self.pending.split_off(valid_len);
        let complete = std::mem::replace(&mut self.pending, rest);
        String::from_utf8(complete).unwrap_or_default()
    }
}

/// Process-wide clients: one default, one no-proxy for loopback targets so a
/// configured system proxy never swallows local-server calls.
fn shared_http_client(url: &str) -> &'static Client {
    static DEFAULT_CLIENT: OnceLock<Client> = OnceLock::new();
    static LOOPBACK_CLIENT: OnceLock<Client> = OnceLock::new();

    if is_loopback_url(url) {
        LOOPBACK_CLIENT.get_or_init(|| {
            Client::builder()
                .no_proxy()
                .build()
                .unwrap_or_else(|_| Client::new())
        })
    } else {
        DEFAULT_CLIENT.get_or_init(Client::new)
    }
}

fn is_loopback_url(url: &str) -> bool {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    host.eq_ignore_ascii_case("localhost") || host == "127.0.0.1" || host == "::1"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_models_are_recognized_by_name() {
        assert!(is_image_model("gemini-2.5-flash-image"));
        assert!(is_image_model("imagen-4"));
        assert!(!is_image_model("gemini-3-pro"));
        assert!(!is_image_model("gpt-5.2"));
    }

    #[test]
    fn utf8_chunks_reassemble_split_characters() {
        let mut chunks = Utf8Chunks::default();
        let encoded = "héllo".as_bytes();
        // Split inside the two-byte é.
        let first = chunks.push(&encoded[..2]);
        let second = chunks.push(&encoded[2..]);
        assert_eq!(format!("{first}{second}"), "héllo");
    }

    #[test]
    fn loopback_urls_are_detected() {
        assert!(is_loopback_url("http://localhost:8080/v1/models"));
        assert!(is_loopback_url("http://127.0.0.1:1234/v1"));
        assert!(!is_loopback_url("https://api.openai.com/v1"));
    }

    #[tokio::test]
    async fn missing_key_fails_before_any_network_io() {
        let orchestrator = Orchestrator::new(ApiKeyMap::new(), ModelRegistry::builtin());
        let error = orchestrator
            .call(
                "grok-4",
                &[Message::user("hi")],
                &RequestConfig::default(),
                None,
                None,
            )
            .await
            .expect_err("missing key");
        assert_eq!(error.code, ArenaAiErrorCode::MissingApiKey);
        assert_eq!(error.provider, Some(Provider::Grok));
    }
}
