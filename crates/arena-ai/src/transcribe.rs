use reqwest::multipart::{Form, Part as FormPart};
use serde_json::Value;
use tracing::info;

use crate::error::{flatten_error_detail, ArenaAiError, ArenaAiErrorCode};
use crate::registry::{ApiKeyMap, ModelRegistry};
use crate::types::Provider;

/// Backends with an audio endpoint. Everything else rejects before I/O.
const AUDIO_PROVIDERS: &[Provider] = &[Provider::OpenAi, Provider::Mistral];

#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub model: String,
    pub file_name: String,
    pub data: Vec<u8>,
    pub language: Option<String>,
}

/// Multipart `audio/transcriptions` call. Same key handling and failure shape
/// as chat calls.
pub async fn transcribe(
    provider: Provider,
    request: TranscriptionRequest,
    keys: &ApiKeyMap,
    models: &ModelRegistry,
) -> Result<String, ArenaAiError> {
    if !AUDIO_PROVIDERS.contains(&provider) {
        return Err(ArenaAiError::new(
            ArenaAiErrorCode::UnknownProvider,
            format!("provider '{provider}' has no transcription endpoint"),
        )
        .with_provider(provider));
    }

    let api_key = keys.get(provider).ok_or_else(|| {
        ArenaAiError::new(
            ArenaAiErrorCode::MissingApiKey,
            format!("No API key configured for provider '{provider}'"),
        )
        .with_provider(provider)
    })?;

    let url = format!(
        "{}/audio/transcriptions",
        models.base_url(provider).trim_end_matches('/')
    );

    let mut form = Form::new()
        .text("model", request.model.clone())
        .part(
            "file",
            FormPart::bytes(request.data).file_name(request.file_name),
        );
    if let Some(language) = request.language {
        form = form.text("language", language);
    }

    info!(
        target: "arena_ai::transcribe",
        provider = %provider,
        model = %request.model,
        "dispatching transcription"
    );

    let response = reqwest::Client::new()
        .post(&url)
        .header("Authorization", format!("Bearer {api_key}"))
        .multipart(form)
        .send()
        .await
        .map_err(|error| {
            ArenaAiError::new(
                ArenaAiErrorCode::Transport,
                format!("transport failed: {error}"),
            )
            .with_provider(provider)
            .with_model(request.model.clone())
        })?;

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
        .with_status(status)
        .with_provider(provider)
        .with_model(request.model));
    }

    let payload: Value = response.json().await.map_err(|error| {
        ArenaAiError::new(
            ArenaAiErrorCode::Protocol,
            format!("invalid transcription JSON: {error}"),
        )
        .with_provider(provider)
    })?;

    payload
        .get("text")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            ArenaAiError::new(
                ArenaAiErrorCode::Protocol,
                "transcription document missing `text`",
            )
            .with_provider(provider)
            .with_details(payload)
        })
}
