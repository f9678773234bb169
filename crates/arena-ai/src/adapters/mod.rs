use std::collections::HashMap;
use std::sync::{Arc, Once, OnceLock, RwLock};

use serde_json::Value;

use crate::content::ContentStream;
use crate::error::ArenaAiError;
use crate::types::{Feature, Message, Provider, RequestConfig};
use crate::usage::{TokenCounter, UsageMode};

mod anthropic;
mod compat;
mod google;
mod openai;

pub use compat::CompatBackend;

/// One fully prepared outbound request. Method is always POST; streaming is a
/// body/query concern the adapter already encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

/// The per-provider protocol implementation. One instance serves exactly one
/// call: request construction first, then either the stream-event path or the
/// single-document path, never both.
pub trait ProviderAdapter: Send {
    fn provider(&self) -> Provider;

    /// Reporting style of this backend's usage frames.
    fn usage_mode(&self) -> UsageMode {
        UsageMode::Cumulative
    }

    /// Pure capability predicate over the model identifier. Usable both for
    /// gating request construction and for gating UI affordances upstream.
    fn supports(&self, feature: Feature, model: &str) -> bool;

    fn build_request(
        &self,
        model: &str,
        messages: &[Message],
        stream: bool,
        config: &RequestConfig,
        api_key: &str,
    ) -> Result<BuiltRequest, ArenaAiError>;

    /// Handles one parsed stream frame. Unrecognized shapes are ignored;
    /// provider in-band error frames raise.
    fn on_stream_event(
        &mut self,
        event: &Value,
        usage: &mut TokenCounter,
        content: &mut ContentStream,
    ) -> Result<(), ArenaAiError>;

    /// Runs after the last stream frame, before the stream is finished.
    fn on_stream_end(
        &mut self,
        usage: &mut TokenCounter,
        content: &mut ContentStream,
    ) -> Result<(), ArenaAiError> {
        let _ = (usage, content);
        Ok(())
    }

    /// Non-streaming counterpart of the event path: one complete JSON
    /// document in, the assembled content-part array out.
    fn on_response(
        &self,
        body: &Value,
        usage: &mut TokenCounter,
    ) -> Result<Vec<crate::types::Part>, ArenaAiError>;
}

pub type AdapterFactory = Arc<dyn Fn(String) -> Box<dyn ProviderAdapter> + Send + Sync>;

fn adapter_registry() -> &'static RwLock<HashMap<Provider, AdapterFactory>> {
    static REGISTRY: OnceLock<RwLock<HashMap<Provider, AdapterFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

pub fn register_adapter(provider: Provider, factory: AdapterFactory) {
    let mut registry = adapter_registry()
        .write()
        .expect("adapter registry lock poisoned");
    registry.insert(provider, factory);
}

/// Creates a fresh adapter for one call against the given base URL. Fresh
/// because stream handling is per-call state; nothing is shared between two
/// concurrent calls.
pub fn adapter_for(provider: Provider, base_url: &str) -> Option<Box<dyn ProviderAdapter>> {
    ensure_builtin_adapters_registered();
    let factory = {
        let registry = adapter_registry()
            .read()
            .expect("adapter registry lock poisoned");
        registry.get(&provider).cloned()
    };
    factory.map(|factory| factory(base_url.to_string()))
}

pub fn register_builtin_adapters() {
    register_adapter(
        Provider::OpenAi,
        Arc::new(|base_url| {
            Box::new(openai::OpenAiResponsesAdapter::new(base_url)) as Box<dyn ProviderAdapter>
        }),
    );
    register_adapter(
        Provider::Anthropic,
        Arc::new(|base_url| {
            Box::new(anthropic::AnthropicMessagesAdapter::new(base_url)) as Box<dyn ProviderAdapter>
        }),
    );
    register_adapter(
        Provider::Google,
        Arc::new(|base_url| {
            Box::new(google::GoogleGenerativeAdapter::new(base_url)) as Box<dyn ProviderAdapter>
        }),
    );
    for backend in compat::BACKENDS {
        register_adapter(
            backend.provider,
            Arc::new(move |base_url| {
                Box::new(compat::OpenAiCompatAdapter::new(backend, base_url))
                    as Box<dyn ProviderAdapter>
            }),
        );
    }
}

pub(crate) fn ensure_builtin_adapters_registered() {
    static ONCE: Once = Once::new();
    ONCE.call_once(register_builtin_adapters);
}

/// Clamp helper shared by every adapter: per-model ceilings are looked up by
/// substring match, first hit wins, and the request value is reduced to the
/// ceiling, never rejected.
pub(crate) fn clamp_max_tokens(
    model: &str,
    requested: u32,
    ceilings: &[(&str, u32)],
    default_ceiling: u32,
) -> u32 {
    let ceiling = ceilings
        .iter()
        .find(|(pattern, _)| model.contains(pattern))
        .map(|(_, ceiling)| *ceiling)
        .unwrap_or(default_ceiling);
    requested.min(ceiling)
}

pub(crate) fn clamp_temperature(requested: f64, ceiling: f64) -> f64 {
    requested.min(ceiling)
}

pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    if base_url.ends_with('/') {
        format!("{base_url}{path}")
    } else {
        format!("{base_url}/{path}")
    }
}

/// Every system-role turn, concatenated. Providers take this either as a
/// dedicated field or as instructions; none of them accept system turns
/// inline mid-history.
pub(crate) fn collect_system_text(messages: &[Message]) -> Option<String> {
    let system = messages
        .iter()
        .filter(|message| message.role == crate::types::Role::System)
        .map(Message::rendered_text)
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    if system.is_empty() { None } else { Some(system) }
}
