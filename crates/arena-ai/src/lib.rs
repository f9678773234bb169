//! Provider-agnostic LLM chat core: one conversation shape compiled to eight
//! heterogeneous wire formats, and their streams normalized back into one
//! typed content sequence.

mod adapters;
mod content;
mod error;
mod local;
mod orchestrator;
mod registry;
mod sse;
mod throttle;
mod transcribe;
mod types;
mod usage;

pub use adapters::{
    adapter_for, register_adapter, register_builtin_adapters, AdapterFactory, BuiltRequest,
    CompatBackend, ProviderAdapter,
};
pub use content::{ContentConsumer, ContentStream, Segment, SegmentKind};
pub use error::{flatten_error_detail, ArenaAiError, ArenaAiErrorCode};
pub use local::{
    cached_local_port, discover_local_endpoint, local_base_url, LocalEndpoint,
    PRIMARY_LOCAL_PORT, SECONDARY_LOCAL_PORT,
};
pub use orchestrator::{CallResult, Orchestrator};
pub use registry::{ApiKeyMap, ModelRegistry, LOCAL_MODEL_SENTINEL};
pub use sse::SseParser;
pub use throttle::ThrottledConsumer;
pub use transcribe::{transcribe, TranscriptionRequest};
pub use types::{
    split_data_uri, AttachedFile, Feature, Message, Part, Provider, ReasoningEffort,
    RequestConfig, Role,
};
pub use usage::{TokenCounter, UsageMode};
