use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use crate::registry::LOCAL_MODEL_SENTINEL;

/// llama.cpp server default.
pub const PRIMARY_LOCAL_PORT: u16 = 8080;
/// LM Studio default.
pub const SECONDARY_LOCAL_PORT: u16 = 1234;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

// Last port that answered a models probe; 0 means no probe has succeeded
// yet. Process-wide on purpose: sequential calls reuse the same server.
static LAST_GOOD_PORT: AtomicU16 = AtomicU16::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEndpoint {
    pub base_url: String,
    pub model_id: String,
}

pub fn local_base_url(port: u16) -> String {
    format!("http://localhost:{port}/v1")
}

/// The port the local adapter should target right now: the last port that
/// answered a probe, or the primary default before any probe has succeeded.
pub fn cached_local_port() -> u16 {
    match LAST_GOOD_PORT.load(Ordering::Relaxed) {
        0 => PRIMARY_LOCAL_PORT,
        port => port,
    }
}

#[cfg(test)]
pub(crate) fn reset_local_port_cache() {
    LAST_GOOD_PORT.store(0, Ordering::Relaxed);
}

/// Probes the well-known local ports in sequence, last-successful first, and
/// returns the first endpoint with a valid models list. Both probes failing is
/// not an error: the call proceeds against the default port with a sentinel
/// model id and the server reports its own failure if it is truly absent.
pub async fn discover_local_endpoint(
    client: &reqwest::Client,
    model_override: Option<&str>,
) -> LocalEndpoint {
    for port in probe_order() {
        if let Some(model_id) = probe_models(client, port).await {
            LAST_GOOD_PORT.store(port, Ordering::Relaxed);
            info!(target: "arena_ai::local", port, model = %model_id, "local model server found");
            return LocalEndpoint {
                base_url: local_base_url(port),
                model_id: model_override.map(str::to_string).unwrap_or(model_id),
            };
        }
    }

    debug!(target: "arena_ai::local", "no local server answered, using sentinel model");
    LocalEndpoint {
        base_url: local_base_url(cached_local_port()),
        model_id: model_override
            .map(str::to_string)
            .unwrap_or_else(|| LOCAL_MODEL_SENTINEL.to_string()),
    }
}

fn probe_order() -> [u16; 2] {
    match LAST_GOOD_PORT.load(Ordering::Relaxed) {
        0 | PRIMARY_LOCAL_PORT => [PRIMARY_LOCAL_PORT, SECONDARY_LOCAL_PORT],
        port => [port, PRIMARY_LOCAL_PORT],
    }
}

async fn probe_models(client: &reqwest::Client, port: u16) -> Option<String> {
    let url = format!("{}/models", local_base_url(port));
    let response = client
        .get(&url)
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
        .ok()?;
    if !response.status().is_success() {
        return None;
    }

    let body: Value = response.json().await.ok()?;
    let first_model = body
        .get("data")?
        .as_array()?
        .first()?
        .get("id")?
        .as_str()?;
    Some(first_model.to_string())
}
