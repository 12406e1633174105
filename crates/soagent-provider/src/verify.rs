//! Credential check: one minimal completion request against the configured
//! endpoint, reporting reachability rather than model output.

use std::time::Duration;

use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::instrument;

use soagent_core::provider::{AuthMode, ProviderEnv};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";
const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[instrument(skip(env))]
pub async fn verify_provider(env: &ProviderEnv, model: Option<&str>) -> VerifyOutcome {
    let (url, headers, body) = request_parts(env, model);

    let client = match reqwest::Client::builder().timeout(VERIFY_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            return VerifyOutcome { ok: false, status: None, error: Some(e.to_string()) };
        }
    };

    let mut request = client.post(&url).json(&body);
    for (name, value) in &headers {
        request = request.header(*name, value);
    }

    match request.send().await {
        Ok(response) => {
            let status = response.status();
            if status.is_success() {
                VerifyOutcome { ok: true, status: Some(status.as_u16()), error: None }
            } else {
                let detail = response.text().await.unwrap_or_default();
                VerifyOutcome {
                    ok: false,
                    status: Some(status.as_u16()),
                    error: Some(truncate(&detail, 500)),
                }
            }
        }
        Err(e) => VerifyOutcome { ok: false, status: None, error: Some(e.to_string()) },
    }
}

/// URL, auth headers, and minimal body for the probe request.
fn request_parts(
    env: &ProviderEnv,
    model: Option<&str>,
) -> (String, Vec<(&'static str, String)>, Value) {
    let base = env
        .base_url
        .as_deref()
        .unwrap_or(DEFAULT_BASE_URL)
        .trim_end_matches('/');
    let url = format!("{base}/v1/messages");

    let mut headers = vec![("anthropic-version", ANTHROPIC_VERSION.to_string())];
    if let Some(key) = &env.api_key {
        let key = key.expose_secret().to_string();
        match env.auth_mode {
            AuthMode::ApiKey => headers.push(("x-api-key", key)),
            AuthMode::AuthToken | AuthMode::AuthTokenClearApiKey => {
                headers.push(("authorization", format!("Bearer {key}")));
            }
            AuthMode::Both => {
                headers.push(("x-api-key", key.clone()));
                headers.push(("authorization", format!("Bearer {key}")));
            }
        }
    }

    let body = json!({
        "model": model.unwrap_or(DEFAULT_MODEL),
        "max_tokens": 1,
        "messages": [{ "role": "user", "content": "ping" }],
    });

    (url, headers, body)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}
