//! Webhook server.
//!
//! Receives pull-request and label events, verifies the HMAC-SHA256
//! signature with a constant-time comparison before any parsing, and posts
//! the informational or stage-two comments. The body size is bounded to
//! keep oversized payloads from consuming memory.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use conveyor_core::forge::ForgeClient;
use conveyor_core::gating::promotion_comment;

use crate::config_provider::{ConfigDataProvider, ConfigWatcher};
use crate::reconciler::PULL_REQUEST_INFO_COMMENT;

/// Header carrying the HMAC-SHA256 signature.
const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Header carrying the event type.
const EVENT_HEADER: &str = "x-github-event";

/// Maximum accepted payload size.
const MAX_BODY_SIZE: usize = 100 * 1024;

/// The label that triggers the lgtm flow.
const LGTM_LABEL: &str = "lgtm";

/// Shared state for the webhook handlers.
pub struct WebhookState {
    /// Webhook HMAC secret.
    pub secret: SecretString,
    /// Forge client for posting comments.
    pub forge: Arc<dyn ForgeClient>,
    /// Presubmit sets per repository.
    pub provider: Arc<ConfigDataProvider>,
    /// Enabled repositories for the pull-request flow.
    pub watcher: Arc<ConfigWatcher>,
    /// Enabled repositories for the lgtm flow.
    pub lgtm_watcher: Arc<ConfigWatcher>,
}

/// Builds the webhook router.
pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/hooks", post(handle_webhook))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct RepositoryOwner {
    login: String,
}

#[derive(Debug, Deserialize)]
struct Repository {
    name: String,
    owner: RepositoryOwner,
}

#[derive(Debug, Deserialize)]
struct EventPullRequest {
    number: u64,
    #[serde(default)]
    head: Option<PullRequestHead>,
}

#[derive(Debug, Deserialize)]
struct PullRequestHead {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct EventLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct PullRequestEvent {
    action: String,
    repository: Repository,
    pull_request: EventPullRequest,
    #[serde(default)]
    label: Option<EventLabel>,
}

async fn handle_webhook(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    // Signature first; nothing is parsed from an unauthenticated payload.
    let Some(signature) = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) else {
        return StatusCode::UNAUTHORIZED;
    };
    if !verify_signature(&state.secret, &body, signature) {
        tracing::warn!("webhook signature verification failed");
        return StatusCode::UNAUTHORIZED;
    }

    let event_type = headers
        .get(EVENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if event_type != "pull_request" {
        return StatusCode::NO_CONTENT;
    }

    let event: PullRequestEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(error = %err, "could not parse pull request event");
            return StatusCode::BAD_REQUEST;
        }
    };

    match event.action.as_str() {
        "opened" => handle_pull_request_creation(&state, &event).await,
        "labeled" => handle_label_addition(&state, &event).await,
        _ => {}
    }
    StatusCode::NO_CONTENT
}

/// Verifies the `sha256=<hex>` signature with a constant-time comparison.
fn verify_signature(secret: &SecretString, body: &[u8], signature: &str) -> bool {
    let Some(hex_digest) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Some(provided) = decode_hex(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.expose_secret().as_bytes()) else {
        return false;
    };
    mac.update(body);
    let expected = mac.finalize().into_bytes();
    expected.ct_eq(provided.as_slice()).into()
}

fn decode_hex(value: &str) -> Option<Vec<u8>> {
    if value.len() % 2 != 0 {
        return None;
    }
    (0..value.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&value[i..i + 2], 16).ok())
        .collect()
}

/// Posts the informational comment when a pull request opens in an enabled
/// repository with gating-relevant presubmits.
async fn handle_pull_request_creation(state: &WebhookState, event: &PullRequestEvent) {
    let org = &event.repository.owner.login;
    let repo = &event.repository.name;
    let number = event.pull_request.number;

    let presubmits = state.provider.get_presubmits(&format!("{org}/{repo}"));
    if presubmits.is_empty() {
        return;
    }
    if state.watcher.get().repo_mode(org, repo).is_none() {
        return;
    }

    if let Err(err) = state
        .forge
        .create_comment(org, repo, number, PULL_REQUEST_INFO_COMMENT)
        .await
    {
        tracing::error!(org, repo, pr = number, error = %err, "failed to create comment");
    }
}

/// Triggers the second stage when the lgtm label lands on a pull request in
/// an lgtm-enabled repository.
async fn handle_label_addition(state: &WebhookState, event: &PullRequestEvent) {
    let Some(label) = &event.label else { return };
    if label.name != LGTM_LABEL {
        return;
    }
    let org = &event.repository.owner.login;
    let repo = &event.repository.name;
    let number = event.pull_request.number;

    if state.lgtm_watcher.get().repo_mode(org, repo).is_none() {
        return;
    }
    let presubmits = state.provider.get_presubmits(&format!("{org}/{repo}"));
    if presubmits.is_empty() {
        return;
    }

    // No records have run for the label flow; the comment triggers every
    // protected job and overrides absent pipeline-conditional contexts.
    let sha = event
        .pull_request
        .head
        .as_ref()
        .map(|h| h.sha.clone())
        .unwrap_or_default();
    let comment = promotion_comment(&presubmits, &[], &sha);
    if comment.is_empty() {
        return;
    }

    if let Err(err) = state.forge.create_comment(org, repo, number, &comment).await {
        tracing::error!(org, repo, pr = number, error = %err, "failed to send a comment");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trip() {
        let secret = SecretString::from("webhook-secret");
        let body = br#"{"action":"opened"}"#;
        let mut mac = Hmac::<Sha256>::new_from_slice(b"webhook-secret").unwrap();
        mac.update(body);
        let signature = format!("sha256={}", hex_encode(&mac.finalize().into_bytes()));

        assert!(verify_signature(&secret, body, &signature));
        assert!(!verify_signature(&secret, b"tampered", &signature));
        assert!(!verify_signature(&secret, body, "sha256=deadbeef"));
        assert!(!verify_signature(&secret, body, "sha1=whatever"));
    }

    #[test]
    fn hex_decoding_rejects_bad_input() {
        assert!(decode_hex("0").is_none());
        assert!(decode_hex("zz").is_none());
        assert_eq!(decode_hex("00ff").unwrap(), vec![0x00, 0xff]);
    }

    fn hex_encode(data: &[u8]) -> String {
        data.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn parses_label_event_payload() {
        let payload = r#"{
            "action": "labeled",
            "label": {"name": "lgtm"},
            "repository": {"name": "widget", "owner": {"login": "acme"}},
            "pull_request": {"number": 42, "head": {"sha": "abc"}}
        }"#;
        let event: PullRequestEvent = serde_json::from_str(payload).unwrap();
        assert_eq!(event.action, "labeled");
        assert_eq!(event.label.unwrap().name, "lgtm");
        assert_eq!(event.repository.owner.login, "acme");
        assert_eq!(event.pull_request.number, 42);
    }
}
