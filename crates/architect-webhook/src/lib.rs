//! Signed webhook delivery for the architect control plane.
//!
//! Every outbound delivery is HMAC-SHA256 signed over the raw JSON body and
//! carries `X-Webhook-Signature` / `X-Webhook-Event` / `X-Webhook-Timestamp`
//! headers, per `SPEC_FULL.md` §4.6 and §6. Delivery failures are retried
//! using [`architect_retry`]'s exponential backoff before being recorded as
//! a failed [`WebhookDelivery`].
//!
//! # Example
//!
//! ```ignore
//! use architect_webhook::{WebhookClient, sign_payload};
//!
//! let client = WebhookClient::new(std::time::Duration::from_secs(10));
//! let delivery = client.deliver(&webhook, "task.completed", &payload_json)?;
//! ```

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use architect_retry::{RetryStrategyConfig, RetryStrategyType, calculate_delay};
use architect_types::{Webhook, WebhookDelivery};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Maximum response body length retained in a [`WebhookDelivery`] record.
pub const RESPONSE_BODY_TRUNCATE_BYTES: usize = 1024;

/// Compute the `sha256=<hex>` signature header value for a raw JSON body.
pub fn sign_payload(secret: &str, body: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a `sha256=<hex>` signature header against the raw JSON body using
/// constant-time comparison.
pub fn verify_signature(secret: &str, body: &str, signature_header: &str) -> bool {
    let expected = sign_payload(secret, body);
    constant_time_eq(expected.as_bytes(), signature_header.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// A client that delivers signed webhook payloads with retry.
pub struct WebhookClient {
    http: reqwest::blocking::Client,
    retry: RetryStrategyConfig,
}

impl WebhookClient {
    pub fn new(timeout: Duration) -> Self {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build webhook HTTP client");
        Self {
            http,
            retry: RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 3,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(30),
                jitter: 0.3,
            },
        }
    }

    pub fn with_retry(mut self, retry: RetryStrategyConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Deliver `body` (already-serialized JSON) to `webhook`, retrying
    /// transient failures per the configured backoff. Always returns a
    /// [`WebhookDelivery`] record rather than propagating network errors,
    /// so a caller can persist the attempt regardless of outcome.
    pub fn deliver(&self, webhook: &Webhook, event: &str, body: &str) -> WebhookDelivery {
        let timestamp = Utc::now();
        let mut attempt = 1;
        let started = Instant::now();

        loop {
            let outcome = self.send_once(webhook, event, body, timestamp);
            let exhausted = attempt >= webhook.retry_count.max(1);

            match &outcome {
                Ok((status, resp_body)) if (200..300).contains(status) => {
                    return WebhookDelivery {
                        id: 0,
                        webhook_id: webhook.id,
                        event: event.to_string(),
                        task_id: None,
                        payload: body.to_string(),
                        status_code: Some(*status),
                        success: true,
                        duration_ms: started.elapsed().as_millis() as u64,
                        response_body: Some(truncate(resp_body)),
                        error: None,
                        created_at: Utc::now(),
                    };
                }
                Ok((status, resp_body)) => {
                    if exhausted {
                        return WebhookDelivery {
                            id: 0,
                            webhook_id: webhook.id,
                            event: event.to_string(),
                            task_id: None,
                            payload: body.to_string(),
                            status_code: Some(*status),
                            success: false,
                            duration_ms: started.elapsed().as_millis() as u64,
                            response_body: Some(truncate(resp_body)),
                            error: Some(format!("non-2xx status {status}")),
                            created_at: Utc::now(),
                        };
                    }
                }
                Err(e) => {
                    if exhausted {
                        return WebhookDelivery {
                            id: 0,
                            webhook_id: webhook.id,
                            event: event.to_string(),
                            task_id: None,
                            payload: body.to_string(),
                            status_code: None,
                            success: false,
                            duration_ms: started.elapsed().as_millis() as u64,
                            response_body: None,
                            error: Some(e.to_string()),
                            created_at: Utc::now(),
                        };
                    }
                }
            }

            let delay = calculate_delay(&self.retry, attempt);
            tracing::warn!(webhook_id = webhook.id, attempt, ?delay, "webhook delivery retrying");
            std::thread::sleep(delay);
            attempt += 1;
        }
    }

    fn send_once(
        &self,
        webhook: &Webhook,
        event: &str,
        body: &str,
        timestamp: chrono::DateTime<Utc>,
    ) -> Result<(u16, String)> {
        let mut request = self
            .http
            .post(&webhook.url)
            .header("Content-Type", "application/json")
            .header("User-Agent", format!("architect-webhook/{}", env!("CARGO_PKG_VERSION")))
            .header("X-Webhook-Event", event)
            .header("X-Webhook-Timestamp", timestamp.timestamp().to_string())
            .body(body.to_string());

        if let Some(secret) = &webhook.secret {
            request = request.header("X-Webhook-Signature", sign_payload(secret, body));
        }

        let response = request.send().context("failed to send webhook request")?;
        let status = response.status().as_u16();
        let text = response.text().unwrap_or_default();
        Ok((status, text))
    }
}

fn truncate(s: &str) -> String {
    architect_types::truncate_utf8(s, RESPONSE_BODY_TRUNCATE_BYTES)
}
