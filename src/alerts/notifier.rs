//! Channel dispatch for alert records.
//!
//! Channel configs are fetched from the store by id; caller-provided
//! config is never trusted. Every URL-based channel passes the SSRF
//! guard before any request is issued. Per-channel outcomes are recorded
//! on the alert record; the record flips to `sent` once any channel
//! succeeded.

use std::sync::LazyLock;
use std::time::Duration;

use miette::Diagnostic;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::store::models::NotificationChannel;
use crate::store::{Store, StoreError};
use crate::util::json_str;

use super::ssrf::is_safe_url;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-zA-Z_][a-zA-Z0-9_]*)\}").expect("placeholder regex"));

#[derive(Debug, Error, Diagnostic)]
pub enum NotifyError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("alert record {0} not found")]
    #[diagnostic(code(recongraph::alerts::record_not_found))]
    RecordNotFound(Uuid),
}

/// Per-channel delivery outcome.
#[derive(Clone, Debug)]
pub struct ChannelOutcome {
    pub channel_id: Uuid,
    pub success: bool,
    pub error: Option<String>,
}

pub struct Notifier {
    store: Store,
    client: reqwest::Client,
    enforce_ssrf_guard: bool,
}

impl Notifier {
    pub fn new(store: Store) -> Self {
        Self::with_ssrf_guard(store, true)
    }

    /// Test harnesses point channels at loopback mock servers; only they
    /// may relax the guard.
    pub fn with_ssrf_guard(store: Store, enforce_ssrf_guard: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .unwrap_or_default();
        Notifier {
            store,
            client,
            enforce_ssrf_guard,
        }
    }

    /// Deliver an alert to the given channels and record the outcomes.
    #[instrument(skip(self, channel_ids), fields(alert = %alert_id))]
    pub async fn send_alert_notifications(
        &self,
        alert_id: Uuid,
        channel_ids: &[Uuid],
    ) -> Result<Vec<ChannelOutcome>, NotifyError> {
        let record = self
            .store
            .get_alert_record(alert_id)
            .await?
            .ok_or(NotifyError::RecordNotFound(alert_id))?;

        let template = match record.policy_id {
            Some(policy_id) => self
                .store
                .get_alert_policy(policy_id)
                .await?
                .and_then(|p| p.notification_template),
            None => None,
        };

        let data = json!({
            "title": record.title,
            "message": record.message,
            "severity": record.severity.as_str(),
            "target_type": record.target_type,
            "created_at": record.created_at.to_rfc3339(),
            "details": record.details,
        });

        let mut outcomes = Vec::new();
        let mut any_success = false;
        for &channel_id in channel_ids {
            let channel = match self.store.get_notification_channel(channel_id).await? {
                Some(channel) if channel.enabled => channel,
                _ => {
                    warn!(channel = %channel_id, "channel missing or disabled, skipping");
                    continue;
                }
            };

            let (success, error) = self
                .send_to_channel(&channel, &data, template.as_deref())
                .await;
            self.store
                .update_notification_results(alert_id, channel_id, success, error.as_deref())
                .await?;
            any_success |= success;
            outcomes.push(ChannelOutcome {
                channel_id,
                success,
                error,
            });
        }

        if any_success {
            self.store.update_alert_status(alert_id, "sent", None).await?;
        }
        info!(
            channels = outcomes.len(),
            delivered = any_success,
            "alert dispatch finished"
        );
        Ok(outcomes)
    }

    /// Send a fixed test payload through one channel and record the
    /// result on the channel row.
    pub async fn test_channel(&self, channel_id: Uuid) -> Result<ChannelOutcome, NotifyError> {
        let channel = self
            .store
            .get_notification_channel(channel_id)
            .await?
            .ok_or(NotifyError::RecordNotFound(channel_id))?;

        let data = json!({
            "title": "Test notification",
            "message": "This is a test notification verifying the channel configuration.",
            "severity": "info",
            "target_type": "test",
            "created_at": chrono::Utc::now().to_rfc3339(),
            "details": {},
        });
        let (success, error) = self.send_to_channel(&channel, &data, None).await;
        self.store.update_channel_test_result(channel_id, success).await?;
        Ok(ChannelOutcome {
            channel_id,
            success,
            error,
        })
    }

    async fn send_to_channel(
        &self,
        channel: &NotificationChannel,
        data: &Value,
        template: Option<&str>,
    ) -> (bool, Option<String>) {
        let result = match channel.channel_type.as_str() {
            "email" => self.send_email(&channel.config),
            "webhook" => self.send_webhook(&channel.config, data).await,
            "dingtalk" => self.send_dingtalk(&channel.config, data, template).await,
            "feishu" => self.send_feishu(&channel.config, data, template).await,
            "wechat" => self.send_wechat(&channel.config, data, template).await,
            other => Err(format!("unknown channel type: {other}")),
        };
        match result {
            Ok(()) => (true, None),
            Err(error) => (false, Some(error)),
        }
    }

    /// SMTP transport is an external collaborator; the channel validates
    /// its config and records the hand-off.
    fn send_email(&self, config: &Value) -> Result<(), String> {
        let smtp_host = json_str(config, "smtp_host");
        let recipients = config
            .get("recipients")
            .and_then(Value::as_array)
            .map(|r| !r.is_empty())
            .unwrap_or(false);
        if smtp_host.is_none() || !recipients {
            return Err("Missing SMTP configuration".to_string());
        }
        Ok(())
    }

    async fn send_webhook(&self, config: &Value, data: &Value) -> Result<(), String> {
        let url = json_str(config, "url")
            .or_else(|| json_str(config, "webhook_url"))
            .ok_or_else(|| "Missing webhook URL".to_string())?;
        let url = self.guard(url).await?;

        let mut headers = HeaderMap::new();
        if let Some(Value::Object(extra)) = config.get("headers") {
            for (key, value) in extra {
                let (Ok(name), Some(value)) = (
                    HeaderName::from_bytes(key.as_bytes()),
                    value.as_str().and_then(|v| HeaderValue::from_str(v).ok()),
                ) else {
                    continue;
                };
                headers.insert(name, value);
            }
        }

        let payload = json!({
            "title": data.get("title"),
            "message": data.get("message"),
            "severity": data.get("severity"),
            "target_type": data.get("target_type"),
            "created_at": data.get("created_at"),
            "details": data.get("details").cloned().unwrap_or_else(|| json!({})),
        });

        let response = self
            .client
            .post(url)
            .headers(headers)
            .json(&payload)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("webhook returned {}", response.status()));
        }
        Ok(())
    }

    async fn send_dingtalk(
        &self,
        config: &Value,
        data: &Value,
        template: Option<&str>,
    ) -> Result<(), String> {
        let url = json_str(config, "webhook_url")
            .ok_or_else(|| "Missing DingTalk webhook URL".to_string())?;
        let url = self.guard(url).await?;

        let mut payload = json!({
            "msgtype": "text",
            "text": {"content": format_message(data, template)},
        });
        let at_mobiles = config
            .get("at_mobiles")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let at_all = config
            .get("at_all")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !at_mobiles.is_empty() || at_all {
            payload["at"] = json!({"atMobiles": at_mobiles, "isAtAll": at_all});
        }

        let body = self.post_json(url, &payload).await?;
        // DingTalk reports API-level failure on HTTP 200.
        if body.get("errcode").and_then(Value::as_i64).unwrap_or(0) != 0 {
            return Err(
                json_str(&body, "errmsg")
                    .unwrap_or("DingTalk API error")
                    .to_string(),
            );
        }
        Ok(())
    }

    async fn send_feishu(
        &self,
        config: &Value,
        data: &Value,
        template: Option<&str>,
    ) -> Result<(), String> {
        let url = json_str(config, "webhook_url")
            .ok_or_else(|| "Missing Feishu webhook URL".to_string())?;
        let url = self.guard(url).await?;

        let payload = json!({
            "msg_type": "text",
            "content": {"text": format_message(data, template)},
        });
        let body = self.post_json(url, &payload).await?;
        if body.get("code").and_then(Value::as_i64).unwrap_or(0) != 0 {
            return Err(json_str(&body, "msg").unwrap_or("Feishu API error").to_string());
        }
        Ok(())
    }

    async fn send_wechat(
        &self,
        config: &Value,
        data: &Value,
        template: Option<&str>,
    ) -> Result<(), String> {
        let url = json_str(config, "webhook_url")
            .ok_or_else(|| "Missing WeChat Work webhook URL".to_string())?;
        let url = self.guard(url).await?;

        let payload = json!({
            "msgtype": "text",
            "text": {"content": format_message(data, template)},
        });
        let body = self.post_json(url, &payload).await?;
        if body.get("errcode").and_then(Value::as_i64).unwrap_or(0) != 0 {
            return Err(
                json_str(&body, "errmsg")
                    .unwrap_or("WeChat Work API error")
                    .to_string(),
            );
        }
        Ok(())
    }

    async fn guard(&self, url: &str) -> Result<String, String> {
        if !self.enforce_ssrf_guard {
            return Ok(url.to_string());
        }
        match is_safe_url(url).await {
            Ok(parsed) => Ok(parsed.to_string()),
            Err(reason) => Err(format!("URL blocked for security: {reason}")),
        }
    }

    async fn post_json(&self, url: String, payload: &Value) -> Result<Value, String> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("endpoint returned {status}"));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| format!("invalid response body: {e}"))
    }
}

/// Render the message body. A policy template with `{placeholder}`
/// markers is used when every placeholder resolves against the
/// notification data; otherwise the default block format applies.
pub fn format_message(data: &Value, template: Option<&str>) -> String {
    if let Some(template) = template {
        let mut ok = true;
        let rendered = PLACEHOLDER_RE.replace_all(template, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            match data.get(key) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => {
                    ok = false;
                    String::new()
                }
            }
        });
        if ok {
            return rendered.into_owned();
        }
    }

    let field = |key: &str| json_str(data, key).unwrap_or("").to_string();
    format!(
        "[{}] {}\nMessage: {}\nType: {}\nTime: {}",
        field("severity").to_uppercase(),
        if field("title").is_empty() {
            "Alert".to_string()
        } else {
            field("title")
        },
        field("message"),
        field("target_type"),
        field("created_at"),
    )
}
