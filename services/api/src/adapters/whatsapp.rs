//! services/api/src/adapters/whatsapp.rs
//!
//! WhatsApp Cloud API style text messages over `reqwest`.

use async_trait::async_trait;
use booking_core::ports::{Delivery, NotificationSender, OutboundMessage, PortError, PortResult};
use regex::Regex;
use serde_json::json;
use std::sync::LazyLock;
use std::time::Duration;

use crate::config::WhatsAppConfig;

static NON_DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\D").expect("valid pattern"));

/// Prefixed to bare ten-digit national numbers.
const DEFAULT_COUNTRY_CODE: &str = "91";

/// Strips everything but digits, e.g. `"+91 98765-43210"` -> `"919876543210"`.
pub fn digits_only(raw: &str) -> String {
    NON_DIGITS.replace_all(raw, "").into_owned()
}

fn to_whatsapp_number(raw: &str) -> Option<String> {
    let digits = digits_only(raw);
    match digits.len() {
        0..=9 => None,
        10 => Some(format!("{}{}", DEFAULT_COUNTRY_CODE, digits)),
        _ => Some(digits),
    }
}

#[derive(Clone)]
pub struct WhatsAppAdapter {
    client: reqwest::Client,
    config: Option<WhatsAppConfig>,
}

impl WhatsAppAdapter {
    pub fn new(config: Option<WhatsAppConfig>, timeout: Duration) -> PortResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PortError::Unexpected(format!("HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl NotificationSender for WhatsAppAdapter {
    fn channel(&self) -> &'static str {
        "whatsapp"
    }

    async fn send(&self, message: &OutboundMessage) -> PortResult<Delivery> {
        let Some(config) = &self.config else {
            return Ok(Delivery::Skipped {
                reason: "WhatsApp is not configured".to_string(),
            });
        };
        let Some(to) = message.recipient.phone.as_deref().and_then(to_whatsapp_number) else {
            return Ok(Delivery::Skipped {
                reason: format!("{} has no usable phone number", message.recipient.name),
            });
        };

        let body = json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "text",
            "text": { "body": format!("{}\n\n{}", message.subject, message.body) }
        });
        let response = self
            .client
            .post(&config.api_url)
            .bearer_auth(&config.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| PortError::Unexpected(format!("WhatsApp request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(PortError::Unexpected(format!(
                "WhatsApp API returned {}",
                response.status()
            )));
        }
        Ok(Delivery::Sent)
    }
}
