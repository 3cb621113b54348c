//! services/api/src/adapters/email.rs
//!
//! SMTP email delivery using Lettre. Implements the `NotificationSender` port.
//! When no SMTP server is configured every message is reported as skipped.

use async_trait::async_trait;
use booking_core::ports::{Delivery, NotificationSender, OutboundMessage, PortError, PortResult};
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::SmtpConfig;

#[derive(Clone)]
pub struct SmtpEmailAdapter {
    mailer: Option<(AsyncSmtpTransport<Tokio1Executor>, String)>,
}

impl SmtpEmailAdapter {
    pub fn new(config: Option<&SmtpConfig>) -> PortResult<Self> {
        let Some(config) = config else {
            return Ok(Self { mailer: None });
        };
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| PortError::Unexpected(format!("SMTP relay error: {}", e)))?
            .port(config.port);
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }
        Ok(Self {
            mailer: Some((builder.build(), config.from.clone())),
        })
    }

    /// An adapter that skips every message.
    pub fn disabled() -> Self {
        Self { mailer: None }
    }
}

#[async_trait]
impl NotificationSender for SmtpEmailAdapter {
    fn channel(&self) -> &'static str {
        "email"
    }

    async fn send(&self, message: &OutboundMessage) -> PortResult<Delivery> {
        let Some((mailer, from)) = &self.mailer else {
            return Ok(Delivery::Skipped {
                reason: "SMTP is not configured".to_string(),
            });
        };
        let Some(to) = message.recipient.email.as_deref().filter(|e| !e.trim().is_empty()) else {
            return Ok(Delivery::Skipped {
                reason: format!("{} has no email address", message.recipient.name),
            });
        };

        let email = Message::builder()
            .from(
                from.parse()
                    .map_err(|e| PortError::Unexpected(format!("Invalid from address: {}", e)))?,
            )
            .to(to
                .parse()
                .map_err(|e| PortError::Unexpected(format!("Invalid to address: {}", e)))?)
            .subject(message.subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(message.body.clone())
            .map_err(|e| PortError::Unexpected(format!("Failed to build email: {}", e)))?;

        mailer
            .send(email)
            .await
            .map_err(|e| PortError::Unexpected(format!("Failed to send email: {}", e)))?;
        Ok(Delivery::Sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use booking_core::ports::Recipient;

    fn message(email: Option<&str>) -> OutboundMessage {
        OutboundMessage {
            recipient: Recipient {
                name: "Asha".into(),
                email: email.map(str::to_string),
                phone: None,
            },
            template: "booking_confirmed".into(),
            subject: "Your session is booked".into(),
            body: "See you soon".into(),
        }
    }

    #[tokio::test]
    async fn unconfigured_smtp_skips() {
        let adapter = SmtpEmailAdapter::disabled();
        let delivery = adapter.send(&message(Some("asha@example.com"))).await.unwrap();
        assert!(matches!(delivery, Delivery::Skipped { .. }));
    }

    #[tokio::test]
    async fn recipient_without_email_skips() {
        let config = SmtpConfig {
            host: "smtp.example.com".into(),
            port: 587,
            username: String::new(),
            password: String::new(),
            from: "Bookings <noreply@example.com>".into(),
        };
        let adapter = SmtpEmailAdapter::new(Some(&config)).unwrap();
        let delivery = adapter.send(&message(None)).await.unwrap();
        assert_eq!(
            delivery,
            Delivery::Skipped {
                reason: "Asha has no email address".into()
            }
        );
    }
}
