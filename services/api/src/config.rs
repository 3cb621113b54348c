//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use booking_core::slots::parse_offset;
use chrono::FixedOffset;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Payment gateway merchant settings.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub key: String,
    pub salt: String,
    pub base_url: String,
    pub verify_url: String,
}

/// SMTP settings. Email is skipped when these are absent.
#[derive(Clone, Debug)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

/// WhatsApp-style messaging API settings.
#[derive(Clone, Debug)]
pub struct WhatsAppConfig {
    pub api_url: String,
    pub token: String,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub log_level: Level,
    pub cors_origin: String,
    pub frontend_url: String,
    pub public_base_url: String,
    pub gateway: GatewayConfig,
    pub http_timeout: Duration,
    pub slot_offset: FixedOffset,
    pub session_minutes: i64,
    pub slot_hold_minutes: i64,
    pub reconcile_grace_secs: i64,
    pub reschedule_cutoff_hours: i64,
    pub reschedule_approval_after: Option<i32>,
    pub platform_event_prefix: String,
    pub holiday_keywords: Vec<String>,
    pub fallback_meet_link: String,
    pub smtp: Option<SmtpConfig>,
    pub whatsapp: Option<WhatsAppConfig>,
    pub admin_email: Option<String>,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var_or = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());
        let required = |name: &str| lookup(name).ok_or_else(|| ConfigError::MissingVar(name.to_string()));

        // --- Load Server and Database Settings ---
        let bind_address = parse_var("BIND_ADDRESS", &var_or("BIND_ADDRESS", "0.0.0.0:3000"))?;
        let database_url = required("DATABASE_URL")?;

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let cors_origin = var_or("CORS_ORIGIN", "http://localhost:3000");
        let frontend_url = var_or("FRONTEND_URL", "http://localhost:3000");
        let public_base_url = var_or("PUBLIC_BASE_URL", "http://localhost:3000");

        // --- Load Payment Gateway Settings ---
        let gateway = GatewayConfig {
            key: required("PAYU_KEY")?,
            salt: required("PAYU_SALT")?,
            base_url: var_or("PAYU_BASE_URL", "https://test.payu.in"),
            verify_url: var_or(
                "PAYU_VERIFY_URL",
                "https://test.payu.in/merchant/postservice.php?form=2",
            ),
        };

        // --- Load Booking Rules ---
        let http_timeout = Duration::from_secs(parse_var("HTTP_TIMEOUT_SECS", &var_or("HTTP_TIMEOUT_SECS", "10"))?);
        let offset_str = var_or("SLOT_UTC_OFFSET", "+05:30");
        let slot_offset = parse_offset(&offset_str).ok_or_else(|| {
            ConfigError::InvalidValue("SLOT_UTC_OFFSET".to_string(), offset_str.clone())
        })?;
        let session_minutes = parse_var("SESSION_DURATION_MINUTES", &var_or("SESSION_DURATION_MINUTES", "60"))?;
        let slot_hold_minutes = parse_var("SLOT_HOLD_MINUTES", &var_or("SLOT_HOLD_MINUTES", "15"))?;
        let reconcile_grace_secs = parse_var("RECONCILE_GRACE_SECS", &var_or("RECONCILE_GRACE_SECS", "30"))?;
        let reschedule_cutoff_hours = parse_var("RESCHEDULE_CUTOFF_HOURS", &var_or("RESCHEDULE_CUTOFF_HOURS", "24"))?;
        let reschedule_approval_after = lookup("RESCHEDULE_APPROVAL_AFTER")
            .map(|v| parse_var("RESCHEDULE_APPROVAL_AFTER", &v))
            .transpose()?;

        // --- Load External Calendar Settings ---
        let platform_event_prefix = var_or("PLATFORM_EVENT_PREFIX", "Therapy Session");
        let holiday_keywords = var_or("HOLIDAY_KEYWORDS", "holiday")
            .split(',')
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        let fallback_meet_link = var_or("FALLBACK_MEET_LINK", "https://meet.google.com/");

        // --- Load Notification Settings (as optional) ---
        let smtp = match (lookup("SMTP_HOST"), lookup("EMAIL_FROM")) {
            (Some(host), Some(from)) => Some(SmtpConfig {
                host,
                port: parse_var("SMTP_PORT", &var_or("SMTP_PORT", "587"))?,
                username: var_or("SMTP_USERNAME", ""),
                password: var_or("SMTP_PASSWORD", ""),
                from,
            }),
            _ => None,
        };
        let whatsapp = match (lookup("WHATSAPP_API_URL"), lookup("WHATSAPP_TOKEN")) {
            (Some(api_url), Some(token)) => Some(WhatsAppConfig { api_url, token }),
            _ => None,
        };
        let admin_email = lookup("ADMIN_EMAIL");

        Ok(Self {
            bind_address,
            database_url,
            log_level,
            cors_origin,
            frontend_url,
            public_base_url,
            gateway,
            http_timeout,
            slot_offset,
            session_minutes,
            slot_hold_minutes,
            reconcile_grace_secs,
            reschedule_cutoff_hours,
            reschedule_approval_after,
            platform_event_prefix,
            holiday_keywords,
            fallback_meet_link,
            smtp,
            whatsapp,
            admin_email,
        })
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string()))
}
