//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{DbAdapter, GoogleCalendarAdapter, PayuGateway, SmtpEmailAdapter, WhatsAppAdapter},
    booking::{BookingService, BookingSettings},
    config::Config,
    error::ApiError,
    outbox::{ChannelOutbox, DispatchSettings, Dispatcher},
    web::{self, rest::ApiDoc, state::AppState},
};
use booking_core::ports::{NotificationSender, SystemClock};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// How often overdue slot holds are expired.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const OUTBOX_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Connect to Database & Run Migrations ---
    info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    let db_adapter = Arc::new(DbAdapter::new(db_pool));
    info!("Running database migrations...");
    db_adapter.run_migrations().await?;
    info!("Database migrations complete.");

    // --- 3. Initialize Service Adapters ---
    let gateway = Arc::new(PayuGateway::new(
        config.gateway.clone(),
        &config.public_base_url,
        config.http_timeout,
    )?);
    let calendar = Arc::new(GoogleCalendarAdapter::new(
        config.http_timeout,
        config.fallback_meet_link.clone(),
        config.slot_offset,
    )?);
    let email: Arc<dyn NotificationSender> = Arc::new(SmtpEmailAdapter::new(config.smtp.as_ref())?);
    let whatsapp: Arc<dyn NotificationSender> = Arc::new(WhatsAppAdapter::new(
        config.whatsapp.clone(),
        config.http_timeout,
    )?);
    if config.smtp.is_none() {
        info!("SMTP is not configured; email notices will be skipped.");
    }
    if config.whatsapp.is_none() {
        info!("WhatsApp is not configured; WhatsApp notices will be skipped.");
    }

    // --- 4. Start the Side-Effect Dispatcher ---
    let shutdown = CancellationToken::new();
    let settings = BookingSettings::from_config(&config);
    let (outbox, jobs) = ChannelOutbox::channel(OUTBOX_CAPACITY);
    let senders = vec![email, whatsapp];
    let dispatcher = Arc::new(Dispatcher::new(
        db_adapter.clone(),
        calendar.clone(),
        senders,
        DispatchSettings::new(&settings, config.admin_email.clone()),
    ));
    let dispatcher_task = tokio::spawn(dispatcher.run(jobs, shutdown.clone()));

    // --- 5. Build the Booking Service & Shared AppState ---
    let booking = BookingService::new(
        db_adapter.clone(),
        gateway,
        calendar,
        Arc::new(outbox),
        Arc::new(SystemClock),
        settings,
    );
    let app_state = Arc::new(AppState {
        db: db_adapter,
        booking: booking.clone(),
        config: config.clone(),
    });

    // --- 6. Start the Slot-Hold Sweeper ---
    let sweeper_token = shutdown.clone();
    let sweeper_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = sweeper_token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = booking.expire_locks().await {
                        error!("Slot-hold sweep failed: {:?}", e);
                    }
                }
            }
        }
    });

    // --- 7. Create the Web Router ---
    let app = web::router(app_state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    // --- 8. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received.");
            signal_token.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Err(e) = tokio::join!(dispatcher_task, sweeper_task).0 {
        error!("Dispatcher task ended abnormally: {}", e);
    }
    info!("Server stopped.");
    Ok(())
}
