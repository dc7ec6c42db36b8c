use std::sync::Arc;

use actix_web::{
    middleware::{NormalizePath, TrailingSlash},
    web::{Data, JsonConfig},
    App, HttpServer,
};
use cache::{InMemoryCache, MetadataCache};
use config::Config;
use db::message::MessageStore;
use delivery::{BackoffPolicy, Deliver, WebhookClient};
use scheduler::{Scheduler, SchedulerConfig};
use service::MessageService;
use tracing::level_filters::LevelFilter;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod delivery;
pub mod error;
pub mod message;
pub mod scheduler;
pub mod service;

/// Returns a builder for the main application. Without an explicit `config`
/// the configuration is read from `COURIER_*` environment variables.
#[bon::builder(finish_fn = start)]
pub async fn run(config: Option<Config>) -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("COURIER_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("COURIER_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = match config {
        Some(config) => config,
        None => Config::load()?,
    };
    config.validate()?;

    let pool = db::connect(config.db_path()).await?;

    let delivery: Arc<dyn Deliver> = Arc::new(WebhookClient::new(
        BackoffPolicy {
            min: config.backoff_min(),
            max: config.backoff_max(),
            jitter: config.backoff_jitter(),
            max_retries: config.max_delivery_retries,
        },
        config.delivery_timeout(),
    )?);

    let cache: Arc<dyn MetadataCache> = Arc::new(InMemoryCache::new(config.cache_ttl()));

    let service = MessageService::builder()
        .store(MessageStore::with_lease(pool, config.claim_lease()))
        .delivery(delivery)
        .cache(cache)
        .delivery_timeout(config.delivery_timeout())
        .batch_size(config.batch_size)
        .build()?;

    let scheduler = Data::new(Scheduler::new(
        Arc::new(service.clone()),
        SchedulerConfig {
            processing_interval: config.processing_interval(),
            retry_interval: config.retry_interval(),
            invocation_timeout: config.invocation_timeout(),
        },
    ));

    if config.autostart {
        scheduler.start().await?;
    }

    let data = Data::new(service);

    tracing::info!(addr = %config.bind_addr, port = config.port, "starting HTTP server");

    let server_scheduler = scheduler.clone();

    HttpServer::new(move || {
        let json_cfg = JsonConfig::default().content_type_required(false);

        App::new()
            .wrap(TracingLogger::default())
            .wrap(NormalizePath::new(TrailingSlash::Trim))
            .configure(api::configure)
            .app_data(data.clone())
            .app_data(server_scheduler.clone())
            .app_data(json_cfg)
    })
    .bind((config.bind_addr.as_str(), config.port))?
    .run()
    .await?;

    if scheduler.is_running() {
        scheduler.stop().await?;
    }

    Ok(())
}
