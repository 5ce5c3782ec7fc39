//! Application entry point for the `codemetal-alarmflow` service.
//!
//! Startup order: `.env` and tracing, typed config, Postgres pool and
//! schema, then the alarm engine (registry, store, coordinator, pipeline)
//! behind the `routes` gateway, served by axum on `LISTEN_PORT`.
//!
//! Logging knobs are shared with the other pipeline services:
//! - `RUST_LOG` – full filter directive, takes precedence
//! - `AXUM_LOG_LEVEL` – base level when `RUST_LOG` is unset (default: `debug`)
//! - `AXUM_SPAN_EVENTS` – `full`, `enter_exit`, or close-only (default)
//! - `FORCE_COLOR` – `1|true|yes` / `0|false|no`, else TTY detection
//!
//! See `config.rs` for `DATABASE_URL`, `THRESHOLD_API_URL` and the tuning
//! variables.
use std::{env, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use alarmflow::{
    config, routes, schema, AlarmFeedCoordinator, AlarmPipeline, AlarmService,
    ChannelReadingSource, Config, HttpConfigSource, PgAlarmStore, ThresholdRegistry,
};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    // .env may carry the logging knobs, so it loads first
    dotenv().ok();
    init_tracing();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    tracing::info!("Connecting to alarm database");
    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .connect(&cfg.db_url)
        .await
        .context("Failed to connect to database")?;
    schema::create_schema(&pool).await?;
    tracing::info!("Alarm schema ready");

    let service = build_service(&cfg, pool);
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.listen_port));
    let app = routes::router(service, cfg);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Alarm service listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Wire the engine: settings API -> registry, Postgres -> store ->
/// coordinator, both into the pipeline, fed by the in-process source.
fn build_service(cfg: &Config, pool: PgPool) -> Arc<AlarmService> {
    // ---
    let config_source = Arc::new(HttpConfigSource::new(cfg.threshold_api_url.clone()));
    let registry = Arc::new(ThresholdRegistry::new(config_source));

    let store = Arc::new(PgAlarmStore::new(pool));
    let coordinator = Arc::new(AlarmFeedCoordinator::new(store, cfg.coordinator_settings()));

    let pipeline = Arc::new(AlarmPipeline::new(registry, coordinator, cfg.suspend_policy));
    let source = Arc::new(ChannelReadingSource::new(cfg.reading_queue_depth as usize));

    Arc::new(AlarmService::new(pipeline, source))
}

// ---

/// Install the global compact `tracing` subscriber (target, file and line
/// on every event). Call once, before the first log line.
fn init_tracing() {
    // ---
    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events_from_env())
        .with_env_filter(env_filter_from_env())
        .with_ansi(color_from_env())
        .compact()
        .init();
}

fn span_events_from_env() -> FmtSpan {
    // ---
    match env::var("AXUM_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    }
}

fn color_from_env() -> bool {
    // ---
    match env::var("FORCE_COLOR").map(|v| v.to_ascii_lowercase()).as_deref() {
        Ok("1" | "true" | "yes") => true,
        Ok("0" | "false" | "no") => false,
        _ => std::io::stdout().is_terminal(),
    }
}

fn env_filter_from_env() -> EnvFilter {
    // ---
    if env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    EnvFilter::new(log_directive())
}

/// Filter directive built from `AXUM_LOG_LEVEL` (default `debug`).
fn log_directive() -> String {
    // ---
    let level = env::var("AXUM_LOG_LEVEL")
        .ok()
        .and_then(|v| v.parse::<tracing::Level>().ok())
        .unwrap_or(tracing::Level::DEBUG);

    // sqlx logs every statement at info
    format!(
        "{},sqlx::query=warn,hyper=info,reqwest=info",
        level.as_str().to_ascii_lowercase()
    )
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_log_level_from_dotenv_reaches_filter() {
        // ---
        dotenvy::from_read("AXUM_LOG_LEVEL=warn\n".as_bytes()).unwrap();
        assert!(log_directive().starts_with("warn,"));
    }
}
