mod actuator;
mod climate;
mod config;
mod control_loop;
mod db;
mod forecast;
mod light;
mod link;
mod protocol;
mod sampler;
mod state;
mod surface;
#[cfg(test)]
mod testing;
mod transport;
mod web;

use anyhow::Result;
use std::env;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use actuator::Actuator;
use climate::PredictiveController;
use control_loop::{ControlLoop, LoopTiming};
use db::Db;
use forecast::TrendForecaster;
use link::{DeviceLink, LinkHandle};
use sampler::Sampler;
use state::SystemState;
use surface::ControlSurface;
use transport::PortConnector;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let db_url =
        env::var("DB_URL").unwrap_or_else(|_| "sqlite:greenhouse.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "greenhouse.toml".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed default controls) ─────────────────────────
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;

    // Persisted controls are the source of truth from here on.
    let controls = db.load_controls(&cfg.default_controls()).await?;
    info!(
        climate_mode = %controls.climate_mode,
        light_mode = %controls.light_mode,
        predictive = controls.predictive,
        "controls loaded"
    );

    let shared = SystemState::shared(controls);
    shared
        .write()
        .await
        .record_system("hub started".to_string());

    // ── Device link ─────────────────────────────────────────────────
    let connector = PortConnector::new(cfg.endpoint(), cfg.device.baud_rate, CONNECT_TIMEOUT);
    let link = LinkHandle::spawn(
        DeviceLink::new(connector, cfg.link_settings()),
        cfg.queue_timeout(),
    );

    // ── Actuator ────────────────────────────────────────────────────
    let mut actuator = Actuator::new(
        link.clone(),
        db.clone(),
        shared.clone(),
        Duration::from_secs(cfg.control.min_dwell_sec),
    );
    if let Err(e) = actuator.sync_from_device().await {
        warn!(error = %e, "could not read relay states from board; assuming all off");
    }
    let actuator = actuator.into_shared();

    // ── Control loop ────────────────────────────────────────────────
    let predictive = PredictiveController::new(
        Box::new(TrendForecaster::new(
            cfg.control.min_history,
            Duration::from_secs(cfg.control.max_history_age_sec),
        )),
        Duration::from_secs(cfg.control.forecast_horizon_min * 60),
        cfg.control.history_window,
    );
    let mut control = ControlLoop::new(
        Sampler::new(link.clone()),
        actuator.clone(),
        predictive,
        db.clone(),
        shared.clone(),
        LoopTiming::from(&cfg),
    );
    match db.recent_snapshots(cfg.control.history_window as i64).await {
        Ok(history) => control.warm_up(&history),
        Err(e) => warn!("could not load sensor history for warm-up: {e:#}"),
    }

    // ── Web server ──────────────────────────────────────────────────
    let surface = ControlSurface::new(
        shared.clone(),
        actuator,
        db.clone(),
        link,
        cfg.staleness_bound(),
    );
    tokio::spawn(async move {
        if let Err(e) = web::serve(surface, web_port).await {
            error!("http api stopped: {e:#}");
        }
    });

    control.run().await;
    Ok(())
}
