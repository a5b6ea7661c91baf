/**
 * TWINWATCH KERNEL - Point d'entrée principal du moteur jumeau numérique
 *
 * RÔLE : Orchestration de tous les modules : config, registre machines, alertes,
 * write-behind, MQTT, HTTP, health.
 *
 * ARCHITECTURE : Event-driven via MQTT + API REST/WebSocket + persistance write-behind.
 * UTILITÉ : Point unique où la télémétrie devient phases, alertes et événements observables.
 */

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use twinwatch_kernel::config::load_config;
use twinwatch_kernel::engine::{EngineSettings, TwinEngine};
use twinwatch_kernel::health::HealthTracker;
use twinwatch_kernel::http::{self, AppState};
use twinwatch_kernel::mqtt;
use twinwatch_kernel::ports::{spawn_write_behind, AlertStore, ConfigRegistry, JsonAlertStore, MachineRegistry};
use twinwatch_kernel::router::SubscriptionRouter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("twinwatch_kernel=info")))
        .init();

    let cfg = load_config().await;

    // registre machines + stockage alertes
    let registry: Arc<dyn MachineRegistry> = Arc::new(ConfigRegistry::from_config(&cfg));
    let store: Arc<dyn AlertStore> = Arc::new(
        JsonAlertStore::new(&cfg.alerts.store_path)
            .with_context(|| format!("opening alert store {}", cfg.alerts.store_path))?,
    );

    let settings = EngineSettings {
        bands: cfg.bands,
        session: cfg.session.settings(),
        error_ratio: cfg.alerts.error_ratio,
        idle_after: Duration::from_secs(cfg.session.idle_after_secs),
        write_queue_capacity: cfg.alerts.write_queue_capacity,
    };
    let router = SubscriptionRouter::new(cfg.router.queue_capacity, cfg.router.overflow);
    let (engine, write_rx) = TwinEngine::new(registry.clone(), router, settings);

    match store.load() {
        Ok(alerts) => {
            let count = engine.load_alerts(alerts);
            info!("[kernel] restored {count} alerts ({} pending)", engine.pending_alerts());
        }
        Err(e) => warn!("[kernel] failed to load alerts: {e}"),
    }

    // persistance asynchrone, hors du chemin télémétrie
    spawn_write_behind(write_rx, registry, store);

    let engine = Arc::new(engine);
    let health_tracker = HealthTracker::new();

    // balayage des machines silencieuses
    TwinEngine::spawn_idle_monitor(engine.clone(), Duration::from_secs(cfg.session.idle_check_secs.max(1)));

    // MQTT : télémétrie, sessions, commandes alertes
    mqtt::spawn_mqtt_listener(engine.clone(), cfg.mqtt.clone(), health_tracker.clone());

    // démarre la publication auto du health
    health_tracker.spawn_health_publisher(cfg.mqtt.clone(), engine.clone());

    let app = http::build_router(AppState { engine, health_tracker });

    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("binding {}", cfg.http.bind))?;
    info!("[kernel] listening on http://{}", cfg.http.bind);
    axum::serve(listener, app).await?;
    Ok(())
}
