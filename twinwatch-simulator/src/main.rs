//! TwinWatch Simulator - synthetic machine telemetry publisher
//!
//! Publishes one telemetry batch per configured machine every tick:
//! - Machine catalogue and thresholds come from the kernel config (TWINWATCH_CONFIG)
//! - Values follow a deterministic cycle around 80% of each threshold
//! - Each cycle ramps into the approach band, crosses the threshold, then cools down
//! - Parameters are offset in the cycle so excursions do not all line up

use anyhow::Result;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use twinwatch_kernel::config::{load_config, KernelConfig};
use twinwatch_kernel::contracts::{telemetry_topic, TelemetryBatch};
use twinwatch_kernel::models::ParameterReading;

/// Fraction of the threshold for each step of a cycle
const PROFILE: [f64; 20] = [
    0.80, 0.81, 0.79, 0.80, 0.82, 0.78, 0.80, 0.81, // normal
    0.91, 0.93, 0.94, // approaching
    1.02, 1.05, // in band
    0.97, 0.96, // cooldown, still above the exit edge
    0.85, 0.82, 0.80, 0.79, 0.80, // back to normal
];

/// Steps between two parameters of the same machine
const PARAMETER_OFFSET: u64 = 3;

/// Simulator settings (from environment)
#[derive(Debug, Clone)]
struct SimulatorConfig {
    tick: Duration,
    client_id: String,
}

impl SimulatorConfig {
    fn from_env() -> Self {
        let tick_ms = std::env::var("TWINWATCH_SIM_TICK_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(1000);
        Self {
            tick: Duration::from_millis(tick_ms),
            client_id: std::env::var("TWINWATCH_SIM_CLIENT_ID").unwrap_or_else(|_| "twinwatch-simulator".into()),
        }
    }
}

/// Value for a parameter at a given tick
fn sample(threshold: f64, tick: u64, parameter_index: usize) -> f64 {
    let step = (tick + parameter_index as u64 * PARAMETER_OFFSET) % PROFILE.len() as u64;
    let value = threshold * PROFILE[step as usize];
    (value * 100.0).round() / 100.0
}

/// One batch per machine with a configured threshold, machines sorted by id
fn build_batches(cfg: &KernelConfig, tick: u64) -> Vec<(String, TelemetryBatch)> {
    let mut ids: Vec<&String> = cfg.machines.keys().collect();
    ids.sort();

    ids.into_iter()
        .filter_map(|id| {
            let machine = &cfg.machines[id];
            let readings: Vec<ParameterReading> = machine
                .machine_type
                .parameters()
                .filter_map(|spec| machine.thresholds.get(spec.key).map(|t| (spec.key, *t)))
                .enumerate()
                .map(|(index, (key, threshold))| ParameterReading::new(key, sample(threshold, tick, index)))
                .collect();
            (!readings.is_empty()).then(|| {
                (id.clone(), TelemetryBatch { machine_id: Some(id.clone()), readings })
            })
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("twinwatch_simulator=info")),
        )
        .init();

    let sim = SimulatorConfig::from_env();
    let cfg = load_config().await;
    if cfg.machines.is_empty() {
        warn!("No machines configured, nothing to simulate");
    }
    info!("Simulating {} machine(s) every {:?}", cfg.machines.len(), sim.tick);

    let mut opts = MqttOptions::new(&sim.client_id, &cfg.mqtt.host, cfg.mqtt.port);
    opts.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(opts, 64);

    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => info!("Connected to MQTT broker"),
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT connection error: {}", e);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    let mut ticker = interval(sim.tick);
    let mut tick: u64 = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for (machine_id, batch) in build_batches(&cfg, tick) {
                    let payload = serde_json::to_vec(&batch)?;
                    if let Err(e) = client.try_publish(telemetry_topic(&machine_id), QoS::AtMostOnce, false, payload) {
                        warn!("Dropping telemetry for {}: {}", machine_id, e);
                    } else {
                        debug!("tick {} -> {} ({} readings)", tick, machine_id, batch.readings.len());
                    }
                }
                tick += 1;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Simulator stopped after {} ticks", tick);
                return Ok(());
            }
        }
    }
}
