use crate::config::MqttConf;
use crate::contracts::KERNEL_HEALTH;
use crate::engine::TwinEngine;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{self, JoinHandle};
use tracing::{debug, error};

#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub machines_tracked: u32,
    pub connections: u32,
    pub pending_alerts: u32,
    pub dropped_deliveries: u64,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<parking_lot::Mutex<String>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(parking_lot::Mutex::new("connecting".to_string())),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn mark_mqtt_disconnected(&self) {
        *self.mqtt_status.lock() = "disconnected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn get_health(&self, engine: &TwinEngine) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            machines_tracked: engine.machines_tracked() as u32,
            connections: engine.connection_count() as u32,
            pending_alerts: engine.pending_alerts() as u32,
            dropped_deliveries: engine.dropped_deliveries(),
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }

    /// Démarre la publication auto du health kernel (toutes les 30s)
    pub fn spawn_health_publisher(&self, mqtt: MqttConf, engine: Arc<TwinEngine>) -> JoinHandle<()> {
        let health_tracker = self.clone();

        task::spawn(async move {
            let mut opts = MqttOptions::new("twinwatch-kernel-health", &mqtt.host, mqtt.port);
            opts.set_keep_alive(Duration::from_secs(15));

            let (client, mut eventloop) = AsyncClient::new(opts, 10);
            let mut interval = tokio::time::interval(Duration::from_secs(30));

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let health = health_tracker.get_health(&engine);
                        if let Ok(payload) = serde_json::to_string(&health) {
                            if let Err(e) = client.try_publish(KERNEL_HEALTH, QoS::AtLeastOnce, false, payload) {
                                error!("[health] failed to publish: {e:?}");
                            } else {
                                debug!(
                                    "[health] published kernel health (uptime: {}s, machines: {}, pending alerts: {})",
                                    health.uptime_seconds, health.machines_tracked, health.pending_alerts
                                );
                            }
                        }
                    },
                    event = eventloop.poll() => {
                        if let Err(e) = event {
                            error!("[health] MQTT error: {e:?}");
                            tokio::time::sleep(Duration::from_secs(2)).await;
                        }
                    }
                }
            }
        })
    }
}
