use crate::models::{Machine, MachineStatus, MachineType};
use crate::phase::Bands;
use crate::router::OverflowPolicy;
use crate::session::SessionSettings;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path};
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub mqtt: MqttConf,
    pub http: HttpConf,
    pub bands: Bands,
    pub session: SessionConf,
    pub alerts: AlertsConf,
    pub router: RouterConf,
    pub machines: HashMap<String, MachineConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,        // ex: "0.0.0.0:8080"
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConf {
    pub history_limit: usize,
    pub idle_after_secs: u64,
    pub idle_check_secs: u64,
    pub maintenance_after_ticks: Option<u32>,   // None = jamais automatique
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AlertsConf {
    pub error_ratio: f64,     // ERROR si valeur ≥ seuil × error_ratio
    pub store_path: String,
    pub write_queue_capacity: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RouterConf {
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MachineConf {
    pub name: String,
    pub model_name: String,
    #[serde(rename = "type")]
    pub machine_type: MachineType,
    #[serde(default = "default_status")]
    pub status: MachineStatus,
    #[serde(default)]
    pub thresholds: HashMap<String, f64>,
    #[serde(default)]
    pub assigned_to: Vec<String>,
}

fn default_status() -> MachineStatus {
    MachineStatus::Active
}

impl MachineConf {
    pub fn to_machine(&self, id: &str) -> Machine {
        Machine {
            id: id.to_string(),
            name: self.name.clone(),
            model_name: self.model_name.clone(),
            machine_type: self.machine_type,
            status: self.status,
            thresholds: self.thresholds.clone(),
            assigned_to: self.assigned_to.clone(),
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConf::default(),
            http: HttpConf::default(),
            bands: Bands::default(),
            session: SessionConf::default(),
            alerts: AlertsConf::default(),
            router: RouterConf::default(),
            machines: HashMap::new(),
        }
    }
}

impl Default for MqttConf {
    fn default() -> Self {
        Self { host: "localhost".into(), port: 1883 }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

impl Default for SessionConf {
    fn default() -> Self {
        Self { history_limit: 30, idle_after_secs: 60, idle_check_secs: 10, maintenance_after_ticks: None }
    }
}

impl Default for AlertsConf {
    fn default() -> Self {
        Self { error_ratio: 1.10, store_path: "./data/alerts.json".into(), write_queue_capacity: 1024 }
    }
}

impl Default for RouterConf {
    fn default() -> Self {
        Self { queue_capacity: 64, overflow: OverflowPolicy::DropOldest }
    }
}

impl SessionConf {
    pub fn settings(&self) -> SessionSettings {
        SessionSettings {
            history_limit: self.history_limit.max(1),
            maintenance_after_ticks: self.maintenance_after_ticks,
        }
    }
}

impl KernelConfig {
    /// Parse + validation. Des bandes incohérentes sont remplacées par les valeurs par défaut.
    pub fn from_yaml(txt: &str) -> Result<Self, serde_yaml::Error> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        let mut cfg: KernelConfig = serde_yaml::from_str(txt)?;
        if let Err(e) = cfg.bands.validate() {
            warn!("bands invalides ({e}), usage des bandes par défaut");
            cfg.bands = Bands::default();
        }
        // ≤ 1.0 : toute alerte serait ERROR
        if !(cfg.alerts.error_ratio.is_finite() && cfg.alerts.error_ratio > 1.0) {
            let fallback = AlertsConf::default().error_ratio;
            warn!("alerts.error_ratio invalide ({}), usage de {fallback}", cfg.alerts.error_ratio);
            cfg.alerts.error_ratio = fallback;
        }
        Ok(cfg)
    }
}

/// Chemin de la config : TWINWATCH_CONFIG ou ./twinwatch.yaml
pub fn config_path() -> String {
    std::env::var("TWINWATCH_CONFIG").unwrap_or_else(|_| "twinwatch.yaml".into())
}

pub async fn load_config() -> KernelConfig {
    let path = config_path();
    if !Path::new(&path).exists() {
        warn!("pas de {path}, usage config par défaut");
        return KernelConfig::default();
    }
    let txt = fs::read_to_string(&path).await.unwrap_or_default();
    match KernelConfig::from_yaml(&txt) {
        Ok(cfg) => {
            info!("config chargée depuis {path} ({} machines)", cfg.machines.len());
            cfg
        }
        Err(e) => {
            warn!("config invalide: {e}");
            KernelConfig::default()
        }
    }
}
