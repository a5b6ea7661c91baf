/**
 * MODÈLES TWINWATCH - Machines, lectures télémétrie et alertes
 *
 * RÔLE : Types partagés entre kernel, console et simulateur.
 * Le format JSON (camelCase) est celui consommé par le dashboard.
 *
 * UTILITÉ : Catalogue des paramètres par type de machine (clé, libellé, unité).
 */

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineType {
    Cnc,
    Hydraulic,
    Furnace,
    RoboticArm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineStatus {
    Active,
    Idle,
    Maintenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    Engineer,
    Maintenance,
}

impl Role {
    pub fn is_admin(self) -> bool {
        matches!(self, Role::Admin)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub id: String,
    pub name: String,
    pub model_name: String,
    #[serde(rename = "type")]
    pub machine_type: MachineType,
    pub status: MachineStatus,
    pub thresholds: HashMap<String, f64>,
    #[serde(default)]
    pub assigned_to: Vec<String>,     // user ids autorisés (non-admin)
}

/// Lecture brute d'un paramètre. Éphémère, jamais persistée.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterReading {
    pub key: String,
    pub value: f64,
    #[serde(with = "time::serde::rfc3339", default = "OffsetDateTime::now_utc")]
    pub timestamp: OffsetDateTime,
}

impl ParameterReading {
    pub fn new(key: impl Into<String>, value: f64) -> Self {
        Self { key: key.into(), value, timestamp: OffsetDateTime::now_utc() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    Pending,
    Resolved,
    Unresolved,
}

impl AlertStatus {
    /// RESOLVED et UNRESOLVED sont terminaux pour une instance d'alerte
    pub fn is_terminal(self) -> bool {
        !matches!(self, AlertStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub machine_id: String,
    pub parameter_key: String,
    pub alert_type: AlertType,
    pub message: String,
    pub status: AlertStatus,
    #[serde(default)]
    pub resolved_by_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub resolved_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Entrée du catalogue : un paramètre surveillé pour un type de machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterSpec {
    pub key: &'static str,
    pub label: &'static str,
    pub unit: &'static str,
}

const fn spec(key: &'static str, label: &'static str, unit: &'static str) -> ParameterSpec {
    ParameterSpec { key, label, unit }
}

const COMMON: &[ParameterSpec] = &[
    spec("temperature", "Temp", "°C"),
    spec("vibration", "Vibration", "mm/s"),
    spec("power", "Power", "kW"),
];

const CNC: &[ParameterSpec] = &[
    spec("rpmMax", "RPM", "rpm"),
    spec("torqueMax", "Torque", "Nm"),
];

const HYDRAULIC: &[ParameterSpec] = &[
    spec("pressureMax", "Pressure", "bar"),
    spec("flowRateMax", "Flow", "L/min"),
    spec("oilLevelMax", "Oil Lvl", "%"),
    spec("oilTemperatureMax", "Oil Temp", "°C"),
    spec("motorCurrentMax", "Current", "A"),
];

const FURNACE: &[ParameterSpec] = &[
    spec("pressureMax", "Pressure", "bar"),
    spec("fuelFlowMax", "Fuel", "L/h"),
    spec("exhaustTemperatureMax", "Exhaust", "°C"),
];

const ROBOTIC_ARM: &[ParameterSpec] = &[
    spec("jointTorqueMax", "J.Torque", "Nm"),
    spec("currentMax", "Current", "A"),
    spec("cycleCountMax", "Cycles", ""),
];

impl MachineType {
    fn specific_parameters(self) -> &'static [ParameterSpec] {
        match self {
            MachineType::Cnc => CNC,
            MachineType::Hydraulic => HYDRAULIC,
            MachineType::Furnace => FURNACE,
            MachineType::RoboticArm => ROBOTIC_ARM,
        }
    }

    /// Paramètres communs puis spécifiques au type, dans l'ordre d'affichage
    pub fn parameters(self) -> impl Iterator<Item = &'static ParameterSpec> {
        COMMON.iter().chain(self.specific_parameters().iter())
    }

    pub fn parameter(self, key: &str) -> Option<&'static ParameterSpec> {
        self.parameters().find(|p| p.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalogue_per_type() {
        let keys: Vec<_> = MachineType::Hydraulic.parameters().map(|p| p.key).collect();
        assert_eq!(keys.len(), 8);
        assert_eq!(&keys[..3], &["temperature", "vibration", "power"]);
        assert!(MachineType::Cnc.parameter("rpmMax").is_some());
        assert!(MachineType::Cnc.parameter("oilLevelMax").is_none());
        assert_eq!(MachineType::Furnace.parameter("fuelFlowMax").map(|p| p.unit), Some("L/h"));
    }

    #[test]
    fn test_alert_json_shape() {
        let alert = Alert {
            id: "a1".into(),
            machine_id: "m1".into(),
            parameter_key: "temperature".into(),
            alert_type: AlertType::Warning,
            message: "hot".into(),
            status: AlertStatus::Pending,
            resolved_by_id: None,
            resolved_at: None,
            reason: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
        };
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["machineId"], "m1");
        assert_eq!(json["alertType"], "WARNING");
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["createdAt"], "1970-01-01T00:00:00Z");

        let back: Alert = serde_json::from_value(json).unwrap();
        assert_eq!(back, alert);
    }

    #[test]
    fn test_machine_type_wire_names() {
        assert_eq!(serde_json::to_string(&MachineType::RoboticArm).unwrap(), "\"ROBOTIC_ARM\"");
        assert_eq!(serde_json::to_string(&MachineType::Cnc).unwrap(), "\"CNC\"");
        assert!(!AlertStatus::Pending.is_terminal());
        assert!(AlertStatus::Unresolved.is_terminal());
    }
}
