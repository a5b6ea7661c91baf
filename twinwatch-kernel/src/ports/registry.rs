use super::{MachineRegistry, PortError};
use crate::config::KernelConfig;
use crate::models::{Machine, MachineStatus};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Registre machines en mémoire, initialisé depuis la section `machines` de la config.
/// Les changements de statut ne survivent pas au redémarrage.
pub struct ConfigRegistry {
    machines: RwLock<HashMap<String, Machine>>,
}

impl ConfigRegistry {
    pub fn new(machines: impl IntoIterator<Item = Machine>) -> Self {
        Self {
            machines: RwLock::new(machines.into_iter().map(|m| (m.id.clone(), m)).collect()),
        }
    }

    pub fn from_config(cfg: &KernelConfig) -> Self {
        Self::new(cfg.machines.iter().map(|(id, conf)| conf.to_machine(id)))
    }
}

impl MachineRegistry for ConfigRegistry {
    fn machine(&self, machine_id: &str) -> Result<Machine, PortError> {
        self.machines
            .read()
            .get(machine_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(machine_id.to_string()))
    }

    fn thresholds(&self, machine_id: &str) -> Result<HashMap<String, f64>, PortError> {
        self.machines
            .read()
            .get(machine_id)
            .map(|m| m.thresholds.clone())
            .ok_or_else(|| PortError::NotFound(machine_id.to_string()))
    }

    fn set_status(&self, machine_id: &str, status: MachineStatus) -> Result<(), PortError> {
        let mut machines = self.machines.write();
        let machine = machines
            .get_mut(machine_id)
            .ok_or_else(|| PortError::NotFound(machine_id.to_string()))?;
        machine.status = status;
        Ok(())
    }

    fn list(&self) -> Vec<Machine> {
        let mut list: Vec<Machine> = self.machines.read().values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }
}
