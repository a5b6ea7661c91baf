/**
 * SESSION TÉLÉMÉTRIE MACHINE - Agrégation par machine des classifications
 *
 * RÔLE :
 * Pour une machine : dernière phase par paramètre, fenêtre glissante des valeurs
 * récentes (affichage seulement) et statut machine (ACTIVE / IDLE / MAINTENANCE).
 *
 * FONCTIONNEMENT :
 * - `apply_batch` classe chaque lecture, rejette les lectures invalides sans
 *   interrompre les autres, et produit UN MachineUpdate par tick
 * - Chaque paramètre IN_BAND du tick est remonté comme `Breach` (l'ouverture
 *   d'alerte et la suppression des doublons sont gérées par AlertLifecycle)
 * - Sortir de IN_BAND ne résout jamais une alerte
 * - Statut : IDLE → ACTIVE à la reprise du flux, ACTIVE → IDLE après inactivité,
 *   MAINTENANCE après N ticks critiques consécutifs (optionnel, jamais quitté seul)
 *
 * UTILITÉ DANS TWINWATCH :
 * 🎯 Une session = un verrou : les ticks d'une même machine sont sérialisés
 * 🎯 Historique borné (30 points) pour la continuité des graphiques
 */

use crate::models::{MachineStatus, MachineType, ParameterReading};
use crate::phase::{Bands, Phase, Transition};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};
use time::OffsetDateTime;

/// Erreurs de lecture : loggées, la lecture fautive est ignorée
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReadingError {
    #[error("malformed reading for {key}: {value}")]
    Malformed { key: String, value: f64 },
    #[error("unknown parameter key: {0}")]
    UnknownParameter(String),
    #[error("no threshold configured for {0}")]
    MissingThreshold(String),
}

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub history_limit: usize,
    pub maintenance_after_ticks: Option<u32>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self { history_limit: 30, maintenance_after_ticks: None }
    }
}

/// État d'un paramètre dans l'événement machine_update
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricUpdate {
    pub value: f64,
    pub phase: Phase,
    pub display_phase: Phase,
    pub transition: Transition,
    pub threshold: f64,
}

/// Événement agrégé émis à chaque tick d'une machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineUpdate {
    pub machine_id: String,
    pub status: MachineStatus,
    pub metrics: BTreeMap<String, MetricUpdate>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatusChanged {
    pub machine_id: String,
    pub status: MachineStatus,
    pub streaming: bool,
}

/// Paramètre en bande critique pendant ce tick
#[derive(Debug, Clone, PartialEq)]
pub struct Breach {
    pub key: String,
    pub value: f64,
    pub threshold: f64,
    pub transition: Transition,
}

#[derive(Debug)]
pub struct TickOutcome {
    pub update: MachineUpdate,
    pub breaches: Vec<Breach>,
    pub rejected: Vec<ReadingError>,
    pub status_change: Option<MachineStatusChanged>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplePoint {
    pub value: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone)]
struct ParameterState {
    phase: Phase,
    last: Option<MetricUpdate>,
    history: VecDeque<SamplePoint>,
}

impl Default for ParameterState {
    fn default() -> Self {
        Self { phase: Phase::Normal, last: None, history: VecDeque::new() }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSnapshot {
    pub phase: Phase,
    pub last: Option<MetricUpdate>,
    pub history: Vec<SamplePoint>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub machine_id: String,
    pub status: MachineStatus,
    pub streaming: bool,
    pub parameters: BTreeMap<String, ParameterSnapshot>,
}

pub struct MachineSession {
    machine_id: String,
    machine_type: MachineType,
    status: MachineStatus,
    streaming: bool,
    last_seen: Option<Instant>,
    breach_streak: u32,
    parameters: HashMap<String, ParameterState>,
    settings: SessionSettings,
}

impl MachineSession {
    pub fn new(
        machine_id: impl Into<String>,
        machine_type: MachineType,
        status: MachineStatus,
        settings: SessionSettings,
    ) -> Self {
        Self {
            machine_id: machine_id.into(),
            machine_type,
            status,
            streaming: false,
            last_seen: None,
            breach_streak: 0,
            parameters: HashMap::new(),
            settings,
        }
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn status(&self) -> MachineStatus {
        self.status
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Phase stockée d'un paramètre (NORMAL si jamais vu)
    pub fn phase(&self, key: &str) -> Phase {
        self.parameters.get(key).map(|p| p.phase).unwrap_or(Phase::Normal)
    }

    fn validate(
        &self,
        reading: &ParameterReading,
        thresholds: &HashMap<String, f64>,
    ) -> Result<f64, ReadingError> {
        if !reading.value.is_finite() || reading.value < 0.0 {
            return Err(ReadingError::Malformed { key: reading.key.clone(), value: reading.value });
        }
        if self.machine_type.parameter(&reading.key).is_none() {
            return Err(ReadingError::UnknownParameter(reading.key.clone()));
        }
        thresholds
            .get(&reading.key)
            .copied()
            .filter(|t| t.is_finite() && *t >= 0.0)
            .ok_or_else(|| ReadingError::MissingThreshold(reading.key.clone()))
    }

    /// Traite un lot de lectures. Les lectures d'un même lot sont appliquées dans l'ordre.
    pub fn apply_batch(
        &mut self,
        readings: &[ParameterReading],
        thresholds: &HashMap<String, f64>,
        bands: &Bands,
        now: Instant,
    ) -> TickOutcome {
        let mut metrics = BTreeMap::new();
        let mut breaches = Vec::new();
        let mut rejected = Vec::new();

        for reading in readings {
            let threshold = match self.validate(reading, thresholds) {
                Ok(t) => t,
                Err(e) => {
                    rejected.push(e);
                    continue;
                }
            };

            let limit = self.settings.history_limit;
            let state = self.parameters.entry(reading.key.clone()).or_default();
            let c = bands.classify(reading.value, threshold, state.phase);
            let metric = MetricUpdate {
                value: reading.value,
                phase: c.phase,
                display_phase: bands.display_phase(c.phase, reading.value, threshold),
                transition: c.transition,
                threshold,
            };

            state.phase = c.phase;
            state.last = Some(metric);
            state.history.push_back(SamplePoint { value: reading.value, timestamp: reading.timestamp });
            while state.history.len() > limit {
                state.history.pop_front();
            }

            if c.phase == Phase::InBand {
                breaches.push(Breach {
                    key: reading.key.clone(),
                    value: reading.value,
                    threshold,
                    transition: c.transition,
                });
            }
            metrics.insert(reading.key.clone(), metric);
        }

        let status_change = if metrics.is_empty() {
            None
        } else {
            self.last_seen = Some(now);
            self.track_status(!breaches.is_empty())
        };

        TickOutcome {
            update: MachineUpdate {
                machine_id: self.machine_id.clone(),
                status: self.status,
                metrics,
                timestamp: OffsetDateTime::now_utc(),
            },
            breaches,
            rejected,
            status_change,
        }
    }

    fn track_status(&mut self, breached: bool) -> Option<MachineStatusChanged> {
        let before = (self.status, self.streaming);

        self.streaming = true;
        self.breach_streak = if breached { self.breach_streak.saturating_add(1) } else { 0 };

        if self.status == MachineStatus::Idle {
            self.status = MachineStatus::Active;
        }
        if let Some(limit) = self.settings.maintenance_after_ticks {
            if self.breach_streak >= limit && self.status != MachineStatus::Maintenance {
                self.status = MachineStatus::Maintenance;
            }
        }

        (before != (self.status, self.streaming)).then(|| self.status_event())
    }

    /// Passe la machine en IDLE si aucune télémétrie depuis `idle_after`
    pub fn check_idle(&mut self, now: Instant, idle_after: Duration) -> Option<MachineStatusChanged> {
        let last_seen = self.last_seen?;
        if !self.streaming || now.saturating_duration_since(last_seen) < idle_after {
            return None;
        }
        self.streaming = false;
        self.breach_streak = 0;
        if self.status == MachineStatus::Active {
            self.status = MachineStatus::Idle;
        }
        Some(self.status_event())
    }

    pub fn status_event(&self) -> MachineStatusChanged {
        MachineStatusChanged {
            machine_id: self.machine_id.clone(),
            status: self.status,
            streaming: self.streaming,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            machine_id: self.machine_id.clone(),
            status: self.status,
            streaming: self.streaming,
            parameters: self
                .parameters
                .iter()
                .map(|(key, state)| {
                    (key.clone(), ParameterSnapshot {
                        phase: state.phase,
                        last: state.last,
                        history: state.history.iter().copied().collect(),
                    })
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> HashMap<String, f64> {
        HashMap::from([
            ("temperature".to_string(), 100.0),
            ("vibration".to_string(), 10.0),
        ])
    }

    fn session(settings: SessionSettings) -> MachineSession {
        MachineSession::new("m1", MachineType::Cnc, MachineStatus::Active, settings)
    }

    #[test]
    fn test_batch_aggregates_one_update() {
        let mut s = session(SessionSettings::default());
        let out = s.apply_batch(
            &[ParameterReading::new("temperature", 92.0), ParameterReading::new("vibration", 3.0)],
            &thresholds(),
            &Bands::default(),
            Instant::now(),
        );
        assert_eq!(out.update.metrics.len(), 2);
        assert_eq!(out.update.metrics["temperature"].phase, Phase::Approaching);
        assert_eq!(out.update.metrics["vibration"].phase, Phase::Normal);
        assert!(out.breaches.is_empty());
        assert!(out.rejected.is_empty());
    }

    #[test]
    fn test_invalid_readings_are_dropped_not_fatal() {
        let mut s = session(SessionSettings::default());
        let out = s.apply_batch(
            &[
                ParameterReading::new("temperature", f64::NAN),
                ParameterReading::new("vibration", -1.0),
                ParameterReading::new("oilLevelMax", 5.0),
                ParameterReading::new("power", 5.0),
                ParameterReading::new("temperature", 120.0),
            ],
            &thresholds(),
            &Bands::default(),
            Instant::now(),
        );
        assert_eq!(out.rejected.len(), 4);
        assert!(matches!(out.rejected[2], ReadingError::UnknownParameter(ref k) if k == "oilLevelMax"));
        assert_eq!(out.rejected[3], ReadingError::MissingThreshold("power".into()));
        assert_eq!(out.update.metrics.len(), 1);
        assert_eq!(out.breaches.len(), 1);
        assert_eq!(out.breaches[0].transition, Transition::Entering);
    }

    #[test]
    fn test_every_in_band_tick_reports_breach() {
        let mut s = session(SessionSettings::default());
        let t = thresholds();
        let bands = Bands::default();
        let now = Instant::now();
        let first = s.apply_batch(&[ParameterReading::new("temperature", 101.0)], &t, &bands, now);
        let second = s.apply_batch(&[ParameterReading::new("temperature", 105.0)], &t, &bands, now);
        assert_eq!(first.breaches[0].transition, Transition::Entering);
        assert_eq!(second.breaches[0].transition, Transition::Staying);
        let third = s.apply_batch(&[ParameterReading::new("temperature", 98.0)], &t, &bands, now);
        assert!(third.breaches.is_empty());
        assert_eq!(third.update.metrics["temperature"].phase, Phase::Cooldown);
        assert_eq!(third.update.metrics["temperature"].display_phase, Phase::InBand);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut s = session(SessionSettings { history_limit: 3, maintenance_after_ticks: None });
        let t = thresholds();
        for i in 0..10 {
            s.apply_batch(&[ParameterReading::new("temperature", i as f64)], &t, &Bands::default(), Instant::now());
        }
        let snap = s.snapshot();
        let values: Vec<f64> = snap.parameters["temperature"].history.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_idle_and_resume() {
        let mut s = MachineSession::new("m1", MachineType::Cnc, MachineStatus::Idle, SessionSettings::default());
        let t0 = Instant::now();
        assert!(s.check_idle(t0, Duration::from_secs(60)).is_none());

        let out = s.apply_batch(&[ParameterReading::new("temperature", 20.0)], &thresholds(), &Bands::default(), t0);
        let change = out.status_change.unwrap();
        assert_eq!(change.status, MachineStatus::Active);
        assert!(change.streaming);

        assert!(s.check_idle(t0 + Duration::from_secs(30), Duration::from_secs(60)).is_none());
        let idle = s.check_idle(t0 + Duration::from_secs(61), Duration::from_secs(60)).unwrap();
        assert_eq!(idle.status, MachineStatus::Idle);
        assert!(!idle.streaming);
        // déjà idle : pas de second événement
        assert!(s.check_idle(t0 + Duration::from_secs(120), Duration::from_secs(60)).is_none());
    }

    #[test]
    fn test_sustained_breach_moves_to_maintenance() {
        let mut s = session(SessionSettings { history_limit: 30, maintenance_after_ticks: Some(3) });
        let t = thresholds();
        let bands = Bands::default();
        let now = Instant::now();
        let mut changes = Vec::new();
        for _ in 0..4 {
            let out = s.apply_batch(&[ParameterReading::new("temperature", 110.0)], &t, &bands, now);
            changes.push(out.status_change);
        }
        // premier tick : streaming passe à true
        assert!(changes[0].is_some());
        assert!(changes[1].is_none());
        assert_eq!(changes[2].as_ref().map(|c| c.status), Some(MachineStatus::Maintenance));
        assert!(changes[3].is_none());

        let out = s.apply_batch(&[ParameterReading::new("temperature", 10.0)], &t, &bands, now);
        assert_eq!(out.update.status, MachineStatus::Maintenance);
    }
}
