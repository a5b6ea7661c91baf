/**
 * CLASSIFICATEUR DE PHASE - Position d'une valeur par rapport à son seuil
 *
 * RÔLE :
 * Fonction pure (valeur, seuil, phase précédente) → (nouvelle phase, transition).
 * Aucun état caché, aucune dépendance au temps.
 *
 * FONCTIONNEMENT :
 * - Bandes : approche = seuil × 0.90, critique = seuil, sortie de cooldown = seuil × 0.95
 * - Règles évaluées dans l'ordre : critique, sortie de IN_BAND, fin de cooldown,
 *   cooldown maintenu, entrée en approche, approche maintenue, normal
 * - Un COOLDOWN stocké dont la valeur reste ≥ sortie de cooldown s'affiche IN_BAND
 *   (voir `display_phase`)
 *
 * UTILITÉ DANS TWINWATCH :
 * 🎯 Hystérésis : pas de clignotement IN_BAND/NORMAL autour du seuil
 * 🎯 Déclencheur d'alertes : seule l'entrée en IN_BAND ouvre une alerte
 */

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Normal,
    Approaching,
    InBand,
    Cooldown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Transition {
    Entering,
    Staying,
    Leaving,
    Below,
}

/// Résultat d'une classification : toujours une phase accompagnée de sa transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub phase: Phase,
    pub transition: Transition,
}

impl Classification {
    const fn new(phase: Phase, transition: Transition) -> Self {
        Self { phase, transition }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum BandsError {
    #[error("band ratio out of range (0, 1]: {0}")]
    OutOfRange(f64),
    #[error("cooldown exit ratio {exit} is below approach ratio {approach}")]
    ExitBelowApproach { approach: f64, exit: f64 },
}

/// Ratios des bandes, relatifs au seuil critique
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Bands {
    pub approach_ratio: f64,
    pub cooldown_exit_ratio: f64,
}

impl Default for Bands {
    fn default() -> Self {
        Self { approach_ratio: 0.90, cooldown_exit_ratio: 0.95 }
    }
}

/// Bornes absolues calculées pour un seuil donné
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandEdges {
    pub approach: f64,
    pub critical: f64,
    pub cooldown_exit: f64,
}

impl Bands {
    pub fn new(approach_ratio: f64, cooldown_exit_ratio: f64) -> Result<Self, BandsError> {
        let bands = Self { approach_ratio, cooldown_exit_ratio };
        bands.validate()?;
        Ok(bands)
    }

    pub fn validate(&self) -> Result<(), BandsError> {
        for ratio in [self.approach_ratio, self.cooldown_exit_ratio] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(BandsError::OutOfRange(ratio));
            }
        }
        if self.cooldown_exit_ratio < self.approach_ratio {
            return Err(BandsError::ExitBelowApproach {
                approach: self.approach_ratio,
                exit: self.cooldown_exit_ratio,
            });
        }
        Ok(())
    }

    pub fn edges(&self, threshold: f64) -> BandEdges {
        BandEdges {
            approach: threshold * self.approach_ratio,
            critical: threshold,
            cooldown_exit: threshold * self.cooldown_exit_ratio,
        }
    }

    /// Classe une valeur. Bornes inclusives : `≥` pour entrer dans une bande, `<` pour en sortir.
    pub fn classify(&self, value: f64, threshold: f64, previous: Phase) -> Classification {
        use Phase::*;
        use Transition::*;

        let edges = self.edges(threshold);

        if value >= edges.critical {
            let transition = if previous == InBand { Staying } else { Entering };
            return Classification::new(InBand, transition);
        }
        if previous == InBand {
            return Classification::new(Cooldown, Leaving);
        }
        if previous == Cooldown {
            return if value < edges.cooldown_exit {
                Classification::new(Normal, Below)
            } else {
                // stocké COOLDOWN, affiché IN_BAND
                Classification::new(Cooldown, Staying)
            };
        }
        if value >= edges.approach {
            match previous {
                Normal => return Classification::new(Approaching, Entering),
                Approaching => return Classification::new(Approaching, Staying),
                _ => {}
            }
        }
        Classification::new(Normal, Staying)
    }

    /// Phase à afficher pour une phase stockée : un COOLDOWN encore au-dessus de
    /// la sortie de cooldown reste critique à l'écran.
    pub fn display_phase(&self, stored: Phase, value: f64, threshold: f64) -> Phase {
        match stored {
            Phase::Cooldown if value >= self.edges(threshold).cooldown_exit => Phase::InBand,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Phase::*;
    use Transition::*;

    const ALL: [Phase; 4] = [Normal, Approaching, InBand, Cooldown];

    #[test]
    fn test_at_or_above_threshold_is_always_in_band() {
        let bands = Bands::default();
        for previous in ALL {
            for value in [100.0, 100.5, 250.0] {
                let c = bands.classify(value, 100.0, previous);
                assert_eq!(c.phase, InBand);
                let expected = if previous == InBand { Staying } else { Entering };
                assert_eq!(c.transition, expected, "previous {previous:?} value {value}");
            }
        }
    }

    #[test]
    fn test_leaving_in_band() {
        let bands = Bands::default();
        assert_eq!(bands.classify(99.99, 100.0, InBand), Classification::new(Cooldown, Leaving));
        assert_eq!(bands.classify(10.0, 100.0, InBand), Classification::new(Cooldown, Leaving));
    }

    #[test]
    fn test_cooldown_exit_boundary() {
        let bands = Bands::default();
        // 95.0 est exactement la sortie de cooldown : on reste en COOLDOWN
        assert_eq!(bands.classify(95.0, 100.0, Cooldown), Classification::new(Cooldown, Staying));
        assert_eq!(bands.display_phase(Cooldown, 95.0, 100.0), InBand);
        assert_eq!(bands.classify(94.99, 100.0, Cooldown), Classification::new(Normal, Below));
        assert_eq!(bands.display_phase(Cooldown, 94.99, 100.0), Cooldown);
    }

    #[test]
    fn test_approach_boundary() {
        let bands = Bands::default();
        assert_eq!(bands.classify(90.0, 100.0, Normal), Classification::new(Approaching, Entering));
        assert_eq!(bands.classify(89.99, 100.0, Normal), Classification::new(Normal, Staying));
        assert_eq!(bands.classify(95.0, 100.0, Approaching), Classification::new(Approaching, Staying));
        assert_eq!(bands.classify(50.0, 100.0, Approaching), Classification::new(Normal, Staying));
    }

    #[test]
    fn test_display_phase_passthrough() {
        let bands = Bands::default();
        assert_eq!(bands.display_phase(Normal, 99.0, 100.0), Normal);
        assert_eq!(bands.display_phase(Approaching, 99.0, 100.0), Approaching);
        assert_eq!(bands.display_phase(InBand, 101.0, 100.0), InBand);
    }

    #[test]
    fn test_scenario_sequence() {
        let bands = Bands::default();
        let mut previous = Normal;
        let mut stored = Vec::new();
        let mut displayed = Vec::new();
        let mut transitions = Vec::new();
        for value in [80.0, 92.0, 101.0, 98.0, 93.0] {
            let c = bands.classify(value, 100.0, previous);
            stored.push(c.phase);
            displayed.push(bands.display_phase(c.phase, value, 100.0));
            transitions.push(c.transition);
            previous = c.phase;
        }
        assert_eq!(stored, vec![Normal, Approaching, InBand, Cooldown, Normal]);
        assert_eq!(displayed, vec![Normal, Approaching, InBand, InBand, Normal]);
        assert_eq!(transitions, vec![Staying, Entering, Entering, Leaving, Below]);
    }

    #[test]
    fn test_bands_validation() {
        assert!(Bands::new(0.9, 0.95).is_ok());
        assert_eq!(Bands::new(0.0, 0.95), Err(BandsError::OutOfRange(0.0)));
        assert_eq!(Bands::new(0.9, 1.2), Err(BandsError::OutOfRange(1.2)));
        assert!(matches!(Bands::new(0.95, 0.9), Err(BandsError::ExitBelowApproach { .. })));
    }
}
