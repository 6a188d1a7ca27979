use crate::error::{Result, SimulationError};
use serde::{Deserialize, Serialize};

/// Populations at or above this size use `population^s` instead of the exact
/// falling factorial.
pub const COMBINATORIC_THRESHOLD: f64 = 10_000.0;

/// Turns a reactant's population and stoichiometry into its factor in a reaction rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateFactorEvaluator {
    /// Ordered s-combinations of discrete molecules, for stochastic simulation.
    Combinatoric,
    /// `(population / volume)^s`, for deterministic simulation.
    Concentration,
}

impl RateFactorEvaluator {
    pub fn rate_factor(&self, population: f64, volume: f64, stoichiometry: u32) -> Result<f64> {
        if stoichiometry == 0 {
            return Err(SimulationError::config(
                "reactant stoichiometry must be positive",
            ));
        }
        Ok(self.factor(population, volume, stoichiometry))
    }

    /// `rate_factor` for a stoichiometry already known to be positive.
    pub(crate) fn factor(&self, population: f64, volume: f64, stoichiometry: u32) -> f64 {
        match self {
            RateFactorEvaluator::Combinatoric => combinatoric(population, stoichiometry),
            RateFactorEvaluator::Concentration => {
                let concentration = population / volume;
                match stoichiometry {
                    1 => concentration,
                    2 => concentration * concentration,
                    s => concentration.powi(s as i32),
                }
            }
        }
    }
}

fn combinatoric(population: f64, stoichiometry: u32) -> f64 {
    if stoichiometry == 1 {
        return population;
    }
    let s = stoichiometry as f64;
    if population < s {
        return 0.0;
    }
    if population < COMBINATORIC_THRESHOLD && population.fract() == 0.0 {
        // P! / (P - s)!
        (0..stoichiometry).map(|i| population - i as f64).product()
    } else {
        population.powi(stoichiometry as i32)
    }
}
