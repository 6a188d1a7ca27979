//! Gillespie's direct method, with delayed reactions completing from their solvers'
//! queues.

use super::stochastic::{exponential_wait, EventSelector, StochasticEngine, Trial};
use super::{Algorithm, Simulator};
use crate::control::Supervision;
use crate::error::Result;
use crate::model::CompiledModel;
use crate::parameters::SimulatorParameters;
use crate::results::SimulationResults;
use rand::Rng;
use std::sync::Arc;

pub struct GillespieDirect {
    engine: StochasticEngine,
}

impl Default for GillespieDirect {
    fn default() -> Self {
        Self::new()
    }
}

impl GillespieDirect {
    pub fn new() -> Self {
        Self {
            engine: StochasticEngine::new(),
        }
    }
}

impl Simulator for GillespieDirect {
    fn alias(&self) -> &'static str {
        Algorithm::GillespieDirect.alias()
    }

    fn initialize(&mut self, model: Arc<CompiledModel>) -> Result<()> {
        self.engine.initialize(Algorithm::GillespieDirect.alias(), model);
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.engine.is_initialized()
    }

    fn default_parameters(&self) -> SimulatorParameters {
        StochasticEngine::default_parameters()
    }

    fn check_simulation_parameters(&self, parameters: &SimulatorParameters) -> Result<()> {
        StochasticEngine::check_parameters(parameters)
    }

    fn simulate(
        &mut self,
        start_time: f64,
        end_time: f64,
        parameters: &SimulatorParameters,
        num_time_points: usize,
        requested_symbols: &[&str],
    ) -> Result<SimulationResults> {
        self.engine.simulate::<DirectMethod>(
            Algorithm::GillespieDirect.alias(),
            start_time,
            end_time,
            parameters,
            num_time_points,
            requested_symbols,
        )
    }

    fn supervision_mut(&mut self) -> &mut Supervision {
        &mut self.engine.supervision
    }
}

/// Draws the waiting time from the total propensity, then the reaction.
pub(crate) struct DirectMethod;

impl EventSelector for DirectMethod {
    fn for_model(_model: &CompiledModel) -> Self {
        DirectMethod
    }

    fn start_trial<R: Rng + ?Sized>(&mut self, _trial: &mut Trial<'_>, _rng: &mut R) -> Result<()> {
        Ok(())
    }

    fn next_event<R: Rng + ?Sized>(
        &mut self,
        trial: &mut Trial<'_>,
        rng: &mut R,
    ) -> Result<Option<(f64, usize)>> {
        let total = trial.compute_propensities()?;
        let next_time = if total > 0.0 {
            trial.time + exponential_wait(total, rng)
        } else {
            f64::INFINITY
        };
        if let Some(completion) = trial.take_completion_before(next_time) {
            return Ok(Some(completion));
        }
        if total > 0.0 {
            let reaction = select_reaction(&trial.propensities, rng.gen::<f64>() * total);
            Ok(Some((next_time, reaction)))
        } else {
            Ok(None)
        }
    }

    fn reaction_fired<R: Rng + ?Sized>(
        &mut self,
        _trial: &mut Trial<'_>,
        _reaction: usize,
        _rng: &mut R,
    ) -> Result<()> {
        Ok(())
    }
}

/// Scans from the last reaction backwards until the cumulative propensity reaches
/// `threshold`. Zero propensities are skipped so they can never be selected.
fn select_reaction(propensities: &[f64], threshold: f64) -> usize {
    let mut cumulative = 0.0;
    let mut lowest_positive = 0;
    for (index, propensity) in propensities.iter().enumerate().rev() {
        if *propensity > 0.0 {
            cumulative += propensity;
            if cumulative >= threshold {
                return index;
            }
            lowest_positive = index;
        }
    }
    lowest_positive
}
