//! Simulation algorithms behind one trait.
//!
//! Every simulator is initialized against a shared [`CompiledModel`] and then runs any
//! number of `simulate` calls. All per-run state (value arrays, delayed-reaction
//! queues and histories, evaluation caches) is created inside `simulate`, so the model
//! itself is never written to and can be shared between threads.

mod common;
mod gibson_bruck;
mod gillespie;
mod runge_kutta;
mod stochastic;

pub use gibson_bruck::GibsonBruck;
pub use gillespie::GillespieDirect;
pub use runge_kutta::{NetworkRhs, RungeKuttaSimulator, StepControl};

use crate::control::{SimulationController, SimulationProgressReporter, Supervision};
use crate::error::{Result, SimulationError};
use crate::model::CompiledModel;
use crate::parameters::SimulatorParameters;
use crate::results::SimulationResults;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub trait Simulator {
    fn alias(&self) -> &'static str;

    /// Binds the simulator to `model`. Must precede `simulate`; call again after the
    /// model changes.
    fn initialize(&mut self, model: Arc<CompiledModel>) -> Result<()>;

    fn is_initialized(&self) -> bool;

    fn default_parameters(&self) -> SimulatorParameters;

    /// Fails fast when a parameter this algorithm needs is missing or out of range.
    fn check_simulation_parameters(&self, parameters: &SimulatorParameters) -> Result<()>;

    /// Runs from `start_time` to `end_time`, sampling `requested_symbols` at
    /// `num_time_points` evenly spaced times (both ends included).
    fn simulate(
        &mut self,
        start_time: f64,
        end_time: f64,
        parameters: &SimulatorParameters,
        num_time_points: usize,
        requested_symbols: &[&str],
    ) -> Result<SimulationResults>;

    fn supervision_mut(&mut self) -> &mut Supervision;

    fn set_controller(&mut self, controller: Arc<SimulationController>) {
        self.supervision_mut().controller = Some(controller);
    }

    fn set_progress_reporter(&mut self, reporter: Arc<SimulationProgressReporter>) {
        self.supervision_mut().reporter = Some(reporter);
    }

    /// Minimum wall-clock time between status checkpoints.
    fn set_status_update_interval(&mut self, interval: Duration) {
        self.supervision_mut().update_interval = interval;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    GillespieDirect,
    GibsonBruck,
    RungeKuttaFixed,
    RungeKuttaAdaptive,
}

impl Algorithm {
    pub const ALL: [Algorithm; 4] = [
        Algorithm::GillespieDirect,
        Algorithm::GibsonBruck,
        Algorithm::RungeKuttaFixed,
        Algorithm::RungeKuttaAdaptive,
    ];

    pub fn alias(&self) -> &'static str {
        match self {
            Algorithm::GillespieDirect => "gillespie-direct",
            Algorithm::GibsonBruck => "gibson-bruck",
            Algorithm::RungeKuttaFixed => "ODE-RK5-fixed",
            Algorithm::RungeKuttaAdaptive => "ODE-RK5-adaptive",
        }
    }

    pub fn from_alias(alias: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|algorithm| algorithm.alias() == alias)
            .ok_or_else(|| SimulationError::config(format!("unknown simulator alias \"{alias}\"")))
    }

    pub fn is_stochastic(&self) -> bool {
        matches!(self, Algorithm::GillespieDirect | Algorithm::GibsonBruck)
    }

    pub fn build(&self) -> SimulatorKind {
        match self {
            Algorithm::GillespieDirect => SimulatorKind::Gillespie(GillespieDirect::new()),
            Algorithm::GibsonBruck => SimulatorKind::GibsonBruck(GibsonBruck::new()),
            Algorithm::RungeKuttaFixed => {
                SimulatorKind::RungeKutta(RungeKuttaSimulator::new(StepControl::Fixed))
            }
            Algorithm::RungeKuttaAdaptive => {
                SimulatorKind::RungeKutta(RungeKuttaSimulator::new(StepControl::Adaptive))
            }
        }
    }
}

/// Any of the built-in simulators.
pub enum SimulatorKind {
    Gillespie(GillespieDirect),
    GibsonBruck(GibsonBruck),
    RungeKutta(RungeKuttaSimulator),
}

impl SimulatorKind {
    fn inner(&self) -> &dyn Simulator {
        match self {
            SimulatorKind::Gillespie(simulator) => simulator,
            SimulatorKind::GibsonBruck(simulator) => simulator,
            SimulatorKind::RungeKutta(simulator) => simulator,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Simulator {
        match self {
            SimulatorKind::Gillespie(simulator) => simulator,
            SimulatorKind::GibsonBruck(simulator) => simulator,
            SimulatorKind::RungeKutta(simulator) => simulator,
        }
    }
}

impl Simulator for SimulatorKind {
    fn alias(&self) -> &'static str {
        self.inner().alias()
    }

    fn initialize(&mut self, model: Arc<CompiledModel>) -> Result<()> {
        self.inner_mut().initialize(model)
    }

    fn is_initialized(&self) -> bool {
        self.inner().is_initialized()
    }

    fn default_parameters(&self) -> SimulatorParameters {
        self.inner().default_parameters()
    }

    fn check_simulation_parameters(&self, parameters: &SimulatorParameters) -> Result<()> {
        self.inner().check_simulation_parameters(parameters)
    }

    fn simulate(
        &mut self,
        start_time: f64,
        end_time: f64,
        parameters: &SimulatorParameters,
        num_time_points: usize,
        requested_symbols: &[&str],
    ) -> Result<SimulationResults> {
        self.inner_mut().simulate(
            start_time,
            end_time,
            parameters,
            num_time_points,
            requested_symbols,
        )
    }

    fn supervision_mut(&mut self) -> &mut Supervision {
        self.inner_mut().supervision_mut()
    }
}
