//! Deterministic integration of the reaction rate equations with RK4, either at a
//! fixed step or with step-doubling error control.

use super::common::{
    build_solvers, reaction_rate, resolve_requested, sample_symbols, time_points, Recorder,
    RunProgress,
};
use super::{Algorithm, Simulator};
use crate::control::Supervision;
use crate::delayed::{DelayedReactionSolver, DEFAULT_NUM_HISTORY_BINS};
use crate::error::{Result, SimulationError};
use crate::evaluator::EvaluationScratch;
use crate::model::CompiledModel;
use crate::parameters::SimulatorParameters;
use crate::rate_factor::RateFactorEvaluator;
use crate::results::SimulationResults;
use crate::solvers::{StepDoubling, StepError, RK4};
use crate::traits::DynamicalSystem;
use log::{debug, info, warn};
use std::cell::{Cell, RefCell};
use std::sync::Arc;

const SAFETY: f64 = 0.9;
const PGROW: f64 = -0.20;
const PSHRINK: f64 = -0.25;
/// Below this error ratio the next step grows fourfold.
const ERRCON: f64 = 6.0e-4;
const MAX_STEP_RETRIES: u32 = 100;
/// Fixed-step runs check their accuracy on every n-th step.
const FIXED_STEP_CHECK_INTERVAL: u64 = 10;

const DEFAULT_STEP_SIZE_FRACTION: f64 = 0.001;
const DEFAULT_MAX_RELATIVE_ERROR: f64 = 1.0e-4;
const DEFAULT_MAX_ABSOLUTE_ERROR: f64 = 0.01;

/// The rate equations of a compiled model, `dx/dt = S^T v(t, x)`.
///
/// Delayed reactions contribute the production rate of their deterministic solvers,
/// which only know the past after [`NetworkRhs::update_histories`] has been called.
pub struct NetworkRhs<'a> {
    model: &'a CompiledModel,
    solvers: Vec<DelayedReactionSolver>,
    scratch: RefCell<EvaluationScratch>,
    generation: Cell<u64>,
}

impl<'a> NetworkRhs<'a> {
    pub fn new(model: &'a CompiledModel, num_history_bins: usize) -> Result<Self> {
        Ok(Self {
            model,
            solvers: build_solvers(model, num_history_bins, false)?,
            scratch: RefCell::new(EvaluationScratch::new()),
            generation: Cell::new(0),
        })
    }

    /// Appends the reactant concentration of every delayed reaction at `time`.
    pub fn update_histories(&mut self, time: f64, state: &[f64]) -> Result<()> {
        let generation = self.generation.get() + 1;
        self.generation.set(generation);
        let evaluator = self.model.evaluator(state, time, generation);
        let scratch = self.scratch.get_mut();
        for solver in &mut self.solvers {
            let reactant = evaluator.value(solver.reaction().reactant, scratch);
            let volume = evaluator.value(solver.reaction().reactant_volume, scratch);
            solver.update(time, reactant / volume)?;
        }
        Ok(())
    }
}

impl DynamicalSystem<f64> for NetworkRhs<'_> {
    fn dimension(&self) -> usize {
        self.model.num_dynamic()
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
        let generation = self.generation.get() + 1;
        self.generation.set(generation);
        let evaluator = self.model.evaluator(x, t, generation);
        let mut scratch = self.scratch.borrow_mut();
        let stoichiometry = self.model.stoichiometry();
        out.fill(0.0);
        for (index, reaction) in self.model.reactions().iter().enumerate() {
            let velocity = reaction_rate(
                reaction,
                &evaluator,
                &mut scratch,
                RateFactorEvaluator::Concentration,
                &self.solvers,
            );
            if velocity == 0.0 {
                continue;
            }
            let row = stoichiometry.row(index);
            for (&species, &delta) in row.col_indices().iter().zip(row.values()) {
                out[species] += delta * velocity;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepControl {
    /// Constant step, checked for accuracy every tenth step.
    Fixed,
    /// Step size adapted to the estimated local error.
    Adaptive,
}

/// Configured error maxima; a missing maximum never limits the step.
#[derive(Debug, Clone, Copy)]
struct Tolerance {
    relative: Option<f64>,
    absolute: Option<f64>,
}

impl Tolerance {
    fn is_enabled(&self) -> bool {
        self.relative.is_some() || self.absolute.is_some()
    }

    /// Largest ratio of estimated to allowed error.
    fn ratio(&self, error: StepError) -> f64 {
        let relative = self.relative.map_or(0.0, |max| error.relative / max);
        let absolute = self.absolute.map_or(0.0, |max| error.absolute / max);
        relative.max(absolute)
    }
}

pub struct RungeKuttaSimulator {
    control: StepControl,
    model: Option<Arc<CompiledModel>>,
    supervision: Supervision,
}

impl RungeKuttaSimulator {
    pub fn new(control: StepControl) -> Self {
        Self {
            control,
            model: None,
            supervision: Supervision::default(),
        }
    }

    pub fn step_control(&self) -> StepControl {
        self.control
    }

    fn tolerance(&self, parameters: &SimulatorParameters) -> Result<Tolerance> {
        match self.control {
            StepControl::Adaptive => Ok(Tolerance {
                relative: Some(parameters.require_max_allowed_relative_error()?),
                absolute: Some(parameters.require_max_allowed_absolute_error()?),
            }),
            StepControl::Fixed => Ok(Tolerance {
                relative: parameters.max_allowed_relative_error.filter(|max| *max > 0.0),
                absolute: parameters.max_allowed_absolute_error.filter(|max| *max > 0.0),
            }),
        }
    }

    fn history_bins(model: &CompiledModel, parameters: &SimulatorParameters) -> Result<usize> {
        if model.delayed_reactions().is_empty() {
            match parameters.num_history_bins {
                Some(_) => parameters.require_num_history_bins(),
                None => Ok(DEFAULT_NUM_HISTORY_BINS),
            }
        } else {
            parameters.require_num_history_bins()
        }
    }
}

impl Simulator for RungeKuttaSimulator {
    fn alias(&self) -> &'static str {
        match self.control {
            StepControl::Fixed => Algorithm::RungeKuttaFixed.alias(),
            StepControl::Adaptive => Algorithm::RungeKuttaAdaptive.alias(),
        }
    }

    fn initialize(&mut self, model: Arc<CompiledModel>) -> Result<()> {
        info!(
            "{} initialized for model \"{}\" ({} dynamic symbols)",
            self.alias(),
            model.name(),
            model.num_dynamic()
        );
        self.model = Some(model);
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.model.is_some()
    }

    fn default_parameters(&self) -> SimulatorParameters {
        SimulatorParameters::default()
            .with_step_size_fraction(DEFAULT_STEP_SIZE_FRACTION)
            .with_max_allowed_relative_error(DEFAULT_MAX_RELATIVE_ERROR)
            .with_max_allowed_absolute_error(DEFAULT_MAX_ABSOLUTE_ERROR)
            .with_num_history_bins(DEFAULT_NUM_HISTORY_BINS)
            .with_compute_fluctuations(false)
    }

    fn check_simulation_parameters(&self, parameters: &SimulatorParameters) -> Result<()> {
        parameters.require_step_size_fraction()?;
        parameters.min_num_steps()?;
        self.tolerance(parameters)?;
        if parameters.compute_fluctuations() {
            return Err(SimulationError::config(
                "fluctuations are not available for deterministic simulation",
            ));
        }
        if let Some(model) = &self.model {
            Self::history_bins(model, parameters)?;
        }
        Ok(())
    }

    fn simulate(
        &mut self,
        start_time: f64,
        end_time: f64,
        parameters: &SimulatorParameters,
        num_time_points: usize,
        requested_symbols: &[&str],
    ) -> Result<SimulationResults> {
        let model = self
            .model
            .clone()
            .ok_or_else(|| SimulationError::state("simulate called before initialize"))?;
        self.check_simulation_parameters(parameters)?;
        let times = time_points(start_time, end_time, num_time_points)?;
        let symbols = resolve_requested(&model, requested_symbols)?;
        let tolerance = self.tolerance(parameters)?;
        let num_history_bins = Self::history_bins(&model, parameters)?;

        let span = end_time - start_time;
        let min_steps_cap = parameters.min_num_steps()?.map(|steps| span / steps as f64);
        let mut max_step = span / num_time_points as f64;
        if let Some(cap) = min_steps_cap {
            max_step = max_step.min(cap);
        }
        if let Some(delay) = model.min_delay() {
            max_step = max_step.min(delay / num_history_bins as f64);
        }
        let mut step = parameters.require_step_size_fraction()? * span;
        if let Some(cap) = min_steps_cap {
            step = step.min(cap);
        }
        if self.control == StepControl::Adaptive {
            step = step.min(max_step);
        }
        debug!(
            "{}: initial step {step}, maximum step {max_step}",
            self.alias()
        );

        let mut rhs = NetworkRhs::new(&model, num_history_bins)?;
        let mut state = model.initial_dynamic_values(start_time);
        rhs.update_histories(start_time, &state)?;

        let dimension = state.len();
        let mut rk4 = RK4::new(dimension);
        let mut doubling = StepDoubling::new(dimension);
        let mut recorder = Recorder::new(times.len(), symbols.len());
        let mut scratch = EvaluationScratch::new();
        let mut row = Vec::with_capacity(symbols.len());
        let mut sample_generation = 0;
        let mut record = |point: usize, state: &[f64], recorder: &mut Recorder| {
            sample_generation += 1;
            sample_symbols(
                &model,
                &symbols,
                state,
                times[point],
                sample_generation,
                &mut scratch,
                &mut row,
            );
            recorder.add(point, &row);
        };
        record(0, &state, &mut recorder);

        let mut progress = RunProgress::new(&self.supervision, start_time, end_time, 1);
        let mut time = start_time;
        let mut next_point = 1;
        let mut cancelled = false;
        while next_point < times.len() {
            if progress.checkpoint(time) {
                warn!("{} cancelled at time {time}", self.alias());
                cancelled = true;
                break;
            }
            let target = times[next_point];
            let remaining = target - time;
            let truncated = step >= remaining;
            let attempt = if truncated { remaining } else { step };

            match self.control {
                StepControl::Fixed => {
                    let check = progress.iterations % FIXED_STEP_CHECK_INTERVAL == 0;
                    if tolerance.is_enabled() && check {
                        let error = doubling.estimate(&rhs, time, &state, attempt)?;
                        if tolerance.ratio(error) > 1.0 {
                            return Err(SimulationError::accuracy(format!(
                                "step error exceeds the allowed maximum at time {time}; \
                                 try a smaller value for the step size fraction"
                            )));
                        }
                        state.copy_from_slice(doubling.full_step());
                    } else {
                        let mut t = time;
                        rk4.step_non_negative(&rhs, &mut t, &mut state, attempt);
                    }
                }
                StepControl::Adaptive => {
                    let next =
                        adaptive_step(&rhs, &mut doubling, &tolerance, time, &mut state, attempt)?;
                    step = if truncated && next.taken >= attempt {
                        step.max(next.step).min(max_step)
                    } else {
                        next.step.min(max_step)
                    };
                    if next.taken < attempt {
                        // The accepted step fell short of the output time.
                        time += next.taken;
                        progress.iterations += 1;
                        rhs.update_histories(time, &state)?;
                        continue;
                    }
                }
            }

            time = if truncated { target } else { time + attempt };
            progress.iterations += 1;
            rhs.update_histories(time, &state)?;
            if truncated {
                record(next_point, &state, &mut recorder);
                next_point += 1;
            }
        }

        let series = recorder.finish(&times, false);
        progress.finish(time);
        info!(
            "{} finished: {} time points, {} steps",
            self.alias(),
            series.time_values.len(),
            progress.iterations
        );
        Ok(SimulationResults {
            simulator_alias: self.alias().to_string(),
            start_time,
            end_time,
            parameters: parameters.clone(),
            symbol_names: requested_symbols.iter().map(|name| name.to_string()).collect(),
            time_values: series.time_values,
            symbol_values: series.symbol_values,
            final_symbol_fluctuations: None,
            cancelled,
        })
    }

    fn supervision_mut(&mut self) -> &mut Supervision {
        &mut self.supervision
    }
}

struct AcceptedStep {
    taken: f64,
    /// Suggested size of the following step.
    step: f64,
}

/// Shrinks `h` until the step-doubling error fits `tolerance`, then advances `state`
/// by the accepted full step.
fn adaptive_step(
    rhs: &NetworkRhs,
    doubling: &mut StepDoubling,
    tolerance: &Tolerance,
    time: f64,
    state: &mut [f64],
    mut h: f64,
) -> Result<AcceptedStep> {
    doubling.compute_scale(rhs, time, state, h)?;
    let mut retries = 0;
    loop {
        let error = doubling.step_error(rhs, time, state, h);
        let ratio = tolerance.ratio(error);
        if ratio <= 1.0 {
            state.copy_from_slice(doubling.full_step());
            let step = if ratio > ERRCON {
                SAFETY * h * ratio.powf(PGROW)
            } else {
                4.0 * h
            };
            return Ok(AcceptedStep { taken: h, step });
        }
        retries += 1;
        if retries > MAX_STEP_RETRIES {
            return Err(SimulationError::accuracy(format!(
                "unable to meet the error tolerance at time {time} \
                 after {MAX_STEP_RETRIES} step reductions"
            )));
        }
        h *= SAFETY * ratio.powf(PSHRINK);
        debug!("step rejected at time {time} (error ratio {ratio}), retrying with {h}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Compartment, DelayConfig, Model, RateLaw, Reaction, Species};

    fn decay_model(rate: f64) -> Arc<CompiledModel> {
        let mut model = Model::new("decay");
        let cell = model.add_compartment(Compartment::new("cell", 1.0)).expect("cell");
        let a = model.add_species(Species::new("A", cell, 1.0)).expect("A");
        let b = model.add_species(Species::new("B", cell, 0.0)).expect("B");
        model
            .add_reaction(
                Reaction::new("decay", RateLaw::MassAction(rate.into()))
                    .reactant(a, 1)
                    .product(b, 1),
            )
            .expect("decay");
        Arc::new(model.compile().expect("compile"))
    }

    #[test]
    fn rhs_scatters_stoichiometry() {
        let model = decay_model(2.0);
        let rhs = NetworkRhs::new(&model, DEFAULT_NUM_HISTORY_BINS).expect("rhs");
        let mut out = [0.0; 2];
        rhs.apply(0.0, &[3.0, 1.0], &mut out);
        assert_eq!(out, [-6.0, 6.0]);
        assert_eq!(rhs.dimension(), 2);
    }

    #[test]
    fn adaptive_tracks_exponential_decay() {
        let mut simulator = RungeKuttaSimulator::new(StepControl::Adaptive);
        simulator.initialize(decay_model(1.0)).expect("initialize");
        let parameters = simulator.default_parameters();
        let results = simulator
            .simulate(0.0, 5.0, &parameters, 51, &["A", "B"])
            .expect("simulate");
        assert_eq!(results.time_values.len(), 51);
        for (time, row) in results.time_values.iter().zip(&results.symbol_values) {
            let exact = (-time).exp();
            assert!(
                ((row[0] - exact) / exact).abs() <= 1e-4,
                "t={time}: {} vs {exact}",
                row[0]
            );
            assert!((row[0] + row[1] - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn fixed_step_lands_on_output_times() {
        let mut simulator = RungeKuttaSimulator::new(StepControl::Fixed);
        simulator.initialize(decay_model(0.5)).expect("initialize");
        let parameters = simulator.default_parameters().with_step_size_fraction(0.003);
        let results = simulator
            .simulate(0.0, 2.0, &parameters, 7, &["A", "time"])
            .expect("simulate");
        for (time, row) in results.time_values.iter().zip(&results.symbol_values) {
            assert_eq!(row[1], *time);
            assert!((row[0] - (-0.5 * time).exp()).abs() < 1e-8);
        }
    }

    #[test]
    fn coarse_fixed_step_fails_accuracy_check() {
        let mut simulator = RungeKuttaSimulator::new(StepControl::Fixed);
        simulator.initialize(decay_model(50.0)).expect("initialize");
        let parameters = simulator
            .default_parameters()
            .with_step_size_fraction(0.5)
            .with_max_allowed_relative_error(1e-9);
        let result = simulator.simulate(0.0, 1.0, &parameters, 2, &["A"]);
        assert!(matches!(result, Err(SimulationError::Accuracy(_))));
    }

    #[test]
    fn deterministic_runs_reject_fluctuations() {
        let simulator = RungeKuttaSimulator::new(StepControl::Adaptive);
        let parameters = simulator.default_parameters().with_compute_fluctuations(true);
        assert!(matches!(
            simulator.check_simulation_parameters(&parameters),
            Err(SimulationError::Configuration(_))
        ));
    }

    #[test]
    fn delayed_models_require_history_bins() {
        let mut model = Model::new("delay");
        let cell = model.add_compartment(Compartment::new("cell", 1.0)).expect("cell");
        let a = model.add_species(Species::new("A", cell, 1.0)).expect("A");
        let b = model.add_species(Species::new("B", cell, 0.0)).expect("B");
        model
            .add_reaction(
                Reaction::new("hold", RateLaw::MassAction(1.0.into()))
                    .reactant(a, 1)
                    .product(b, 1)
                    .with_delay(DelayConfig::Fixed { delay: 1.0 }),
            )
            .expect("hold");
        let mut simulator = RungeKuttaSimulator::new(StepControl::Adaptive);
        simulator.initialize(Arc::new(model.compile().expect("compile"))).expect("initialize");
        let mut parameters = simulator.default_parameters();
        parameters.num_history_bins = None;
        assert!(simulator.check_simulation_parameters(&parameters).is_err());
    }

    #[test]
    fn fixed_delay_shifts_production_by_the_delay() {
        let mut model = Model::new("delay");
        let cell = model.add_compartment(Compartment::new("cell", 1.0)).expect("cell");
        let a = model.add_species(Species::new("A", cell, 100.0)).expect("A");
        let b = model.add_species(Species::new("B", cell, 0.0)).expect("B");
        model
            .add_reaction(
                Reaction::new("hold", RateLaw::MassAction(1.0.into()))
                    .reactant(a, 1)
                    .product(b, 1)
                    .with_delay(DelayConfig::Fixed { delay: 1.0 }),
            )
            .expect("hold");
        let mut simulator = RungeKuttaSimulator::new(StepControl::Adaptive);
        simulator.initialize(Arc::new(model.compile().expect("compile"))).expect("initialize");
        let parameters = simulator.default_parameters();
        let results = simulator
            .simulate(0.0, 3.0, &parameters, 31, &["A", "B", "hold___intermed_species_0"])
            .expect("simulate");

        for (time, row) in results.time_values.iter().zip(&results.symbol_values) {
            assert!((row[0] + row[1] + row[2] - 100.0).abs() < 1e-6);
            if *time < 0.95 {
                assert_eq!(row[1], 0.0, "product before the delay at t={time}");
            }
        }
        // B(t) = 100 (1 - exp(-(t - 1))) once the delay has passed.
        let b_final = results.final_values().expect("final")[1];
        let expected = 100.0 * (1.0 - (-2.0_f64).exp());
        assert!((b_final - expected).abs() < 1.0, "{b_final} vs {expected}");
    }
}
