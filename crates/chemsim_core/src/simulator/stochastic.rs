//! Run loop shared by the exact stochastic algorithms.
//!
//! An algorithm only decides which reaction fires next and when; trial setup,
//! delayed-reaction completions, sampling at output times and ensemble averaging live
//! here.

use super::common::{
    build_solvers, population_out_of_range, reaction_rate, resolve_requested, sample_symbols,
    time_points, Recorder, RunProgress,
};
use crate::control::Supervision;
use crate::delayed::{DelayedReactionSolver, DEFAULT_NUM_HISTORY_BINS};
use crate::error::{Result, SimulationError};
use crate::evaluator::EvaluationScratch;
use crate::model::CompiledModel;
use crate::parameters::SimulatorParameters;
use crate::rate_factor::RateFactorEvaluator;
use crate::results::SimulationResults;
use crate::symbol::SymbolIndex;
use log::{debug, info, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Chooses the next reaction event of a trial.
pub(crate) trait EventSelector {
    fn for_model(model: &CompiledModel) -> Self;

    /// Called once per trial, after the initial populations are set.
    fn start_trial<R: Rng + ?Sized>(&mut self, trial: &mut Trial<'_>, rng: &mut R) -> Result<()>;

    /// Time and index of the next reaction, or `None` when nothing can fire any more.
    /// A delayed completion that is due first is polled from its solver and returned.
    fn next_event<R: Rng + ?Sized>(
        &mut self,
        trial: &mut Trial<'_>,
        rng: &mut R,
    ) -> Result<Option<(f64, usize)>>;

    /// Called after `reaction` fired at `trial.time`.
    fn reaction_fired<R: Rng + ?Sized>(
        &mut self,
        trial: &mut Trial<'_>,
        reaction: usize,
        rng: &mut R,
    ) -> Result<()>;
}

/// Model binding, supervision and seed source of a stochastic simulator.
pub(crate) struct StochasticEngine {
    model: Option<Arc<CompiledModel>>,
    pub supervision: Supervision,
    seeds: ChaCha8Rng,
}

impl StochasticEngine {
    /// Runs without a `random_seed` draw their seed from a generator seeded by the wall
    /// clock.
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or_default();
        Self {
            model: None,
            supervision: Supervision::default(),
            seeds: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn initialize(&mut self, alias: &str, model: Arc<CompiledModel>) {
        info!(
            "{alias} initialized for model \"{}\" ({} reactions)",
            model.name(),
            model.reactions().len()
        );
        self.model = Some(model);
    }

    pub fn is_initialized(&self) -> bool {
        self.model.is_some()
    }

    pub fn default_parameters() -> SimulatorParameters {
        SimulatorParameters::default()
            .with_ensemble_size(1)
            .with_compute_fluctuations(false)
            .with_num_history_bins(DEFAULT_NUM_HISTORY_BINS)
    }

    pub fn check_parameters(parameters: &SimulatorParameters) -> Result<()> {
        let ensemble_size = parameters.require_ensemble_size()?;
        if parameters.compute_fluctuations() && ensemble_size < 2 {
            return Err(SimulationError::config(
                "computing fluctuations requires an ensemble size of at least 2",
            ));
        }
        history_bins(parameters)?;
        Ok(())
    }

    pub fn simulate<S: EventSelector>(
        &mut self,
        alias: &str,
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
        Self::check_parameters(parameters)?;
        let times = time_points(start_time, end_time, num_time_points)?;
        let symbols = resolve_requested(&model, requested_symbols)?;
        let ensemble_size = parameters.require_ensemble_size()?;
        let mut solvers = build_solvers(&model, history_bins(parameters)?, true)?;
        let mut selector = S::for_model(&model);

        let initial = model.initial_dynamic_values(start_time);
        check_initial_populations(&initial, model.symbols().dynamic_names())?;

        let run_seed = match parameters.random_seed {
            Some(seed) => seed,
            None => self.seeds.gen(),
        };
        debug!("{alias} running {ensemble_size} trial(s) from seed {run_seed}");

        let mut recorder = Recorder::new(times.len(), symbols.len());
        let mut progress = RunProgress::new(&self.supervision, start_time, end_time, ensemble_size);
        let mut cancelled = false;
        for trial in 0..ensemble_size {
            progress.trial = trial;
            for solver in &mut solvers {
                solver.clear();
            }
            let mut rng = ChaCha8Rng::seed_from_u64(trial_seed(run_seed, trial as u64));
            let dynamic = integerize(&initial, &mut rng);
            let mut run = Trial::new(&model, &times, &symbols, &mut solvers, dynamic);
            match run.run(&mut selector, &mut rng, &mut recorder, &mut progress)? {
                TrialOutcome::Finished => recorder.add_final(&run.row),
                TrialOutcome::Cancelled => {
                    warn!("{alias} cancelled during trial {trial} at time {}", run.time);
                    cancelled = true;
                    break;
                }
            }
        }

        let series = recorder.finish(&times, parameters.compute_fluctuations());
        progress.finish(series.time_values.last().copied().unwrap_or(start_time));
        info!(
            "{alias} finished: {} time points, {} events",
            series.time_values.len(),
            progress.iterations
        );
        Ok(SimulationResults {
            simulator_alias: alias.to_string(),
            start_time,
            end_time,
            parameters: parameters.clone(),
            symbol_names: requested_symbols.iter().map(|name| name.to_string()).collect(),
            time_values: series.time_values,
            symbol_values: series.symbol_values,
            final_symbol_fluctuations: series.final_symbol_fluctuations,
            cancelled,
        })
    }
}

fn history_bins(parameters: &SimulatorParameters) -> Result<usize> {
    match parameters.num_history_bins {
        Some(_) => parameters.require_num_history_bins(),
        None => Ok(DEFAULT_NUM_HISTORY_BINS),
    }
}

fn check_initial_populations(values: &[f64], names: &[String]) -> Result<()> {
    if let Some((_, name)) = values.iter().zip(names).find(|(value, _)| **value < 0.0) {
        return Err(SimulationError::config(format!(
            "initial population of \"{name}\" is negative"
        )));
    }
    if let Some(name) = population_out_of_range(values, names) {
        return Err(SimulationError::config(format!(
            "initial population of \"{name}\" is too large for discrete simulation"
        )));
    }
    Ok(())
}

/// Seed of trial `trial` of a run seeded with `seed`. Each trial owns its generator, so
/// trial `k` is reproduced by a single-trial run seeded with `trial_seed(seed, k)`.
pub(crate) fn trial_seed(seed: u64, trial: u64) -> u64 {
    const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;
    if trial == 0 {
        return seed;
    }
    // SplitMix64
    let mut z = (seed ^ trial.wrapping_mul(GOLDEN_GAMMA)).wrapping_add(GOLDEN_GAMMA);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Rounds every value to a neighbouring integer, up with probability equal to its
/// fractional part.
fn integerize<R: Rng + ?Sized>(values: &[f64], rng: &mut R) -> Vec<f64> {
    values
        .iter()
        .map(|value| {
            let whole = value.floor();
            let fraction = value - whole;
            if fraction > 0.0 && rng.gen_bool(fraction) {
                whole + 1.0
            } else {
                whole
            }
        })
        .collect()
}

/// Exponentially distributed waiting time of a process firing at `rate`.
pub(crate) fn exponential_wait<R: Rng + ?Sized>(rate: f64, rng: &mut R) -> f64 {
    let u = 1.0 - rng.gen::<f64>();
    (1.0 / u).ln() / rate
}

enum TrialOutcome {
    Finished,
    Cancelled,
}

/// State of one trajectory.
pub(crate) struct Trial<'a> {
    pub model: &'a CompiledModel,
    times: &'a [f64],
    symbols: &'a [SymbolIndex],
    solvers: &'a mut [DelayedReactionSolver],
    dynamic: Vec<f64>,
    /// Propensities as of their last computation.
    pub propensities: Vec<f64>,
    scratch: EvaluationScratch,
    row: Vec<f64>,
    generation: u64,
    pub time: f64,
}

impl<'a> Trial<'a> {
    pub fn new(
        model: &'a CompiledModel,
        times: &'a [f64],
        symbols: &'a [SymbolIndex],
        solvers: &'a mut [DelayedReactionSolver],
        dynamic: Vec<f64>,
    ) -> Self {
        Self {
            model,
            times,
            symbols,
            solvers,
            dynamic,
            propensities: vec![0.0; model.reactions().len()],
            scratch: EvaluationScratch::new(),
            row: Vec::with_capacity(symbols.len()),
            generation: 0,
            time: times[0],
        }
    }

    fn run<S: EventSelector, R: Rng + ?Sized>(
        &mut self,
        selector: &mut S,
        rng: &mut R,
        recorder: &mut Recorder,
        progress: &mut RunProgress,
    ) -> Result<TrialOutcome> {
        selector.start_trial(self, rng)?;
        let mut next_point = 0;
        loop {
            if progress.checkpoint(self.time) {
                return Ok(TrialOutcome::Cancelled);
            }

            let event = selector.next_event(self, rng)?;
            let next_time = event.map_or(f64::INFINITY, |(time, _)| time);

            // Output times before the event see the state before it.
            while next_point < self.times.len() && self.times[next_point] <= next_time {
                self.record(next_point, recorder)?;
                next_point += 1;
            }
            if next_point == self.times.len() {
                return Ok(TrialOutcome::Finished);
            }
            let Some((_, reaction)) = event else {
                return Ok(TrialOutcome::Finished);
            };

            self.time = next_time;
            self.fire(reaction, rng)?;
            selector.reaction_fired(self, reaction, rng)?;
            progress.iterations += 1;
        }
    }

    /// Recomputes and stores the propensity of one reaction.
    pub fn propensity(&mut self, index: usize) -> Result<f64> {
        let reaction = &self.model.reactions()[index];
        let evaluator = self.model.evaluator(&self.dynamic, self.time, self.generation);
        let propensity = reaction_rate(
            reaction,
            &evaluator,
            &mut self.scratch,
            RateFactorEvaluator::Combinatoric,
            &*self.solvers,
        );
        if !(propensity >= 0.0) {
            return Err(SimulationError::accuracy(format!(
                "reaction \"{}\" has invalid propensity {propensity} at time {}",
                reaction.name, self.time
            )));
        }
        self.propensities[index] = propensity;
        Ok(propensity)
    }

    /// Recomputes every propensity and returns their sum.
    pub fn compute_propensities(&mut self) -> Result<f64> {
        let mut total = 0.0;
        for index in 0..self.propensities.len() {
            total += self.propensity(index)?;
        }
        Ok(total)
    }

    /// Earliest pending delayed completion and its solver. Solvers are scanned from
    /// the last one, so equal times go to the later solver.
    pub fn earliest_completion(&self) -> Option<(f64, usize)> {
        let mut earliest: Option<(f64, usize)> = None;
        for (index, solver) in self.solvers.iter().enumerate().rev() {
            if let Some(completion) = solver.peek_next_reaction_time() {
                if earliest.map_or(true, |(time, _)| completion < time) {
                    earliest = Some((completion, index));
                }
            }
        }
        earliest
    }

    /// The pending completion of `solver` if it is due strictly before `time`, polled
    /// from its queue and returned as `(completion time, reaction index)`.
    pub fn take_completion_before(&mut self, time: f64) -> Option<(f64, usize)> {
        let (completion, solver) = self.earliest_completion()?;
        if completion >= time {
            return None;
        }
        self.solvers[solver].poll_next_reaction_time();
        Some((completion, self.solvers[solver].reaction().reaction))
    }

    fn fire<R: Rng + ?Sized>(&mut self, reaction: usize, rng: &mut R) -> Result<()> {
        let row = self.model.stoichiometry().row(reaction);
        for (&species, &delta) in row.col_indices().iter().zip(row.values()) {
            self.dynamic[species] += delta;
            if delta > 0.0 {
                if let Some(solver) = self.model.solver_fed_by(species) {
                    for _ in 0..delta as u32 {
                        self.solvers[solver].add_reactant(self.time, rng)?;
                    }
                }
            }
        }
        self.generation += 1;
        Ok(())
    }

    fn record(&mut self, point: usize, recorder: &mut Recorder) -> Result<()> {
        let names = self.model.symbols().dynamic_names();
        if let Some(name) = population_out_of_range(&self.dynamic, names) {
            return Err(SimulationError::accuracy(format!(
                "population of \"{name}\" grew too large for discrete simulation"
            )));
        }
        self.generation += 1;
        sample_symbols(
            self.model,
            self.symbols,
            &self.dynamic,
            self.times[point],
            self.generation,
            &mut self.scratch,
            &mut self.row,
        );
        recorder.add(point, &self.row);
        Ok(())
    }
}
