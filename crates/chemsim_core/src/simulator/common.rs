//! Run support shared by every algorithm.

use crate::control::{Supervision, UpdateThrottle};
use crate::delayed::DelayedReactionSolver;
use crate::error::{Result, SimulationError};
use crate::evaluator::{EvaluationScratch, SymbolEvaluator};
use crate::model::{CompiledModel, CompiledRate, CompiledReaction};
use crate::rate_factor::RateFactorEvaluator;
use crate::symbol::SymbolIndex;
use nalgebra::DVector;

/// `count` evenly spaced times from `start` to `end`, both included.
pub(crate) fn time_points(start: f64, end: f64, count: usize) -> Result<Vec<f64>> {
    if !(start.is_finite() && end.is_finite()) {
        return Err(SimulationError::config("start and end time must be finite"));
    }
    if start >= end {
        return Err(SimulationError::config(format!(
            "start time {start} must be before end time {end}"
        )));
    }
    if count < 2 {
        return Err(SimulationError::config(format!(
            "at least 2 result time points are required, got {count}"
        )));
    }
    let span = end - start;
    let last = (count - 1) as f64;
    let mut times: Vec<f64> = (0..count).map(|i| start + span * i as f64 / last).collect();
    times[count - 1] = end;
    Ok(times)
}

pub(crate) fn resolve_requested(model: &CompiledModel, names: &[&str]) -> Result<Vec<SymbolIndex>> {
    names.iter().map(|name| model.symbols().resolve(name)).collect()
}

/// One solver per delayed reaction of `model`, ready for a run.
pub(crate) fn build_solvers(
    model: &CompiledModel,
    num_history_bins: usize,
    stochastic: bool,
) -> Result<Vec<DelayedReactionSolver>> {
    model
        .delayed_reactions()
        .iter()
        .map(|reaction| {
            let mut solver = DelayedReactionSolver::new(reaction.clone())?;
            solver.set_num_history_bins(num_history_bins)?;
            solver.initialize(stochastic)?;
            Ok(solver)
        })
        .collect()
}

/// Propensity (stochastic) or reaction velocity (deterministic) of one reaction.
pub(crate) fn reaction_rate(
    reaction: &CompiledReaction,
    evaluator: &SymbolEvaluator,
    scratch: &mut EvaluationScratch,
    factor: RateFactorEvaluator,
    solvers: &[DelayedReactionSolver],
) -> f64 {
    if let Some(index) = reaction.delayed {
        return solvers.get(index).map_or(0.0, |solver| {
            let intermediate = evaluator.dynamic_values()[solver.reaction().intermediate];
            solver.compute_rate(evaluator.time(), intermediate)
        });
    }
    let constant = match &reaction.rate {
        CompiledRate::Custom(value) => return evaluator.evaluate(value, &reaction.locals, scratch),
        CompiledRate::MassAction(value) => evaluator.evaluate(value, &reaction.locals, scratch),
    };
    let mut rate = constant;
    for reactant in &reaction.reactants {
        if rate == 0.0 {
            break;
        }
        let population = evaluator.value(reactant.species, scratch);
        let volume = evaluator.value(reactant.volume, scratch);
        rate *= factor.factor(population, volume, reactant.stoichiometry);
    }
    rate
}

/// Values of `symbols` with the dynamic array `dynamic` at `time`.
pub(crate) fn sample_symbols(
    model: &CompiledModel,
    symbols: &[SymbolIndex],
    dynamic: &[f64],
    time: f64,
    generation: u64,
    scratch: &mut EvaluationScratch,
    row: &mut Vec<f64>,
) {
    let evaluator = model.evaluator(dynamic, time, generation);
    row.clear();
    row.extend(symbols.iter().map(|index| evaluator.value(*index, scratch)));
}

/// Name of the first value that cannot be held exactly as an integer count.
pub(crate) fn population_out_of_range<'n>(values: &[f64], names: &'n [String]) -> Option<&'n str> {
    values
        .iter()
        .zip(names)
        .find(|(x, _)| !x.is_finite() || **x + 1.0 == **x)
        .map(|(_, name)| name.as_str())
}

/// Throttled checkpoints of one `simulate` call.
pub(crate) struct RunProgress<'s> {
    supervision: &'s Supervision,
    throttle: UpdateThrottle,
    start: f64,
    span: f64,
    num_trials: u32,
    pub trial: u32,
    pub iterations: u64,
}

impl<'s> RunProgress<'s> {
    pub fn new(supervision: &'s Supervision, start: f64, end: f64, num_trials: u32) -> Self {
        Self {
            supervision,
            throttle: supervision.throttle(),
            start,
            span: end - start,
            num_trials: num_trials.max(1),
            trial: 0,
            iterations: 0,
        }
    }

    fn fraction(&self, time: f64) -> f64 {
        let within = ((time - self.start) / self.span).clamp(0.0, 1.0);
        (self.trial as f64 + within) / self.num_trials as f64
    }

    /// Returns true when the run has been cancelled.
    pub fn checkpoint(&mut self, time: f64) -> bool {
        self.throttle.is_due() && self.supervision.checkpoint(self.fraction(time), self.iterations)
    }

    pub fn finish(&self, time: f64) {
        self.supervision.finish(self.fraction(time), self.iterations);
    }
}

/// Sums sampled rows across trials and turns them into averaged results.
pub(crate) struct Recorder {
    num_symbols: usize,
    sums: Vec<f64>,
    counts: Vec<u32>,
    finals: Vec<DVector<f64>>,
}

pub(crate) struct RecordedSeries {
    pub time_values: Vec<f64>,
    pub symbol_values: Vec<Vec<f64>>,
    pub final_symbol_fluctuations: Option<Vec<f64>>,
}

impl Recorder {
    pub fn new(num_points: usize, num_symbols: usize) -> Self {
        Self {
            num_symbols,
            sums: vec![0.0; num_points * num_symbols],
            counts: vec![0; num_points],
            finals: Vec::new(),
        }
    }

    pub fn add(&mut self, point: usize, row: &[f64]) {
        let offset = point * self.num_symbols;
        for (sum, value) in self.sums[offset..offset + self.num_symbols].iter_mut().zip(row) {
            *sum += value;
        }
        self.counts[point] += 1;
    }

    /// Final row of one completed trial.
    pub fn add_final(&mut self, row: &[f64]) {
        self.finals.push(DVector::from_column_slice(row));
    }

    /// Averages every time point reached by at least one trial.
    pub fn finish(self, times: &[f64], compute_fluctuations: bool) -> RecordedSeries {
        let reached = self.counts.iter().take_while(|count| **count > 0).count();
        let symbol_values = (0..reached)
            .map(|point| {
                let offset = point * self.num_symbols;
                let count = self.counts[point] as f64;
                self.sums[offset..offset + self.num_symbols]
                    .iter()
                    .map(|sum| sum / count)
                    .collect()
            })
            .collect();
        let final_symbol_fluctuations = if compute_fluctuations {
            sample_deviation(&self.finals, self.num_symbols).map(|d| d.iter().copied().collect())
        } else {
            None
        };
        RecordedSeries {
            time_values: times[..reached].to_vec(),
            symbol_values,
            final_symbol_fluctuations,
        }
    }
}

fn sample_deviation(samples: &[DVector<f64>], dim: usize) -> Option<DVector<f64>> {
    if samples.len() < 2 {
        return None;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().fold(DVector::<f64>::zeros(dim), |acc, s| acc + s) / n;
    let squares = samples.iter().fold(DVector::<f64>::zeros(dim), |acc, s| {
        let diff = s - &mean;
        acc + diff.component_mul(&diff)
    });
    Some((squares / (n - 1.0)).map(f64::sqrt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_points_are_evenly_spaced_and_inclusive() {
        let times = time_points(1.0, 2.0, 5).expect("times");
        assert_eq!(times, vec![1.0, 1.25, 1.5, 1.75, 2.0]);
        assert!(time_points(0.0, 1.0, 1).is_err());
        assert!(time_points(1.0, 1.0, 3).is_err());
        assert!(time_points(0.0, f64::INFINITY, 3).is_err());
    }

    #[test]
    fn recorder_averages_and_truncates_to_reached_points() {
        let mut recorder = Recorder::new(3, 2);
        recorder.add(0, &[1.0, 2.0]);
        recorder.add(0, &[3.0, 4.0]);
        recorder.add(1, &[5.0, 6.0]);
        let series = recorder.finish(&[0.0, 0.5, 1.0], false);
        assert_eq!(series.time_values, vec![0.0, 0.5]);
        assert_eq!(series.symbol_values, vec![vec![2.0, 3.0], vec![5.0, 6.0]]);
        assert!(series.final_symbol_fluctuations.is_none());
    }

    #[test]
    fn fluctuations_use_sample_deviation() {
        let mut recorder = Recorder::new(1, 1);
        for value in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            recorder.add(0, &[value]);
            recorder.add_final(&[value]);
        }
        let series = recorder.finish(&[0.0], true);
        let deviation = series.final_symbol_fluctuations.expect("fluctuations")[0];
        assert!((deviation - (32.0_f64 / 7.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn detects_populations_beyond_integer_precision() {
        let names = vec!["A".to_string(), "B".to_string()];
        assert_eq!(population_out_of_range(&[1.0, 2.0], &names), None);
        assert_eq!(population_out_of_range(&[1.0, 1e17], &names), Some("B"));
        assert_eq!(population_out_of_range(&[f64::NAN, 1.0], &names), Some("A"));
    }
}
