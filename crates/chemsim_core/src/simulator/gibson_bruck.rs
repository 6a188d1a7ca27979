//! Gibson and Bruck's next-reaction method.
//!
//! Every reaction keeps a putative firing time in an indexed priority queue. After an
//! event only the reactions in the fired reaction's dependency list get a new
//! propensity; their old waiting times are rescaled instead of redrawn.

use super::stochastic::{exponential_wait, EventSelector, StochasticEngine, Trial};
use super::{Algorithm, Simulator};
use crate::control::Supervision;
use crate::error::Result;
use crate::model::{CompiledModel, CompiledRate};
use crate::parameters::SimulatorParameters;
use crate::queue::IndexedPriorityQueue;
use crate::results::SimulationResults;
use crate::symbol::SymbolIndex;
use log::debug;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

pub struct GibsonBruck {
    engine: StochasticEngine,
}

impl Default for GibsonBruck {
    fn default() -> Self {
        Self::new()
    }
}

impl GibsonBruck {
    pub fn new() -> Self {
        Self {
            engine: StochasticEngine::new(),
        }
    }
}

impl Simulator for GibsonBruck {
    fn alias(&self) -> &'static str {
        Algorithm::GibsonBruck.alias()
    }

    fn initialize(&mut self, model: Arc<CompiledModel>) -> Result<()> {
        self.engine.initialize(Algorithm::GibsonBruck.alias(), model);
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
        self.engine.simulate::<NextReactionMethod>(
            Algorithm::GibsonBruck.alias(),
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

type TimeOrder = fn(&f64, &f64) -> Ordering;

pub(crate) struct NextReactionMethod {
    dependents: Vec<Vec<usize>>,
    putative_times: IndexedPriorityQueue<f64, TimeOrder>,
}

impl EventSelector for NextReactionMethod {
    fn for_model(model: &CompiledModel) -> Self {
        let dependents = dependency_graph(model);
        debug!(
            "dependency graph: {} edges over {} reactions",
            dependents.iter().map(Vec::len).sum::<usize>(),
            dependents.len()
        );
        Self {
            dependents,
            putative_times: IndexedPriorityQueue::new(f64::total_cmp as TimeOrder),
        }
    }

    fn start_trial<R: Rng + ?Sized>(&mut self, trial: &mut Trial<'_>, rng: &mut R) -> Result<()> {
        trial.compute_propensities()?;
        self.putative_times.clear();
        for &rate in &trial.propensities {
            self.putative_times.offer(putative_time(trial.time, rate, rng));
        }
        Ok(())
    }

    fn next_event<R: Rng + ?Sized>(
        &mut self,
        trial: &mut Trial<'_>,
        _rng: &mut R,
    ) -> Result<Option<(f64, usize)>> {
        let next = self
            .putative_times
            .peek_index()
            .and_then(|index| self.putative_times.get(index).map(|time| (*time, index)));
        let next_time = next.map_or(f64::INFINITY, |(time, _)| time);
        if let Some(completion) = trial.take_completion_before(next_time) {
            return Ok(Some(completion));
        }
        Ok(next.filter(|(time, _)| time.is_finite()))
    }

    fn reaction_fired<R: Rng + ?Sized>(
        &mut self,
        trial: &mut Trial<'_>,
        fired: usize,
        rng: &mut R,
    ) -> Result<()> {
        let time = trial.time;
        for &dependent in self.dependents[fired].iter().rev() {
            let old_rate = trial.propensities[dependent];
            let new_rate = trial.propensity(dependent)?;
            let rescale = dependent != fired && old_rate > 0.0 && new_rate > 0.0;
            let next = match self.putative_times.get(dependent) {
                Some(&old_time) if rescale => time + (old_time - time) * old_rate / new_rate,
                _ => putative_time(time, new_rate, rng),
            };
            self.putative_times.update(dependent, next);
        }
        Ok(())
    }
}

fn putative_time<R: Rng + ?Sized>(time: f64, rate: f64, rng: &mut R) -> f64 {
    if rate > 0.0 {
        time + exponential_wait(rate, rng)
    } else {
        f64::INFINITY
    }
}

/// For every reaction, the reactions whose propensity can change when it fires: itself,
/// the reactions consuming a species it consumes or produces, and every reaction whose
/// propensity depends on more than the populations of its own dynamic reactants.
///
/// Delayed completions always have zero propensity and are never listed as dependents
/// of another reaction.
fn dependency_graph(model: &CompiledModel) -> Vec<Vec<usize>> {
    let reactions = model.reactions();
    let mut consumers = vec![Vec::new(); model.num_dynamic()];
    let mut always = Vec::new();
    for (index, reaction) in reactions.iter().enumerate() {
        if reaction.delayed.is_some() {
            continue;
        }
        let fixed_constant = matches!(
            &reaction.rate,
            CompiledRate::MassAction(value) if model.is_fixed_value(value)
        );
        let fixed_factors = reaction.reactants.iter().all(|reactant| {
            (reactant.is_dynamic() || model.is_fixed(reactant.species))
                && model.is_fixed(reactant.volume)
        });
        if !(fixed_constant && fixed_factors) {
            always.push(index);
            continue;
        }
        for reactant in &reaction.reactants {
            if let SymbolIndex::Dynamic(species) = reactant.species {
                consumers[species].push(index);
            }
        }
    }

    reactions
        .iter()
        .enumerate()
        .map(|(index, reaction)| {
            let mut dependents: BTreeSet<usize> = always.iter().copied().collect();
            dependents.insert(index);
            for participant in reaction.reactants.iter().chain(&reaction.products) {
                if let SymbolIndex::Dynamic(species) = participant.species {
                    dependents.extend(consumers[species].iter().copied());
                }
            }
            dependents.into_iter().collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Compartment, DelayConfig, Model, Parameter, RateLaw, Reaction, Species};
    use crate::simulator::stochastic::tests::decay;
    use crate::symbol::Value;

    fn seeded(seed: u64) -> SimulatorParameters {
        GibsonBruck::new().default_parameters().with_random_seed(seed)
    }

    #[test]
    fn dependency_graph_follows_touched_species() {
        let mut model = Model::new("cycle");
        let cell = model.add_compartment(Compartment::new("cell", 1.0)).expect("cell");
        let a = model.add_species(Species::new("A", cell, 10.0)).expect("A");
        let b = model.add_species(Species::new("B", cell, 0.0)).expect("B");
        let c = model.add_species(Species::new("C", cell, 0.0)).expect("C");
        model.add_parameter(Parameter::new("k", 2.0)).expect("k");
        model
            .add_reaction(
                Reaction::new("r0", RateLaw::MassAction(1.0.into()))
                    .reactant(a, 1)
                    .product(b, 1),
            )
            .expect("r0");
        model
            .add_reaction(
                Reaction::new("r1", RateLaw::MassAction(Value::parse("k").expect("k")))
                    .reactant(b, 1)
                    .product(c, 1),
            )
            .expect("r1");
        model
            .add_reaction(
                Reaction::new("r2", RateLaw::Custom(Value::parse("0.5 * C").expect("r2")))
                    .reactant(c, 1)
                    .product(a, 1),
            )
            .expect("r2");
        model
            .add_reaction(Reaction::new("r3", RateLaw::MassAction(1.0.into())).product(a, 1))
            .expect("r3");
        let model = model.compile().expect("compile");

        let graph = dependency_graph(&model);
        assert_eq!(graph[0], vec![0, 1, 2]);
        assert_eq!(graph[1], vec![1, 2]);
        assert_eq!(graph[2], vec![0, 2]);
        assert_eq!(graph[3], vec![0, 2, 3]);
    }

    #[test]
    fn time_dependent_rate_constants_are_always_updated() {
        let mut model = Model::new("ramp");
        let cell = model.add_compartment(Compartment::new("cell", 1.0)).expect("cell");
        let a = model.add_species(Species::new("A", cell, 10.0)).expect("A");
        let b = model.add_species(Species::new("B", cell, 0.0)).expect("B");
        model
            .add_reaction(
                Reaction::new(
                    "ramp",
                    RateLaw::MassAction(Value::parse("0.1 * time").expect("ramp")),
                )
                .reactant(a, 1)
                .product(b, 1),
            )
            .expect("ramp");
        model
            .add_reaction(
                Reaction::new("back", RateLaw::MassAction(1.0.into()))
                    .reactant(b, 1)
                    .product(a, 1),
            )
            .expect("back");
        let model = model.compile().expect("compile");

        let graph = dependency_graph(&model);
        assert_eq!(graph[0], vec![0, 1]);
        assert_eq!(graph[1], vec![0, 1]);
    }

    #[test]
    fn populations_stay_integral_and_conserved() {
        let mut simulator = GibsonBruck::new();
        simulator.initialize(decay(30.0)).expect("initialize");
        let results = simulator
            .simulate(0.0, 5.0, &seeded(3), 11, &["A", "B"])
            .expect("simulate");
        assert_eq!(results.simulator_alias, "gibson-bruck");
        assert_eq!(results.symbol_values[0], vec![30.0, 0.0]);
        for row in &results.symbol_values {
            assert_eq!(row[0].fract(), 0.0);
            assert_eq!(row[0] + row[1], 30.0);
        }
        let a = results.series("A").expect("A");
        assert!(a.windows(2).all(|pair| pair[1] <= pair[0]));
    }

    #[test]
    fn seeded_runs_repeat() {
        let model = decay(50.0);
        let mut first = GibsonBruck::new();
        first.initialize(model.clone()).expect("initialize");
        let mut second = GibsonBruck::new();
        second.initialize(model).expect("initialize");
        let parameters = seeded(8).with_ensemble_size(4);
        let a = first.simulate(0.0, 3.0, &parameters, 7, &["A"]).expect("first");
        let b = second.simulate(0.0, 3.0, &parameters, 7, &["A"]).expect("second");
        assert_eq!(a.symbol_values, b.symbol_values);
    }

    #[test]
    fn ensemble_mean_follows_exponential_decay() {
        let mut simulator = GibsonBruck::new();
        simulator.initialize(decay(1000.0)).expect("initialize");
        let parameters = seeded(41).with_ensemble_size(40);
        let results = simulator
            .simulate(0.0, 2.0, &parameters, 5, &["A"])
            .expect("simulate");
        for (time, row) in results.time_values.iter().zip(&results.symbol_values) {
            let exact = 1000.0 * (-time).exp();
            assert!((row[0] - exact).abs() < 12.0, "t={time}: {} vs {exact}", row[0]);
        }
    }

    #[test]
    fn fixed_delay_holds_molecules_for_the_delay() {
        let mut model = Model::new("delay");
        let cell = model.add_compartment(Compartment::new("cell", 1.0)).expect("cell");
        let a = model.add_species(Species::new("A", cell, 40.0)).expect("A");
        let b = model.add_species(Species::new("B", cell, 0.0)).expect("B");
        model
            .add_reaction(
                Reaction::new("hold", RateLaw::MassAction(2.0.into()))
                    .reactant(a, 1)
                    .product(b, 1)
                    .with_delay(DelayConfig::Fixed { delay: 1.5 }),
            )
            .expect("hold");
        let mut simulator = GibsonBruck::new();
        simulator.initialize(Arc::new(model.compile().expect("compile"))).expect("initialize");
        let results = simulator
            .simulate(0.0, 30.0, &seeded(5), 61, &["A", "B", "hold___intermed_species_0"])
            .expect("simulate");

        for (time, row) in results.time_values.iter().zip(&results.symbol_values) {
            assert_eq!(row[0] + row[1] + row[2], 40.0);
            if *time < 1.5 {
                assert_eq!(row[1], 0.0, "product before the delay at t={time}");
            }
        }
        assert_eq!(results.final_values(), Some(&[0.0, 40.0, 0.0][..]));
    }

    #[test]
    fn exhausted_network_jumps_to_end() {
        let mut simulator = GibsonBruck::new();
        simulator.initialize(decay(0.0)).expect("initialize");
        let results = simulator
            .simulate(0.0, 100.0, &seeded(1), 5, &["A", "B"])
            .expect("simulate");
        assert_eq!(results.time_values, vec![0.0, 25.0, 50.0, 75.0, 100.0]);
        assert!(results.symbol_values.iter().all(|row| row == &vec![0.0, 0.0]));
    }
}
