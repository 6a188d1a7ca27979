//! Reaction-network data model and its compiler.
//!
//! A [`Model`] is an arena of compartments, species, parameters and reactions that
//! refer to each other by id. [`Model::compile`] resolves every name exactly once and
//! produces a [`CompiledModel`]: an immutable network that only holds indices and can
//! be shared (`Arc`) by any number of simulator instances.

use crate::delayed::{DelayKind, DelayedReaction};
use crate::equation_engine::{Bytecode, Compiler, OpCode};
use crate::error::{Result, SimulationError};
use crate::evaluator::{EvaluationScratch, SymbolEvaluator};
use crate::symbol::{is_reserved, CompiledValue, SymbolIndex, SymbolTable, Value};
use log::debug;
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Multistep reactions with fewer remaining stages are written out as explicit
/// elementary reactions instead of a Gamma-delayed completion.
pub const MIN_STAGES_FOR_DELAY_SOLVER: u32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompartmentId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpeciesId(usize);

#[derive(Debug, Clone)]
pub struct Compartment {
    pub name: String,
    pub volume: Value,
}

impl Compartment {
    pub fn new(name: impl Into<String>, volume: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            volume: volume.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Species {
    pub name: String,
    pub compartment: CompartmentId,
    /// Floating species change with the reactions they take part in; boundary
    /// species keep their value.
    pub floating: bool,
    pub value: Value,
}

impl Species {
    pub fn new(
        name: impl Into<String>,
        compartment: CompartmentId,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            name: name.into(),
            compartment,
            floating: true,
            value: value.into(),
        }
    }

    pub fn boundary(mut self) -> Self {
        self.floating = false;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub value: Value,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum RateLaw {
    /// Rate constant multiplied by the rate factor of every reactant.
    MassAction(Value),
    /// Complete propensity, used as is.
    Custom(Value),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DelayConfig {
    Fixed { delay: f64 },
    /// `steps` elementary stages at the reaction's rate, including the first.
    Multistep { steps: u32 },
}

#[derive(Debug, Clone)]
pub struct Reaction {
    pub name: String,
    pub reactants: Vec<(SpeciesId, u32)>,
    pub products: Vec<(SpeciesId, u32)>,
    pub rate: RateLaw,
    pub local_parameters: Vec<(String, f64)>,
    pub delay: Option<DelayConfig>,
}

impl Reaction {
    pub fn new(name: impl Into<String>, rate: RateLaw) -> Self {
        Self {
            name: name.into(),
            reactants: Vec::new(),
            products: Vec::new(),
            rate,
            local_parameters: Vec::new(),
            delay: None,
        }
    }

    pub fn reactant(mut self, species: SpeciesId, stoichiometry: u32) -> Self {
        self.reactants.push((species, stoichiometry));
        self
    }

    pub fn product(mut self, species: SpeciesId, stoichiometry: u32) -> Self {
        self.products.push((species, stoichiometry));
        self
    }

    pub fn local_parameter(mut self, name: impl Into<String>, value: f64) -> Self {
        self.local_parameters.push((name.into(), value));
        self
    }

    pub fn with_delay(mut self, delay: DelayConfig) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// How species values are read inside expressions.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum UnitsConvention {
    /// Species values are molecule counts and are read as stored.
    #[default]
    Molecules,
    /// Species symbols read as value / compartment volume, and custom rate laws are
    /// scaled by `substance_to_molecules` to yield molecules per unit time.
    Concentration { substance_to_molecules: f64 },
}

#[derive(Debug, Clone, Default)]
pub struct Model {
    name: String,
    compartments: Vec<Compartment>,
    species: Vec<Species>,
    parameters: Vec<Parameter>,
    reactions: Vec<Reaction>,
    units: UnitsConvention,
    names: HashSet<String>,
    reaction_names: HashSet<String>,
}

impl Model {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn units(&self) -> UnitsConvention {
        self.units
    }

    pub fn set_units(&mut self, units: UnitsConvention) {
        self.units = units;
    }

    pub fn compartments(&self) -> &[Compartment] {
        &self.compartments
    }

    pub fn species(&self) -> &[Species] {
        &self.species
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn reactions(&self) -> &[Reaction] {
        &self.reactions
    }

    pub fn species_id(&self, name: &str) -> Option<SpeciesId> {
        self.species.iter().position(|s| s.name == name).map(SpeciesId)
    }

    fn claim_name(&mut self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(SimulationError::config("symbol name must not be empty"));
        }
        if is_reserved(name) {
            return Err(SimulationError::config(format!("symbol name \"{name}\" is reserved")));
        }
        if !self.names.insert(name.to_string()) {
            return Err(SimulationError::config(format!(
                "symbol \"{name}\" is defined more than once"
            )));
        }
        Ok(())
    }

    pub fn add_compartment(&mut self, compartment: Compartment) -> Result<CompartmentId> {
        self.claim_name(&compartment.name)?;
        self.compartments.push(compartment);
        Ok(CompartmentId(self.compartments.len() - 1))
    }

    pub fn add_species(&mut self, species: Species) -> Result<SpeciesId> {
        if species.compartment.0 >= self.compartments.len() {
            return Err(SimulationError::not_found(format!(
                "compartment of species \"{}\" is not part of the model",
                species.name
            )));
        }
        self.claim_name(&species.name)?;
        self.species.push(species);
        Ok(SpeciesId(self.species.len() - 1))
    }

    pub fn add_parameter(&mut self, parameter: Parameter) -> Result<()> {
        self.claim_name(&parameter.name)?;
        self.parameters.push(parameter);
        Ok(())
    }

    pub fn add_reaction(&mut self, reaction: Reaction) -> Result<()> {
        if reaction.reactants.is_empty() && reaction.products.is_empty() {
            return Err(SimulationError::config(format!(
                "reaction \"{}\" has neither reactants nor products",
                reaction.name
            )));
        }
        for participants in [&reaction.reactants, &reaction.products] {
            let mut seen = HashSet::new();
            for &(species, stoichiometry) in participants {
                if species.0 >= self.species.len() {
                    return Err(SimulationError::not_found(format!(
                        "reaction \"{}\" refers to a species that is not part of the model",
                        reaction.name
                    )));
                }
                if stoichiometry == 0 {
                    return Err(SimulationError::config(format!(
                        "reaction \"{}\" has a participant with stoichiometry 0",
                        reaction.name
                    )));
                }
                if !seen.insert(species) {
                    return Err(SimulationError::config(format!(
                        "reaction \"{}\" lists species \"{}\" twice on the same side",
                        reaction.name, self.species[species.0].name
                    )));
                }
            }
        }
        if !self.reaction_names.insert(reaction.name.clone()) {
            return Err(SimulationError::config(format!(
                "reaction \"{}\" is defined more than once",
                reaction.name
            )));
        }
        self.reactions.push(reaction);
        Ok(())
    }

    /// Resolves every symbol and freezes the network.
    pub fn compile(&self) -> Result<CompiledModel> {
        let (expanded, intermediates) = self.expand_reactions()?;

        let mut mutated = vec![false; self.species.len()];
        for reaction in &expanded {
            for (species, _) in reaction.reactants.iter().chain(&reaction.products) {
                if let SpeciesRef::Declared(i) = species {
                    mutated[*i] = true;
                }
            }
        }

        let mut symbols = SymbolTable::new();
        for (i, species) in self.species.iter().enumerate() {
            if species.floating && mutated[i] {
                symbols.insert_dynamic(&species.name)?;
            }
        }
        for intermediate in &intermediates {
            symbols.insert_dynamic(&intermediate.name)?;
        }

        // Non-dynamic values in index order.
        let mut non_dynamic_sources: Vec<&Value> = Vec::new();
        for compartment in &self.compartments {
            symbols.insert_non_dynamic(&compartment.name)?;
            non_dynamic_sources.push(&compartment.volume);
        }
        for (i, species) in self.species.iter().enumerate() {
            if !(species.floating && mutated[i]) {
                symbols.insert_non_dynamic(&species.name)?;
                non_dynamic_sources.push(&species.value);
            }
        }
        for parameter in &self.parameters {
            symbols.insert_non_dynamic(&parameter.name)?;
            non_dynamic_sources.push(&parameter.value);
        }

        let compartment_index = |id: CompartmentId| -> Result<usize> {
            match symbols.resolve(&self.compartments[id.0].name)? {
                SymbolIndex::NonDynamic(idx) => Ok(idx),
                other => Err(SimulationError::state(format!(
                    "compartment resolved to {other:?}"
                ))),
            }
        };
        let mut species_slots = Vec::with_capacity(self.species.len());
        for species in &self.species {
            species_slots.push(SpeciesSlot {
                index: symbols.resolve(&species.name)?,
                volume: compartment_index(species.compartment)?,
            });
        }
        let mut intermediate_slots = Vec::with_capacity(intermediates.len());
        for intermediate in &intermediates {
            intermediate_slots.push(SpeciesSlot {
                index: symbols.resolve(&intermediate.name)?,
                volume: compartment_index(intermediate.compartment)?,
            });
        }
        let slot = |species: &SpeciesRef| match species {
            SpeciesRef::Declared(i) => species_slots[*i],
            SpeciesRef::Intermediate(i) => intermediate_slots[*i],
        };

        let divisors: HashMap<SymbolIndex, usize> = match self.units {
            UnitsConvention::Molecules => HashMap::new(),
            UnitsConvention::Concentration { .. } => species_slots
                .iter()
                .chain(&intermediate_slots)
                .map(|s| (s.index, s.volume))
                .collect(),
        };
        let compiler = || {
            let compiler = Compiler::new(&symbols);
            if divisors.is_empty() {
                compiler
            } else {
                compiler.with_concentration_divisors(&divisors)
            }
        };

        let non_dynamic_values = non_dynamic_sources
            .iter()
            .map(|value| compile_value(value, &compiler()))
            .collect::<Result<Vec<_>>>()?;
        check_for_cycles(&non_dynamic_values, symbols.non_dynamic_names())?;

        let mut initial_dynamic_values = Vec::with_capacity(symbols.num_dynamic());
        for (i, species) in self.species.iter().enumerate() {
            if species.floating && mutated[i] {
                let value = compile_value(&species.value, &compiler())?;
                if let CompiledValue::Expression(code) = &value {
                    if reads_dynamic(code, &non_dynamic_values) {
                        return Err(SimulationError::config(format!(
                            "initial value of \"{}\" may not depend on other dynamic species",
                            species.name
                        )));
                    }
                }
                initial_dynamic_values.push(value);
            }
        }
        initial_dynamic_values.extend(intermediates.iter().map(|_| CompiledValue::Constant(0.0)));

        let mut reactions = Vec::with_capacity(expanded.len());
        let mut delayed_reactions = Vec::new();
        let mut stoichiometry = CooMatrix::new(expanded.len(), symbols.num_dynamic());
        for (r, reaction) in expanded.iter().enumerate() {
            let local_names: Vec<String> = reaction.locals.iter().map(|(n, _)| n.clone()).collect();
            let local_values: Vec<f64> = reaction.locals.iter().map(|(_, v)| *v).collect();
            let local_compiler = compiler().with_locals(&local_names);
            let rate = match &reaction.rate {
                RateLaw::MassAction(value) => {
                    CompiledRate::MassAction(compile_value(value, &local_compiler)?)
                }
                RateLaw::Custom(value) => {
                    let compiled = compile_value(value, &local_compiler)?;
                    CompiledRate::Custom(match self.units {
                        UnitsConvention::Molecules => compiled,
                        UnitsConvention::Concentration { substance_to_molecules } => {
                            scale_value(compiled, substance_to_molecules)
                        }
                    })
                }
            };

            let to_participants = |list: &[(SpeciesRef, u32)]| -> Vec<Participant> {
                list.iter()
                    .map(|(species, stoichiometry)| {
                        let s = slot(species);
                        Participant {
                            species: s.index,
                            stoichiometry: *stoichiometry,
                            volume: SymbolIndex::NonDynamic(s.volume),
                        }
                    })
                    .collect()
            };
            let reactants = to_participants(&reaction.reactants);
            let products = to_participants(&reaction.products);
            for participant in &reactants {
                if let SymbolIndex::Dynamic(c) = participant.species {
                    stoichiometry.push(r, c, -(participant.stoichiometry as f64));
                }
            }
            for participant in &products {
                if let SymbolIndex::Dynamic(c) = participant.species {
                    stoichiometry.push(r, c, participant.stoichiometry as f64);
                }
            }

            let delayed = match &reaction.delayed {
                Some(spec) => {
                    let SymbolIndex::Dynamic(intermediate) = slot(&reaction.reactants[0].0).index
                    else {
                        return Err(SimulationError::state("intermediate species is not dynamic"));
                    };
                    delayed_reactions.push(DelayedReaction {
                        reaction: r,
                        reactant: slot(&spec.reactant).index,
                        reactant_volume: SymbolIndex::NonDynamic(slot(&spec.reactant).volume),
                        intermediate,
                        rate: spec.rate,
                        delay: spec.delay,
                        kind: spec.kind,
                    });
                    Some(delayed_reactions.len() - 1)
                }
                None => None,
            };

            reactions.push(CompiledReaction {
                name: reaction.name.clone(),
                reactants,
                products,
                rate,
                locals: local_values,
                delayed,
            });
        }

        let mut feeds_solver = vec![None; symbols.num_dynamic()];
        for (i, delayed) in delayed_reactions.iter().enumerate() {
            feeds_solver[delayed.intermediate] = Some(i);
        }

        debug!(
            "compiled \"{}\": {} dynamic, {} non-dynamic symbols, {} reactions, {} delayed",
            self.name,
            symbols.num_dynamic(),
            symbols.num_non_dynamic(),
            reactions.len(),
            delayed_reactions.len()
        );

        Ok(CompiledModel {
            name: self.name.clone(),
            units: self.units,
            symbols,
            non_dynamic_values,
            initial_dynamic_values,
            reactions,
            stoichiometry: CsrMatrix::from(&stoichiometry),
            delayed_reactions,
            feeds_solver,
        })
    }

    fn expand_reactions(&self) -> Result<(Vec<ExpandedReaction>, Vec<Intermediate>)> {
        let mut expanded = Vec::with_capacity(self.reactions.len());
        let mut intermediates = Vec::new();

        for reaction in &self.reactions {
            let direct = |reaction: &Reaction| ExpandedReaction {
                name: reaction.name.clone(),
                reactants: declared(&reaction.reactants),
                products: declared(&reaction.products),
                rate: reaction.rate.clone(),
                locals: reaction.local_parameters.clone(),
                delayed: None,
            };
            let Some(delay) = reaction.delay else {
                expanded.push(direct(reaction));
                continue;
            };
            if let DelayConfig::Multistep { steps: 0 } = delay {
                return Err(SimulationError::config(format!(
                    "multistep reaction \"{}\" needs at least one step",
                    reaction.name
                )));
            }
            if let DelayConfig::Multistep { steps: 1 } = delay {
                expanded.push(direct(reaction));
                continue;
            }

            let (reactant, product, rate) = self.delayed_shape(reaction)?;
            let compartment = self.species[reactant.0].compartment;
            let mut new_intermediate = |index: usize| {
                intermediates.push(Intermediate {
                    name: format!("{}___intermed_species_{}", reaction.name, index),
                    compartment,
                });
                SpeciesRef::Intermediate(intermediates.len() - 1)
            };
            let mass_action = || RateLaw::MassAction(Value::Constant(rate));

            let first = new_intermediate(0);
            expanded.push(ExpandedReaction {
                name: reaction.name.clone(),
                reactants: vec![(SpeciesRef::Declared(reactant.0), 1)],
                products: vec![(first, 1)],
                rate: mass_action(),
                locals: Vec::new(),
                delayed: None,
            });

            let (delay, kind) = match delay {
                DelayConfig::Fixed { delay } => {
                    if !(delay > 0.0 && delay.is_finite()) {
                        return Err(SimulationError::config(format!(
                            "delay of reaction \"{}\" must be positive, got {delay}",
                            reaction.name
                        )));
                    }
                    (delay, DelayKind::Fixed)
                }
                DelayConfig::Multistep { steps } => {
                    let stages = steps - 1;
                    if stages < MIN_STAGES_FOR_DELAY_SOLVER {
                        let mut from = first;
                        for i in 0..stages {
                            let to = if i + 1 == stages {
                                SpeciesRef::Declared(product.0)
                            } else {
                                new_intermediate(i as usize + 1)
                            };
                            expanded.push(ExpandedReaction {
                                name: format!("{}___multistep_reaction_{}", reaction.name, i),
                                reactants: vec![(from, 1)],
                                products: vec![(to, 1)],
                                rate: mass_action(),
                                locals: Vec::new(),
                                delayed: None,
                            });
                            from = to;
                        }
                        continue;
                    }
                    (stages as f64 / rate, DelayKind::Multistep { stages })
                }
            };

            expanded.push(ExpandedReaction {
                name: format!("{}___delayed_reaction", reaction.name),
                reactants: vec![(first, 1)],
                products: vec![(SpeciesRef::Declared(product.0), 1)],
                rate: mass_action(),
                locals: Vec::new(),
                delayed: Some(DelaySpec {
                    reactant: SpeciesRef::Declared(reactant.0),
                    rate,
                    delay,
                    kind,
                }),
            });
        }
        Ok((expanded, intermediates))
    }

    fn delayed_shape(&self, reaction: &Reaction) -> Result<(SpeciesId, SpeciesId, f64)> {
        let fail = |what: &str| {
            Err(SimulationError::config(format!(
                "delayed reaction \"{}\" {what}",
                reaction.name
            )))
        };
        let (&[(reactant, 1)], &[(product, 1)]) =
            (reaction.reactants.as_slice(), reaction.products.as_slice())
        else {
            return fail("must have exactly one reactant and one product of stoichiometry 1");
        };
        if self.species[reactant.0].compartment != self.species[product.0].compartment {
            return fail("must keep its reactant and product in the same compartment");
        }
        let &RateLaw::MassAction(Value::Constant(rate)) = &reaction.rate else {
            return fail("must have a constant mass-action rate");
        };
        if !(rate > 0.0 && rate.is_finite()) {
            return fail("must have a positive rate constant");
        }
        Ok((reactant, product, rate))
    }
}

fn declared(list: &[(SpeciesId, u32)]) -> Vec<(SpeciesRef, u32)> {
    list.iter().map(|(id, s)| (SpeciesRef::Declared(id.0), *s)).collect()
}

fn compile_value(value: &Value, compiler: &Compiler) -> Result<CompiledValue> {
    Ok(match value {
        Value::Constant(v) => CompiledValue::Constant(*v),
        Value::Expression(expr) => CompiledValue::Expression(compiler.compile(expr)?),
    })
}

fn scale_value(value: CompiledValue, factor: f64) -> CompiledValue {
    match value {
        CompiledValue::Constant(v) => CompiledValue::Constant(v * factor),
        CompiledValue::Expression(mut code) => {
            code.ops.push(OpCode::LoadConst(factor));
            code.ops.push(OpCode::Mul);
            CompiledValue::Expression(code)
        }
    }
}

/// Whether `code` reads a dynamic symbol, directly or through the definitions of the
/// non-dynamic symbols it references.
fn reads_dynamic(code: &Bytecode, non_dynamic_values: &[CompiledValue]) -> bool {
    reaches_op(code, non_dynamic_values, |op| matches!(op, OpCode::LoadDynamic(_)))
}

/// Whether `code`, or any non-dynamic definition it reaches, contains an op matching
/// `matches`.
fn reaches_op(
    code: &Bytecode,
    non_dynamic_values: &[CompiledValue],
    matches: impl Fn(&OpCode) -> bool,
) -> bool {
    let mut visited = vec![false; non_dynamic_values.len()];
    let mut pending = vec![code];
    while let Some(code) = pending.pop() {
        if code.ops.iter().any(&matches) {
            return true;
        }
        for dependency in code.non_dynamic_references() {
            if visited[dependency] {
                continue;
            }
            visited[dependency] = true;
            if let CompiledValue::Expression(inner) = &non_dynamic_values[dependency] {
                pending.push(inner);
            }
        }
    }
    false
}

fn check_for_cycles(values: &[CompiledValue], names: &[String]) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        Active,
        Done,
    }

    fn visit(
        index: usize,
        values: &[CompiledValue],
        names: &[String],
        marks: &mut [Mark],
    ) -> Result<()> {
        match marks[index] {
            Mark::Done => return Ok(()),
            Mark::Active => {
                return Err(SimulationError::config(format!(
                    "definition of \"{}\" depends on itself",
                    names[index]
                )))
            }
            Mark::Unvisited => {}
        }
        marks[index] = Mark::Active;
        if let CompiledValue::Expression(code) = &values[index] {
            for dependency in code.non_dynamic_references() {
                visit(dependency, values, names, marks)?;
            }
        }
        marks[index] = Mark::Done;
        Ok(())
    }

    let mut marks = vec![Mark::Unvisited; values.len()];
    for index in 0..values.len() {
        visit(index, values, names, &mut marks)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum SpeciesRef {
    Declared(usize),
    Intermediate(usize),
}

#[derive(Debug, Clone, Copy)]
struct SpeciesSlot {
    index: SymbolIndex,
    volume: usize,
}

#[derive(Debug)]
struct Intermediate {
    name: String,
    compartment: CompartmentId,
}

#[derive(Debug)]
struct DelaySpec {
    reactant: SpeciesRef,
    rate: f64,
    delay: f64,
    kind: DelayKind,
}

#[derive(Debug)]
struct ExpandedReaction {
    name: String,
    reactants: Vec<(SpeciesRef, u32)>,
    products: Vec<(SpeciesRef, u32)>,
    rate: RateLaw,
    locals: Vec<(String, f64)>,
    delayed: Option<DelaySpec>,
}

/// One reactant or product of a compiled reaction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Participant {
    pub species: SymbolIndex,
    pub stoichiometry: u32,
    /// Volume of the species' compartment.
    pub volume: SymbolIndex,
}

impl Participant {
    pub fn is_dynamic(&self) -> bool {
        self.species.is_dynamic()
    }
}

#[derive(Debug, Clone)]
pub enum CompiledRate {
    MassAction(CompiledValue),
    Custom(CompiledValue),
}

#[derive(Debug, Clone)]
pub struct CompiledReaction {
    pub name: String,
    pub reactants: Vec<Participant>,
    pub products: Vec<Participant>,
    pub rate: CompiledRate,
    pub locals: Vec<f64>,
    /// Index into [`CompiledModel::delayed_reactions`].
    pub delayed: Option<usize>,
}

/// Frozen reaction network. Holds no per-run state.
#[derive(Debug, Clone)]
pub struct CompiledModel {
    name: String,
    units: UnitsConvention,
    symbols: SymbolTable,
    non_dynamic_values: Vec<CompiledValue>,
    initial_dynamic_values: Vec<CompiledValue>,
    reactions: Vec<CompiledReaction>,
    stoichiometry: CsrMatrix<f64>,
    delayed_reactions: Vec<DelayedReaction>,
    feeds_solver: Vec<Option<usize>>,
}

impl CompiledModel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn units(&self) -> UnitsConvention {
        self.units
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn num_dynamic(&self) -> usize {
        self.symbols.num_dynamic()
    }

    pub fn non_dynamic_values(&self) -> &[CompiledValue] {
        &self.non_dynamic_values
    }

    pub fn reactions(&self) -> &[CompiledReaction] {
        &self.reactions
    }

    /// Net change of every dynamic symbol per firing, one row per reaction.
    pub fn stoichiometry(&self) -> &CsrMatrix<f64> {
        &self.stoichiometry
    }

    pub fn delayed_reactions(&self) -> &[DelayedReaction] {
        &self.delayed_reactions
    }

    /// The delayed reaction whose intermediate lives at dynamic index `dynamic`.
    pub fn solver_fed_by(&self, dynamic: usize) -> Option<usize> {
        self.feeds_solver[dynamic]
    }

    pub fn min_delay(&self) -> Option<f64> {
        self.delayed_reactions
            .iter()
            .map(|d| d.delay)
            .min_by(f64::total_cmp)
    }

    pub fn evaluator<'a>(
        &'a self,
        dynamic: &'a [f64],
        time: f64,
        generation: u64,
    ) -> SymbolEvaluator<'a> {
        SymbolEvaluator::new(&self.non_dynamic_values, dynamic, time, generation)
    }

    /// Whether `value` stays the same for a whole run: a constant, or an expression
    /// that reads neither time nor dynamic species, directly or through other symbols.
    pub fn is_fixed_value(&self, value: &CompiledValue) -> bool {
        match value {
            CompiledValue::Constant(_) => true,
            CompiledValue::Expression(code) => !reaches_op(code, &self.non_dynamic_values, |op| {
                matches!(op, OpCode::LoadDynamic(_) | OpCode::LoadTime)
            }),
        }
    }

    pub fn is_fixed(&self, index: SymbolIndex) -> bool {
        match index {
            SymbolIndex::NonDynamic(i) => self.is_fixed_value(&self.non_dynamic_values[i]),
            SymbolIndex::Avogadro => true,
            SymbolIndex::Dynamic(_) | SymbolIndex::Time => false,
        }
    }

    /// Initial dynamic values, evaluated at `time`.
    pub fn initial_dynamic_values(&self, time: f64) -> Vec<f64> {
        let mut scratch = EvaluationScratch::new();
        let evaluator = self.evaluator(&[], time, 0);
        self.initial_dynamic_values
            .iter()
            .map(|value| evaluator.evaluate(value, &[], &mut scratch))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        match result {
            Ok(value) => panic!("expected error containing {needle:?}, got Ok({value:?})"),
            Err(err) => assert!(
                err.to_string().contains(needle),
                "error {err} does not contain {needle:?}"
            ),
        }
    }

    fn two_species() -> (Model, SpeciesId, SpeciesId) {
        let mut model = Model::new("test");
        let cell = model.add_compartment(Compartment::new("cell", 1.0)).expect("cell");
        let a = model.add_species(Species::new("A", cell, 100.0)).expect("A");
        let b = model.add_species(Species::new("B", cell, 5.0)).expect("B");
        (model, a, b)
    }

    #[test]
    fn dynamic_indices_are_dense_and_exclude_boundary_species() {
        let (mut model, a, b) = two_species();
        let cell = CompartmentId(0);
        let source = model
            .add_species(Species::new("S", cell, 3.0).boundary())
            .expect("S");
        model.add_species(Species::new("Idle", cell, 1.0)).expect("Idle");
        model.add_parameter(Parameter::new("k", 2.0)).expect("k");
        model
            .add_reaction(
                Reaction::new("make", RateLaw::MassAction(Value::parse("k").expect("k")))
                    .reactant(source, 1)
                    .product(b, 1),
            )
            .expect("make");
        model
            .add_reaction(
                Reaction::new("convert", RateLaw::MassAction(1.0.into()))
                    .reactant(b, 1)
                    .product(a, 1),
            )
            .expect("convert");

        let compiled = model.compile().expect("compile");
        let symbols = compiled.symbols();
        assert_eq!(symbols.get("A"), Some(SymbolIndex::Dynamic(0)));
        assert_eq!(symbols.get("B"), Some(SymbolIndex::Dynamic(1)));
        assert!(matches!(symbols.get("S"), Some(SymbolIndex::NonDynamic(_))));
        assert!(matches!(symbols.get("Idle"), Some(SymbolIndex::NonDynamic(_))));
        assert_eq!(compiled.num_dynamic(), 2);
        assert_eq!(compiled.initial_dynamic_values(0.0), vec![100.0, 5.0]);

        let make = &compiled.reactions()[0];
        assert!(!make.reactants[0].is_dynamic());
        let row = compiled.stoichiometry().row(0);
        assert_eq!(row.col_indices(), &[1]);
        assert_eq!(row.values(), &[1.0]);
    }

    #[test]
    fn rejects_invalid_participants() {
        let (mut model, a, b) = two_species();
        assert_err_contains(
            model.add_reaction(
                Reaction::new("r", RateLaw::MassAction(1.0.into()))
                    .reactant(a, 0)
                    .product(b, 1),
            ),
            "stoichiometry 0",
        );
        assert_err_contains(
            model.add_reaction(
                Reaction::new("r", RateLaw::MassAction(1.0.into()))
                    .reactant(a, 1)
                    .reactant(a, 1),
            ),
            "twice",
        );
        assert_err_contains(
            model.add_reaction(Reaction::new("r", RateLaw::MassAction(1.0.into()))),
            "neither",
        );
        assert_err_contains(model.add_parameter(Parameter::new("A", 1.0)), "more than once");
        assert_err_contains(model.add_parameter(Parameter::new("time", 1.0)), "reserved");
    }

    #[test]
    fn unknown_symbol_in_rate_is_data_not_found() {
        let (mut model, a, b) = two_species();
        model
            .add_reaction(
                Reaction::new("r", RateLaw::Custom(Value::parse("kx * A").expect("parse")))
                    .reactant(a, 1)
                    .product(b, 1),
            )
            .expect("add");
        assert!(matches!(model.compile(), Err(SimulationError::DataNotFound(_))));
    }

    #[test]
    fn cyclic_definitions_are_rejected() {
        let (mut model, _, _) = two_species();
        model.add_parameter(Parameter::new("p", Value::parse("q + 1").expect("p"))).expect("p");
        model.add_parameter(Parameter::new("q", Value::parse("p * 2").expect("q"))).expect("q");
        assert_err_contains(model.compile(), "depends on itself");
    }

    #[test]
    fn initial_values_may_not_read_species_through_parameters() {
        let (mut model, a, b) = two_species();
        let cell = CompartmentId(0);
        model
            .add_parameter(Parameter::new("twice_a", Value::parse("2 * A").expect("twice_a")))
            .expect("twice_a");
        let c = model
            .add_species(Species::new("C", cell, Value::parse("twice_a").expect("C")))
            .expect("C");
        model
            .add_reaction(
                Reaction::new("r", RateLaw::MassAction(1.0.into()))
                    .reactant(a, 1)
                    .product(b, 1)
                    .product(c, 1),
            )
            .expect("r");
        assert_err_contains(model.compile(), "may not depend on other dynamic species");
    }

    #[test]
    fn initial_values_may_read_constant_parameters() {
        let (mut model, a, b) = two_species();
        model.add_parameter(Parameter::new("base", 4.0)).expect("base");
        model
            .add_parameter(Parameter::new(
                "twice_base",
                Value::parse("2 * base").expect("twice_base"),
            ))
            .expect("twice_base");
        let c = model
            .add_species(Species::new(
                "C",
                CompartmentId(0),
                Value::parse("twice_base").expect("C"),
            ))
            .expect("C");
        model
            .add_reaction(
                Reaction::new("r", RateLaw::MassAction(1.0.into()))
                    .reactant(a, 1)
                    .product(b, 1)
                    .product(c, 1),
            )
            .expect("r");
        let compiled = model.compile().expect("compile");
        assert_eq!(compiled.initial_dynamic_values(0.0), vec![100.0, 5.0, 8.0]);
    }

    #[test]
    fn fixed_delay_expands_into_intermediate_and_delayed_reaction() {
        let (mut model, a, b) = two_species();
        model
            .add_reaction(
                Reaction::new("slow", RateLaw::MassAction(0.5.into()))
                    .reactant(a, 1)
                    .product(b, 1)
                    .with_delay(DelayConfig::Fixed { delay: 2.0 }),
            )
            .expect("slow");
        let compiled = model.compile().expect("compile");

        let names: Vec<&str> = compiled.reactions().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["slow", "slow___delayed_reaction"]);
        assert_eq!(
            compiled.symbols().get("slow___intermed_species_0"),
            Some(SymbolIndex::Dynamic(2))
        );

        let delayed = &compiled.delayed_reactions()[0];
        assert_eq!(delayed.reaction, 1);
        assert_eq!(delayed.intermediate, 2);
        assert_eq!(delayed.reactant, SymbolIndex::Dynamic(0));
        assert_eq!(delayed.delay, 2.0);
        assert_eq!(delayed.kind, DelayKind::Fixed);
        assert_eq!(compiled.solver_fed_by(2), Some(0));
        assert_eq!(compiled.solver_fed_by(0), None);
        assert_eq!(compiled.reactions()[1].delayed, Some(0));
        assert_eq!(compiled.min_delay(), Some(2.0));
    }

    #[test]
    fn short_multistep_becomes_explicit_chain() {
        let (mut model, a, b) = two_species();
        model
            .add_reaction(
                Reaction::new("chain", RateLaw::MassAction(1.0.into()))
                    .reactant(a, 1)
                    .product(b, 1)
                    .with_delay(DelayConfig::Multistep { steps: 4 }),
            )
            .expect("chain");
        let compiled = model.compile().expect("compile");
        assert_eq!(compiled.reactions().len(), 4);
        assert!(compiled.delayed_reactions().is_empty());
        assert_eq!(compiled.num_dynamic(), 2 + 3);
        let last = compiled.reactions().last().expect("last");
        assert_eq!(last.name, "chain___multistep_reaction_2");
        assert_eq!(last.products[0].species, SymbolIndex::Dynamic(1));
    }

    #[test]
    fn long_multistep_uses_gamma_delay() {
        let (mut model, a, b) = two_species();
        model
            .add_reaction(
                Reaction::new("long", RateLaw::MassAction(2.0.into()))
                    .reactant(a, 1)
                    .product(b, 1)
                    .with_delay(DelayConfig::Multistep { steps: 21 }),
            )
            .expect("long");
        let compiled = model.compile().expect("compile");
        let delayed = &compiled.delayed_reactions()[0];
        assert_eq!(delayed.kind, DelayKind::Multistep { stages: 20 });
        assert!((delayed.delay - 10.0).abs() < 1e-12);
    }

    #[test]
    fn delayed_reaction_shape_is_validated() {
        let (mut model, a, b) = two_species();
        model
            .add_reaction(
                Reaction::new("bad", RateLaw::MassAction(1.0.into()))
                    .reactant(a, 2)
                    .product(b, 1)
                    .with_delay(DelayConfig::Fixed { delay: 1.0 }),
            )
            .expect("add");
        assert_err_contains(model.compile(), "exactly one reactant");

        let (mut model, a, b) = two_species();
        model
            .add_reaction(
                Reaction::new("bad", RateLaw::MassAction(1.0.into()))
                    .reactant(a, 1)
                    .product(b, 1)
                    .with_delay(DelayConfig::Fixed { delay: 0.0 }),
            )
            .expect("add");
        assert!(matches!(model.compile(), Err(SimulationError::Configuration(_))));
    }

    #[test]
    fn concentration_units_scale_species_reads_and_custom_rates() {
        let mut model = Model::new("conc");
        model.set_units(UnitsConvention::Concentration {
            substance_to_molecules: 10.0,
        });
        let cell = model.add_compartment(Compartment::new("cell", 4.0)).expect("cell");
        let a = model.add_species(Species::new("A", cell, 8.0)).expect("A");
        model
            .add_reaction(
                Reaction::new("decay", RateLaw::Custom(Value::parse("A").expect("A")))
                    .reactant(a, 1),
            )
            .expect("decay");
        let compiled = model.compile().expect("compile");

        let dynamic = compiled.initial_dynamic_values(0.0);
        let evaluator = compiled.evaluator(&dynamic, 0.0, 0);
        let mut scratch = EvaluationScratch::new();
        let CompiledRate::Custom(rate) = &compiled.reactions()[0].rate else {
            panic!("expected a custom rate");
        };
        // (8 / 4) * 10
        assert_eq!(evaluator.evaluate(rate, &[], &mut scratch), 20.0);
    }
}
