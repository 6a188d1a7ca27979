//! Symbol resolution.
//!
//! Names are resolved exactly once, when a `Model` is compiled. Everything downstream
//! of compilation holds a [`SymbolIndex`] into one of two flat arrays: the dynamic
//! array (species mutated by some reaction, owned per trial) and the non-dynamic array
//! (parameters, compartments, boundary species, shared read-only).

use crate::equation_engine::{self, Bytecode, Expr};
use crate::error::{Result, SimulationError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Reserved symbol holding the current simulated time.
pub const TIME_SYMBOL: &str = "time";
/// Reserved symbol holding Avogadro's number.
pub const AVOGADRO_SYMBOL: &str = "Navo";
pub const AVOGADRO: f64 = 6.0221415e23;

pub fn is_reserved(name: &str) -> bool {
    name == TIME_SYMBOL || name == AVOGADRO_SYMBOL
}

/// Location of a symbol's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymbolIndex {
    Dynamic(usize),
    NonDynamic(usize),
    Time,
    Avogadro,
}

impl SymbolIndex {
    pub fn is_dynamic(&self) -> bool {
        matches!(self, SymbolIndex::Dynamic(_))
    }
}

/// A resolved name. Two symbols for the same name always carry the same index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol {
    name: String,
    index: SymbolIndex,
}

impl Symbol {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> SymbolIndex {
        self.index
    }
}

/// Name to index map built by the model compiler.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    indices: HashMap<String, SymbolIndex>,
    dynamic_names: Vec<String>,
    non_dynamic_names: Vec<String>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        let mut indices = HashMap::new();
        indices.insert(TIME_SYMBOL.to_string(), SymbolIndex::Time);
        indices.insert(AVOGADRO_SYMBOL.to_string(), SymbolIndex::Avogadro);
        Self {
            indices,
            dynamic_names: Vec::new(),
            non_dynamic_names: Vec::new(),
        }
    }

    /// Appends `name` to the dynamic array and returns its dense index.
    pub fn insert_dynamic(&mut self, name: &str) -> Result<usize> {
        let index = self.dynamic_names.len();
        self.insert(name, SymbolIndex::Dynamic(index))?;
        self.dynamic_names.push(name.to_string());
        Ok(index)
    }

    /// Appends `name` to the non-dynamic array and returns its dense index.
    pub fn insert_non_dynamic(&mut self, name: &str) -> Result<usize> {
        let index = self.non_dynamic_names.len();
        self.insert(name, SymbolIndex::NonDynamic(index))?;
        self.non_dynamic_names.push(name.to_string());
        Ok(index)
    }

    fn insert(&mut self, name: &str, index: SymbolIndex) -> Result<()> {
        if is_reserved(name) {
            return Err(SimulationError::config(format!(
                "symbol name \"{name}\" is reserved"
            )));
        }
        if self.indices.contains_key(name) {
            return Err(SimulationError::config(format!(
                "symbol \"{name}\" is defined more than once"
            )));
        }
        self.indices.insert(name.to_string(), index);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<SymbolIndex> {
        self.indices.get(name).copied()
    }

    pub fn resolve(&self, name: &str) -> Result<SymbolIndex> {
        self.get(name)
            .ok_or_else(|| SimulationError::not_found(format!("unknown symbol \"{name}\"")))
    }

    pub fn symbol(&self, name: &str) -> Result<Symbol> {
        Ok(Symbol {
            name: name.to_string(),
            index: self.resolve(name)?,
        })
    }

    pub fn dynamic_names(&self) -> &[String] {
        &self.dynamic_names
    }

    pub fn non_dynamic_names(&self) -> &[String] {
        &self.non_dynamic_names
    }

    pub fn num_dynamic(&self) -> usize {
        self.dynamic_names.len()
    }

    pub fn num_non_dynamic(&self) -> usize {
        self.non_dynamic_names.len()
    }
}

/// A quantity as supplied by the model builder.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Constant(f64),
    Expression(Expr),
}

impl Value {
    /// Parses `text` as an expression, folding a bare number into a constant.
    pub fn parse(text: &str) -> Result<Self> {
        let expr = equation_engine::parse(text).map_err(SimulationError::Expression)?;
        Ok(match expr {
            Expr::Number(n) => Value::Constant(n),
            other => Value::Expression(other),
        })
    }

    pub fn as_constant(&self) -> Option<f64> {
        match self {
            Value::Constant(v) => Some(*v),
            Value::Expression(_) => None,
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Constant(value)
    }
}

/// A `Value` whose names have been resolved against a `SymbolTable`.
#[derive(Debug, Clone)]
pub enum CompiledValue {
    Constant(f64),
    Expression(Bytecode),
}

impl CompiledValue {
    pub fn as_constant(&self) -> Option<f64> {
        match self {
            CompiledValue::Constant(v) => Some(*v),
            CompiledValue::Expression(_) => None,
        }
    }
}
