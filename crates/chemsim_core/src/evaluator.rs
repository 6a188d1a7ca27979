//! Time-aware symbol lookup used inside the per-step hot loops.

use crate::equation_engine::{SymbolSource, VM};
use crate::symbol::{CompiledValue, SymbolIndex, AVOGADRO};

/// Mutable buffers that belong to exactly one trial: the VM stack and the cache of
/// non-dynamic expression values.
///
/// The cache is keyed by an evaluation generation. A lookup under a generation other
/// than the cached one discards every cached value first, so the owner only has to
/// bump its generation whenever time or the dynamic values change.
#[derive(Debug, Default, Clone)]
pub struct EvaluationScratch {
    stack: Vec<f64>,
    generation: Option<u64>,
    cached: Vec<Option<f64>>,
}

impl EvaluationScratch {
    pub fn new() -> Self {
        Self {
            stack: Vec::with_capacity(64),
            generation: None,
            cached: Vec::new(),
        }
    }

    fn sync(&mut self, generation: u64, len: usize) {
        if self.generation != Some(generation) || self.cached.len() != len {
            self.cached.clear();
            self.cached.resize(len, None);
            self.generation = Some(generation);
        }
    }
}

/// Read-only view of every symbol value at one instant.
pub struct SymbolEvaluator<'a> {
    non_dynamic: &'a [CompiledValue],
    dynamic: &'a [f64],
    time: f64,
    generation: u64,
}

impl<'a> SymbolEvaluator<'a> {
    pub fn new(
        non_dynamic: &'a [CompiledValue],
        dynamic: &'a [f64],
        time: f64,
        generation: u64,
    ) -> Self {
        Self {
            non_dynamic,
            dynamic,
            time,
            generation,
        }
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn dynamic_values(&self) -> &[f64] {
        self.dynamic
    }

    pub fn value(&self, index: SymbolIndex, scratch: &mut EvaluationScratch) -> f64 {
        match index {
            SymbolIndex::Dynamic(idx) => self.dynamic[idx],
            SymbolIndex::NonDynamic(idx) => match &self.non_dynamic[idx] {
                CompiledValue::Constant(v) => *v,
                CompiledValue::Expression(_) => {
                    scratch.sync(self.generation, self.non_dynamic.len());
                    let mut frame = Frame {
                        evaluator: self,
                        locals: &[],
                        cache: &mut scratch.cached,
                    };
                    frame.non_dynamic(idx, &mut scratch.stack)
                }
            },
            SymbolIndex::Time => self.time,
            SymbolIndex::Avogadro => AVOGADRO,
        }
    }

    /// Evaluates `value` with `locals` as the innermost scope.
    pub fn evaluate(
        &self,
        value: &CompiledValue,
        locals: &[f64],
        scratch: &mut EvaluationScratch,
    ) -> f64 {
        match value {
            CompiledValue::Constant(v) => *v,
            CompiledValue::Expression(code) => {
                scratch.sync(self.generation, self.non_dynamic.len());
                let mut frame = Frame {
                    evaluator: self,
                    locals,
                    cache: &mut scratch.cached,
                };
                VM::execute(code, &mut frame, &mut scratch.stack)
            }
        }
    }
}

struct Frame<'f, 'a> {
    evaluator: &'f SymbolEvaluator<'a>,
    locals: &'f [f64],
    cache: &'f mut Vec<Option<f64>>,
}

impl SymbolSource for Frame<'_, '_> {
    fn time(&self) -> f64 {
        self.evaluator.time
    }

    fn dynamic(&self, index: usize) -> f64 {
        self.evaluator.dynamic[index]
    }

    fn local(&self, index: usize) -> f64 {
        self.locals[index]
    }

    fn non_dynamic(&mut self, index: usize, stack: &mut Vec<f64>) -> f64 {
        if let Some(v) = self.cache[index] {
            return v;
        }
        let value = match &self.evaluator.non_dynamic[index] {
            CompiledValue::Constant(v) => *v,
            CompiledValue::Expression(code) => {
                // Locals never leak into another symbol's definition.
                let mut nested = Frame {
                    evaluator: self.evaluator,
                    locals: &[],
                    cache: &mut *self.cache,
                };
                VM::execute(code, &mut nested, stack)
            }
        };
        self.cache[index] = Some(value);
        value
    }
}
