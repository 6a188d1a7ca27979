//! Delayed and multistep reaction completion.
//!
//! A delayed reaction has already moved its reactant into a hidden intermediate
//! species; this solver decides when the intermediate turns into product. In
//! stochastic mode it keeps the pending completion times of individual molecules. In
//! deterministic mode it keeps a sliding history of the reactant and turns it into a
//! production rate.

use crate::error::{Result, SimulationError};
use crate::history::TimeSeriesWindow;
use crate::queue::{EventQueue, FifoQueue, PriorityQueue};
use crate::symbol::SymbolIndex;
use log::debug;
use rand::Rng;
use rand_distr::{Distribution, Gamma};
use serde::{Deserialize, Serialize};

/// The history window spans this multiple of the delay.
pub const LAMBDA_MAX: f64 = 1.1;
pub const MIN_NUM_HISTORY_BINS: usize = 10;
pub const DEFAULT_NUM_HISTORY_BINS: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DelayKind {
    /// Every molecule completes exactly `delay` after it was created.
    Fixed,
    /// Completion after `stages` exponential stages, mean `delay`.
    Multistep { stages: u32 },
}

/// Where a delayed reaction lives inside a compiled model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayedReaction {
    /// Index of the intermediate-to-product reaction.
    pub reaction: usize,
    /// Species consumed by the reaction that feeds the intermediate.
    pub reactant: SymbolIndex,
    /// Volume of the reactant's compartment.
    pub reactant_volume: SymbolIndex,
    /// Dynamic index of the intermediate species.
    pub intermediate: usize,
    pub rate: f64,
    pub delay: f64,
    pub kind: DelayKind,
}

type CompletionQueue = Box<dyn EventQueue<f64> + Send>;

enum Mode {
    Uninitialized,
    Stochastic {
        completions: CompletionQueue,
        gamma: Option<Gamma<f64>>,
    },
    Deterministic {
        history: TimeSeriesWindow,
        kernel: Option<ErlangKernel>,
    },
}

pub struct DelayedReactionSolver {
    reaction: DelayedReaction,
    num_history_bins: usize,
    time_resolution: f64,
    mode: Mode,
}

impl DelayedReactionSolver {
    pub fn new(reaction: DelayedReaction) -> Result<Self> {
        if !(reaction.delay > 0.0 && reaction.delay.is_finite()) {
            return Err(SimulationError::config(format!(
                "reaction delay must be positive and finite, got {}",
                reaction.delay
            )));
        }
        if let DelayKind::Multistep { stages } = reaction.kind {
            if stages == 0 {
                return Err(SimulationError::config(
                    "multistep reaction needs at least one stage",
                ));
            }
        }
        let num_history_bins = DEFAULT_NUM_HISTORY_BINS;
        Ok(Self {
            time_resolution: LAMBDA_MAX * reaction.delay / num_history_bins as f64,
            reaction,
            num_history_bins,
            mode: Mode::Uninitialized,
        })
    }

    pub fn reaction(&self) -> &DelayedReaction {
        &self.reaction
    }

    pub fn delay(&self) -> f64 {
        self.reaction.delay
    }

    pub fn num_history_bins(&self) -> usize {
        self.num_history_bins
    }

    pub fn time_resolution(&self) -> f64 {
        self.time_resolution
    }

    /// Takes effect at the next `initialize`.
    pub fn set_num_history_bins(&mut self, num_history_bins: usize) -> Result<()> {
        if num_history_bins < MIN_NUM_HISTORY_BINS {
            return Err(SimulationError::config(format!(
                "number of history bins must be at least {MIN_NUM_HISTORY_BINS}, got {}",
                num_history_bins
            )));
        }
        self.num_history_bins = num_history_bins;
        self.time_resolution = LAMBDA_MAX * self.reaction.delay / num_history_bins as f64;
        Ok(())
    }

    pub fn initialize(&mut self, stochastic: bool) -> Result<()> {
        self.mode = if stochastic {
            let (completions, gamma) = match self.reaction.kind {
                DelayKind::Fixed => (
                    Box::new(FifoQueue::new()) as CompletionQueue,
                    None,
                ),
                DelayKind::Multistep { stages } => {
                    let shape = stages as f64;
                    let gamma = Gamma::new(shape, self.reaction.delay / shape).map_err(|e| {
                        SimulationError::config(format!("invalid completion distribution: {e}"))
                    })?;
                    (
                        Box::new(PriorityQueue::new(f64::total_cmp)) as CompletionQueue,
                        Some(gamma),
                    )
                }
            };
            Mode::Stochastic { completions, gamma }
        } else {
            let kernel = match self.reaction.kind {
                DelayKind::Fixed => None,
                DelayKind::Multistep { stages } => {
                    Some(ErlangKernel::new(stages, self.reaction.delay))
                }
            };
            Mode::Deterministic {
                history: TimeSeriesWindow::new(self.num_history_bins),
                kernel,
            }
        };
        debug!(
            "delayed reaction {} initialized ({}), resolution {}",
            self.reaction.reaction,
            if stochastic { "stochastic" } else { "deterministic" },
            self.time_resolution
        );
        Ok(())
    }

    /// Schedules the completion of one molecule created at `time`.
    pub fn add_reactant<R: Rng + ?Sized>(&mut self, time: f64, rng: &mut R) -> Result<()> {
        match &mut self.mode {
            Mode::Stochastic { completions, gamma } => {
                let completion = match gamma {
                    Some(gamma) => time + gamma.sample(rng),
                    None => time + self.reaction.delay,
                };
                completions.add(completion);
                Ok(())
            }
            _ => Err(SimulationError::state(
                "add_reactant requires a solver initialized for stochastic simulation",
            )),
        }
    }

    pub fn can_have_reaction(&self) -> bool {
        match &self.mode {
            Mode::Stochastic { completions, .. } => !completions.is_empty(),
            _ => false,
        }
    }

    pub fn peek_next_reaction_time(&self) -> Option<f64> {
        match &self.mode {
            Mode::Stochastic { completions, .. } => completions.peek_next().copied(),
            _ => None,
        }
    }

    pub fn poll_next_reaction_time(&mut self) -> Option<f64> {
        match &mut self.mode {
            Mode::Stochastic { completions, .. } => completions.get_next(),
            _ => None,
        }
    }

    /// Records the reactant value at `time`, resampled onto the history grid.
    pub fn update(&mut self, time: f64, reactant_value: f64) -> Result<()> {
        let resolution = self.time_resolution;
        match &mut self.mode {
            Mode::Deterministic { history, .. } => {
                match history.last_time() {
                    None => history.insert(time, reactant_value),
                    Some(mut last) => {
                        let pending = ((time - last) / resolution).floor();
                        let capacity = history.capacity() as f64;
                        if pending > capacity {
                            last += (pending - capacity) * resolution;
                        }
                        while time - last > resolution {
                            last += resolution;
                            history.insert(last, reactant_value);
                        }
                    }
                }
                Ok(())
            }
            _ => Err(SimulationError::state(
                "update requires a solver initialized for deterministic simulation",
            )),
        }
    }

    /// Deterministic production rate at `time`; always zero in stochastic mode.
    pub fn compute_rate(&self, time: f64, intermediate_value: f64) -> f64 {
        let Mode::Deterministic { history, kernel } = &self.mode else {
            return 0.0;
        };
        if intermediate_value <= 0.0 || history.is_empty() {
            return 0.0;
        }
        let past = match kernel {
            None => self.lookup_delayed(history, time),
            Some(kernel) => self.convolve(history, kernel, time),
        };
        self.reaction.rate * past
    }

    fn lookup_delayed(&self, history: &TimeSeriesWindow, time: f64) -> f64 {
        let peak_time = time - self.reaction.delay;
        let Some(min_time) = history.min_time() else {
            return 0.0;
        };
        if peak_time < min_time {
            return 0.0;
        }
        let position = (peak_time - min_time) / self.time_resolution;
        let index = position.floor() as usize;
        let last = history.len() - 1;
        if index >= last {
            return history.value(last);
        }
        let fraction = position - index as f64;
        let lower = history.value(index);
        lower + fraction * (history.value(index + 1) - lower)
    }

    fn convolve(&self, history: &TimeSeriesWindow, kernel: &ErlangKernel, time: f64) -> f64 {
        let count = history.len();
        let mut sum = 0.0;
        for (i, (sample_time, value)) in history.iter().enumerate() {
            let weight = if i == 0 || i + 1 == count {
                1.0 / 3.0
            } else if i % 2 == 1 {
                4.0 / 3.0
            } else {
                2.0 / 3.0
            };
            sum += weight * value * kernel.density(time - sample_time);
        }
        sum * self.time_resolution
    }

    /// Drops all pending completions and history, keeping the mode.
    pub fn clear(&mut self) {
        match &mut self.mode {
            Mode::Stochastic { completions, .. } => completions.clear(),
            Mode::Deterministic { history, .. } => history.clear(),
            Mode::Uninitialized => {}
        }
    }
}

/// Density of the sum of `stages` exponential stages with total mean `delay`.
#[derive(Debug, Clone, Copy)]
struct ErlangKernel {
    stages: u32,
    rate: f64,
    ln_norm: f64,
}

impl ErlangKernel {
    fn new(stages: u32, delay: f64) -> Self {
        let rate = stages as f64 / delay;
        let ln_factorial: f64 = (1..stages).map(|i| (i as f64).ln()).sum();
        Self {
            stages,
            rate,
            ln_norm: stages as f64 * rate.ln() - ln_factorial,
        }
    }

    fn density(&self, elapsed: f64) -> f64 {
        if elapsed < 0.0 {
            return 0.0;
        }
        if elapsed == 0.0 {
            return if self.stages == 1 { self.rate } else { 0.0 };
        }
        (self.ln_norm + (self.stages - 1) as f64 * elapsed.ln() - self.rate * elapsed).exp()
    }
}
