use crate::parameters::SimulatorParameters;
use serde::{Deserialize, Serialize};

/// Output of one `simulate` call: requested symbols sampled at evenly spaced times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResults {
    pub simulator_alias: String,
    pub start_time: f64,
    pub end_time: f64,
    pub parameters: SimulatorParameters,
    pub symbol_names: Vec<String>,
    pub time_values: Vec<f64>,
    /// One row per entry of `time_values`, one column per entry of `symbol_names`.
    pub symbol_values: Vec<Vec<f64>>,
    /// Sample standard deviation across the ensemble of each symbol's final value.
    #[serde(default)]
    pub final_symbol_fluctuations: Option<Vec<f64>>,
    /// The run was cancelled; only the time points reached before are present.
    #[serde(default)]
    pub cancelled: bool,
}

impl SimulationResults {
    pub fn symbol_index(&self, name: &str) -> Option<usize> {
        self.symbol_names.iter().position(|n| n == name)
    }

    /// Values of one symbol over time.
    pub fn series(&self, name: &str) -> Option<Vec<f64>> {
        let column = self.symbol_index(name)?;
        Some(self.symbol_values.iter().map(|row| row[column]).collect())
    }

    pub fn final_values(&self) -> Option<&[f64]> {
        self.symbol_values.last().map(Vec::as_slice)
    }
}
