use crate::delayed::MIN_NUM_HISTORY_BINS;
use crate::error::{Result, SimulationError};
use serde::{Deserialize, Serialize};

/// Run configuration. Every field is optional; each algorithm requires the subset it
/// uses and rejects a run when one of those is missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulatorParameters {
    pub ensemble_size: Option<u32>,
    pub max_allowed_relative_error: Option<f64>,
    pub max_allowed_absolute_error: Option<f64>,
    /// Step size as a fraction of the simulated interval.
    pub step_size_fraction: Option<f64>,
    pub min_num_steps: Option<u64>,
    pub num_history_bins: Option<usize>,
    pub compute_fluctuations: Option<bool>,
    /// Reseeds the random number generator at the start of every run.
    pub random_seed: Option<u64>,
}

fn missing(field: &str) -> SimulationError {
    SimulationError::config(format!("required simulator parameter \"{field}\" is missing"))
}

impl SimulatorParameters {
    pub fn with_ensemble_size(mut self, ensemble_size: u32) -> Self {
        self.ensemble_size = Some(ensemble_size);
        self
    }

    pub fn with_max_allowed_relative_error(mut self, error: f64) -> Self {
        self.max_allowed_relative_error = Some(error);
        self
    }

    pub fn with_max_allowed_absolute_error(mut self, error: f64) -> Self {
        self.max_allowed_absolute_error = Some(error);
        self
    }

    pub fn with_step_size_fraction(mut self, fraction: f64) -> Self {
        self.step_size_fraction = Some(fraction);
        self
    }

    pub fn with_min_num_steps(mut self, steps: u64) -> Self {
        self.min_num_steps = Some(steps);
        self
    }

    pub fn with_num_history_bins(mut self, bins: usize) -> Self {
        self.num_history_bins = Some(bins);
        self
    }

    pub fn with_compute_fluctuations(mut self, compute: bool) -> Self {
        self.compute_fluctuations = Some(compute);
        self
    }

    pub fn with_random_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }

    pub fn require_ensemble_size(&self) -> Result<u32> {
        let size = self.ensemble_size.ok_or_else(|| missing("ensemble_size"))?;
        if size == 0 {
            return Err(SimulationError::config("ensemble size must be at least 1"));
        }
        Ok(size)
    }

    pub fn require_max_allowed_relative_error(&self) -> Result<f64> {
        let error = self
            .max_allowed_relative_error
            .ok_or_else(|| missing("max_allowed_relative_error"))?;
        positive("maximum allowed relative error", error)
    }

    pub fn require_max_allowed_absolute_error(&self) -> Result<f64> {
        let error = self
            .max_allowed_absolute_error
            .ok_or_else(|| missing("max_allowed_absolute_error"))?;
        positive("maximum allowed absolute error", error)
    }

    pub fn require_step_size_fraction(&self) -> Result<f64> {
        let fraction = self
            .step_size_fraction
            .ok_or_else(|| missing("step_size_fraction"))?;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(SimulationError::config(format!(
                "step size fraction must lie in (0, 1], got {fraction}"
            )));
        }
        Ok(fraction)
    }

    pub fn require_num_history_bins(&self) -> Result<usize> {
        let bins = self.num_history_bins.ok_or_else(|| missing("num_history_bins"))?;
        if bins < MIN_NUM_HISTORY_BINS {
            return Err(SimulationError::config(format!(
                "number of history bins must be at least {MIN_NUM_HISTORY_BINS}, got {bins}"
            )));
        }
        Ok(bins)
    }

    /// `None` when absent; zero is rejected.
    pub fn min_num_steps(&self) -> Result<Option<u64>> {
        match self.min_num_steps {
            Some(0) => Err(SimulationError::config("minimum number of steps must be positive")),
            other => Ok(other),
        }
    }

    pub fn compute_fluctuations(&self) -> bool {
        self.compute_fluctuations.unwrap_or(false)
    }
}

fn positive(what: &str, value: f64) -> Result<f64> {
    if !(value > 0.0 && value.is_finite()) {
        return Err(SimulationError::config(format!(
            "{what} must be positive, got {value}"
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_name_the_field() {
        let params = SimulatorParameters::default();
        let err = params.require_ensemble_size().unwrap_err();
        assert!(err.to_string().contains("ensemble_size"));
        assert!(matches!(
            params.require_step_size_fraction(),
            Err(SimulationError::Configuration(_))
        ));
    }

    #[test]
    fn values_are_range_checked() {
        let params = SimulatorParameters::default()
            .with_ensemble_size(0)
            .with_step_size_fraction(1.5)
            .with_num_history_bins(5)
            .with_max_allowed_relative_error(-1.0)
            .with_min_num_steps(0);
        assert!(params.require_ensemble_size().is_err());
        assert!(params.require_step_size_fraction().is_err());
        assert!(params.require_num_history_bins().is_err());
        assert!(params.require_max_allowed_relative_error().is_err());
        assert!(params.min_num_steps().is_err());
    }

    #[test]
    fn builder_sets_fields() {
        let params = SimulatorParameters::default()
            .with_ensemble_size(4)
            .with_compute_fluctuations(true)
            .with_random_seed(9);
        assert_eq!(params.require_ensemble_size().expect("size"), 4);
        assert!(params.compute_fluctuations());
        assert_eq!(params.random_seed, Some(9));
    }
}
