use crate::error::{Result, SimulationError};
use crate::traits::{DynamicalSystem, Scalar, Steppable};

/// Classic Runge-Kutta 4th Order Solver
pub struct RK4<T: Scalar> {
    k1: Vec<T>,
    k2: Vec<T>,
    k3: Vec<T>,
    k4: Vec<T>,
    tmp: Vec<T>,
}

impl<T: Scalar> RK4<T> {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![T::zero(); dim],
            k2: vec![T::zero(); dim],
            k3: vec![T::zero(); dim],
            k4: vec![T::zero(); dim],
            tmp: vec![T::zero(); dim],
        }
    }

    /// One step followed by clamping negative components to zero, for state vectors
    /// that hold populations or concentrations.
    pub fn step_non_negative(
        &mut self,
        system: &impl DynamicalSystem<T>,
        t: &mut T,
        state: &mut [T],
        dt: T,
    ) {
        self.step(system, t, state, dt);
        for value in state.iter_mut() {
            if *value < T::zero() {
                *value = T::zero();
            }
        }
    }
}

impl<T: Scalar> Steppable<T> for RK4<T> {
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        let half = T::from_f64(0.5).unwrap_or_else(T::zero);
        let two = T::one() + T::one();
        let sixth = T::one() / (two + two + two);

        let t0 = *t;

        // k1 = f(t, y)
        system.apply(t0, state, &mut self.k1);

        // k2 = f(t + dt/2, y + dt*k1/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k1[i] * half;
        }
        system.apply(t0 + dt * half, &self.tmp, &mut self.k2);

        // k3 = f(t + dt/2, y + dt*k2/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k2[i] * half;
        }
        system.apply(t0 + dt * half, &self.tmp, &mut self.k3);

        // k4 = f(t + dt, y + dt*k3)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k3[i];
        }
        system.apply(t0 + dt, &self.tmp, &mut self.k4);

        // y_next = y + dt/6 * (k1 + 2k2 + 2k3 + k4)
        for i in 0..state.len() {
            state[i] = state[i]
                + dt * sixth * (self.k1[i] + two * self.k2[i] + two * self.k3[i] + self.k4[i]);
        }

        *t = t0 + dt;
    }
}

/// Aggregated local error of one step.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StepError {
    /// Sum over components of `|full - halved| / scale`.
    pub relative: f64,
    /// Sum over components of `|full - halved|`.
    pub absolute: f64,
}

/// Richardson step-doubling: one full RK4 step compared against two half steps.
pub struct StepDoubling {
    rk4: RK4<f64>,
    full: Vec<f64>,
    halved: Vec<f64>,
    scale: Vec<f64>,
}

impl StepDoubling {
    pub fn new(dim: usize) -> Self {
        Self {
            rk4: RK4::new(dim),
            full: vec![0.0; dim],
            halved: vec![0.0; dim],
            scale: vec![0.0; dim],
        }
    }

    /// Result of the most recent full-size step.
    pub fn full_step(&self) -> &[f64] {
        &self.full
    }

    /// Estimates the local error of stepping `state` from `t` by `h`, with the error
    /// scale taken at the same `h`.
    pub fn estimate(
        &mut self,
        system: &impl DynamicalSystem<f64>,
        t: f64,
        state: &[f64],
        h: f64,
    ) -> Result<StepError> {
        self.compute_scale(system, t, state, h)?;
        Ok(self.step_error(system, t, state, h))
    }

    /// Sets the per-component error scale `|y| + |h dy/dt|` used by [`Self::step_error`].
    ///
    /// Components whose scale is exactly zero carry no information and are skipped.
    /// If every scale is zero this fails.
    pub fn compute_scale(
        &mut self,
        system: &impl DynamicalSystem<f64>,
        t: f64,
        state: &[f64],
        h: f64,
    ) -> Result<()> {
        if state.is_empty() {
            return Ok(());
        }
        system.apply(t, state, &mut self.scale);
        for (scale, y) in self.scale.iter_mut().zip(state) {
            *scale = y.abs() + (h * *scale).abs();
        }
        if self.scale.iter().all(|s| *s == 0.0) {
            return Err(SimulationError::accuracy(
                "unable to determine any scale for the step error",
            ));
        }
        Ok(())
    }

    /// Local error of stepping `state` from `t` by `h`, measured against the scale of
    /// the last [`Self::compute_scale`] call.
    pub fn step_error(
        &mut self,
        system: &impl DynamicalSystem<f64>,
        t: f64,
        state: &[f64],
        h: f64,
    ) -> StepError {
        if state.is_empty() {
            return StepError::default();
        }

        self.full.copy_from_slice(state);
        let mut time = t;
        self.rk4.step_non_negative(system, &mut time, &mut self.full, h);

        self.halved.copy_from_slice(state);
        let mut time = t;
        let half = h / 2.0;
        self.rk4.step_non_negative(system, &mut time, &mut self.halved, half);
        self.rk4.step_non_negative(system, &mut time, &mut self.halved, half);

        let mut error = StepError::default();
        for i in 0..state.len() {
            if self.scale[i] > 0.0 {
                let delta = (self.full[i] - self.halved[i]).abs();
                error.relative += delta / self.scale[i];
                error.absolute += delta;
            }
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Decay {
        rate: f64,
    }

    impl DynamicalSystem<f64> for Decay {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) {
            out[0] = -self.rate * x[0];
        }
    }

    struct Drain;

    impl DynamicalSystem<f64> for Drain {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, _t: f64, _x: &[f64], out: &mut [f64]) {
            out[0] = -10.0;
        }
    }

    struct Still;

    impl DynamicalSystem<f64> for Still {
        fn dimension(&self) -> usize {
            2
        }

        fn apply(&self, _t: f64, _x: &[f64], out: &mut [f64]) {
            out.fill(0.0);
        }
    }

    #[test]
    fn rk4_is_fourth_order_on_decay() {
        let system = Decay { rate: 1.0 };
        let mut solver = RK4::new(1);
        let mut t = 0.0;
        let mut state = [1.0];
        for _ in 0..100 {
            solver.step(&system, &mut t, &mut state, 0.01);
        }
        assert!((t - 1.0_f64).abs() < 1e-12);
        assert!((state[0] - (-1.0_f64).exp()).abs() < 1e-10);
    }

    #[test]
    fn non_negative_step_clamps() {
        let mut solver = RK4::new(1);
        let mut t = 0.0;
        let mut state = [1.0];
        solver.step_non_negative(&Drain, &mut t, &mut state, 1.0);
        assert_eq!(state[0], 0.0);
    }

    #[test]
    fn step_doubling_error_shrinks_with_step() {
        let system = Decay { rate: 2.0 };
        let mut doubling = StepDoubling::new(1);
        let coarse = doubling.estimate(&system, 0.0, &[1.0], 0.2).expect("coarse");
        let fine = doubling.estimate(&system, 0.0, &[1.0], 0.1).expect("fine");
        assert!(coarse.absolute > 0.0);
        // Local error of RK4 scales with h^5.
        assert!(fine.absolute < coarse.absolute / 16.0);
        assert!((doubling.full_step()[0] - (-0.2_f64).exp()).abs() < 1e-5);
    }

    #[test]
    fn scale_is_kept_across_shorter_retries() {
        let system = Decay { rate: 2.0 };
        let mut doubling = StepDoubling::new(1);
        // |1| + |1.0 * -2|
        doubling.compute_scale(&system, 0.0, &[1.0], 1.0).expect("scale");
        let retry = doubling.step_error(&system, 0.0, &[1.0], 0.1);
        assert!(retry.absolute > 0.0);
        assert!((retry.relative * 3.0 / retry.absolute - 1.0).abs() < 1e-12);

        let fresh = doubling.estimate(&system, 0.0, &[1.0], 0.1).expect("fresh");
        assert!((fresh.relative * 1.2 / fresh.absolute - 1.0).abs() < 1e-12);
    }

    #[test]
    fn zero_scales_fail_the_estimate() {
        let mut doubling = StepDoubling::new(2);
        let result = doubling.estimate(&Still, 0.0, &[0.0, 0.0], 0.1);
        assert!(matches!(result, Err(SimulationError::Accuracy(_))));
    }
}
