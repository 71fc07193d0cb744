//! Pluggable plant dynamics and control laws.
//!
//! The HIL core only ever sees these two capabilities. Closures with the
//! matching signature implement them directly, and two small reference
//! implementations are provided for demos and tests.

use serde::{Deserialize, Serialize};

use crate::error::ComputeError;

/// Numerical integration of the simulated plant.
pub trait Plant: Send {
    /// Advance `state` by `dt` seconds while applying actuator command `u`.
    fn step(&mut self, state: &[f64], u: f64, dt: f64) -> Vec<f64>;
}

impl<F> Plant for F
where
    F: FnMut(&[f64], f64, f64) -> Vec<f64> + Send,
{
    fn step(&mut self, state: &[f64], u: f64, dt: f64) -> Vec<f64> {
        self(state, u, dt)
    }
}

/// The control law under test.
pub trait ControlLaw: Send {
    /// Compute the actuator command for a measured state.
    fn compute(&mut self, state: &[f64]) -> Result<f64, ComputeError>;
}

impl<F> ControlLaw for F
where
    F: FnMut(&[f64]) -> Result<f64, ComputeError> + Send,
{
    fn compute(&mut self, state: &[f64]) -> Result<f64, ComputeError> {
        self(state)
    }
}

/// Point mass driven by a force, with state `[position, velocity]`,
/// integrated with semi-implicit Euler.
#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
pub struct DoubleIntegrator {
    pub mass: f64,
}

impl Default for DoubleIntegrator {
    fn default() -> Self {
        Self { mass: 1.0 }
    }
}

impl Plant for DoubleIntegrator {
    fn step(&mut self, state: &[f64], u: f64, dt: f64) -> Vec<f64> {
        let (x, v) = match state {
            [x, v, ..] => (*x, *v),
            [x] => (*x, 0.0),
            [] => (0.0, 0.0),
        };
        let v = v + u / self.mass * dt;
        let x = x + v * dt;
        vec![x, v]
    }
}

/// Full-state feedback `u = -K (x - r)`.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct StateFeedback {
    pub gains: Vec<f64>,
    pub setpoint: Vec<f64>,
}

impl StateFeedback {
    /// Regulate to the origin.
    pub fn new(gains: Vec<f64>) -> Self {
        let setpoint = vec![0.0; gains.len()];
        Self { gains, setpoint }
    }

    pub fn with_setpoint(mut self, setpoint: Vec<f64>) -> Self {
        self.setpoint = setpoint;
        self
    }
}

impl ControlLaw for StateFeedback {
    fn compute(&mut self, state: &[f64]) -> Result<f64, ComputeError> {
        if state.len() != self.gains.len() || self.setpoint.len() != self.gains.len() {
            return Err(ComputeError::Failed(format!(
                "state has {} components but {} gains and {} setpoints are configured",
                state.len(),
                self.gains.len(),
                self.setpoint.len()
            )));
        }

        let u = -self
            .gains
            .iter()
            .zip(state.iter().zip(&self.setpoint))
            .map(|(k, (x, r))| k * (x - r))
            .sum::<f64>();
        Ok(u)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_integrator_accelerates_under_force() {
        let mut plant = DoubleIntegrator { mass: 2.0 };
        let next = plant.step(&[0.0, 0.0], 4.0, 0.5);
        assert_eq!(next, vec![0.5, 1.0]);
    }

    #[test]
    fn feedback_regulates_to_setpoint() {
        let mut law = StateFeedback::new(vec![2.0, 1.0]).with_setpoint(vec![1.0, 0.0]);
        assert_eq!(law.compute(&[1.0, 0.0]), Ok(0.0));
        assert_eq!(law.compute(&[2.0, 1.0]), Ok(-3.0));
        assert!(law.compute(&[1.0]).is_err());
    }

    #[test]
    fn closures_are_plants_and_laws() {
        let mut plant = |s: &[f64], u: f64, dt: f64| vec![s[0] + u * dt];
        let mut law = |s: &[f64]| -> Result<f64, ComputeError> { Ok(-s[0]) };
        let s = plant.step(&[1.0], 2.0, 0.5);
        assert_eq!(s, vec![2.0]);
        assert_eq!(law.compute(&s), Ok(-2.0));
    }
}
