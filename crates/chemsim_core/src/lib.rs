//! The `chemsim_core` crate simulates chemical reaction networks, stochastically with
//! Gillespie's direct method or Gibson and Bruck's next-reaction method, or
//! deterministically with Runge-Kutta integration of the rate equations.
//!
//! Key components:
//! - **Model**: compartments, species, parameters and reactions, compiled once into a
//!   frozen `CompiledModel` that holds only dense symbol indices.
//! - **Equation Engine**: parser, bytecode compiler and stack VM for rate and value
//!   expressions.
//! - **Delayed reactions**: fixed and Gamma-distributed completion delays, as event
//!   queues (stochastic) or history convolution (deterministic).
//! - **Simulators**: `GillespieDirect`, `GibsonBruck` and `RungeKuttaSimulator` behind the
//!   `Simulator` trait, selected through `Algorithm`.
//! - **Control**: cooperative pause/cancel and progress reporting across threads.
pub mod control;
pub mod delayed;
pub mod equation_engine;
pub mod error;
pub mod evaluator;
pub mod history;
pub mod model;
pub mod parameters;
pub mod queue;
pub mod rate_factor;
pub mod results;
pub mod simulator;
pub mod solvers;
pub mod symbol;
pub mod traits;
