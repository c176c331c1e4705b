//! Composable Markov chain Monte Carlo updates over pluggable energy
//! functions.
//!
//! The crate draws samples from a target distribution given only its
//! "energy" (negative unnormalized log density). A run is described by a
//! nested list of update operations — momentum heatbath, Metropolis,
//! leapfrog dynamics, windowed and threshold hybrid Monte Carlo, spiral
//! dynamics, slice sampling and the tempering family — which a [`Sampler`]
//! validates once and then executes every iteration, mutating a
//! [`DynamicState`] owned by the caller and recording diagnostics in an
//! [`IterRecord`].

pub(crate) mod hybrid;
pub(crate) mod math;
pub(crate) mod model;
pub(crate) mod ops;
pub(crate) mod sampler;
pub(crate) mod slice;
pub(crate) mod state;
pub(crate) mod tempering;
pub(crate) mod traj;

pub use model::{Eval, Model};
pub use ops::{ConfigError, Op, StepsizeSpec, MAX_TEMP_REPEAT};
pub use sampler::Sampler;
pub use state::{DynamicState, IterRecord};
pub use tempering::{TempRung, TempSchedule, TempState};
pub use traj::TrajSpec;
