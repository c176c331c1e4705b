use crate::state::{DynamicState, IterRecord};

/// Context for one energy evaluation.
///
/// `inv_temp` is the inverse temperature of the active tempering rung
/// (1.0 outside tempering operations). `approx_order` is the current
/// traversal order over the energy function's coordinate partitions; models
/// that do not support partial evaluation can ignore it.
#[derive(Debug, Clone, Copy)]
pub struct Eval<'a> {
    pub inv_temp: f64,
    pub approx_order: &'a [i32],
}

/// The model being sampled from, defined by its energy function.
///
/// This needs to be implemented by users of the library to define what
/// distribution to sample from. The energy is the negative unnormalized log
/// density of the target; it must be deterministic in its inputs and always
/// succeed. When `grad` is provided, the gradient of the energy with respect
/// to `position` must be written into it.
pub trait Model {
    /// The dimensionality of the position vector.
    fn dim(&self) -> usize;

    /// The dimensionality of the auxiliary state vector, zero if the model
    /// has no latent variables beyond position and momentum.
    fn aux_dim(&self) -> usize {
        0
    }

    /// Compute the potential energy at `position`, and the gradient if
    /// requested.
    fn energy(&mut self, position: &[f64], aux: &[f64], eval: Eval<'_>, grad: Option<&mut [f64]>)
        -> f64;

    /// Per-coordinate scale factors used to size proposal steps.
    ///
    /// Called once per contiguous run of step-using operations; the result is
    /// cached until an operation that changes the dynamics invalidates it.
    fn stepsizes(&mut self, position: &[f64], out: &mut [f64]) {
        let _ = position;
        out.fill(1.0);
    }

    /// Perform a model-specific update named by the application operation.
    ///
    /// Returns whether the name was recognized; an unrecognized name is a
    /// fatal configuration error surfaced by the sampler.
    fn app_update<R: rand::Rng + ?Sized>(
        &mut self,
        _rng: &mut R,
        _state: &mut DynamicState,
        _name: &str,
        _param: f64,
        _record: &mut IterRecord,
    ) -> bool {
        false
    }
}

#[cfg(test)]
pub(crate) mod test_models {
    use super::*;

    /// Independent gaussian coordinates with per-coordinate means, tempered
    /// by scaling the whole energy with the inverse temperature.
    pub(crate) struct GaussianModel {
        pub dim: usize,
        pub mu: f64,
    }

    impl Model for GaussianModel {
        fn dim(&self) -> usize {
            self.dim
        }

        fn energy(
            &mut self,
            position: &[f64],
            _aux: &[f64],
            eval: Eval<'_>,
            grad: Option<&mut [f64]>,
        ) -> f64 {
            let mut pot = 0f64;
            match grad {
                Some(grad) => {
                    for (&q, g) in position.iter().zip(grad.iter_mut()) {
                        let diff = q - self.mu;
                        pot += diff * diff / 2.;
                        *g = eval.inv_temp * diff;
                    }
                }
                None => {
                    for &q in position {
                        let diff = q - self.mu;
                        pot += diff * diff / 2.;
                    }
                }
            }
            eval.inv_temp * pot
        }
    }
}
