use rand_distr::{Open01, StandardNormal};

use crate::model::{Eval, Model};
use crate::tempering::TempState;

/// The mutable position/momentum/energy record the update operations act on.
///
/// Owned by the caller and mutated in place by every [`crate::Sampler::iterate`]
/// call. The `know_*` flags guard the cached energies and gradient: a flag is
/// true only if the cached value reflects the current `q`/`p`.
pub struct DynamicState {
    /// Position coordinates.
    pub q: Vec<f64>,
    /// Momentum, allocated on first use if some configured operation needs it.
    pub p: Option<Vec<f64>>,
    /// Gradient of the potential energy, allocated on first use.
    pub grad: Option<Vec<f64>>,
    /// Per-coordinate proposal scales, fetched from the model's stepsize
    /// provider and cached by the sampler.
    pub stepsize: Vec<f64>,
    /// Auxiliary state for models with latent variables beyond `q`/`p`;
    /// opaque to the engine.
    pub aux: Vec<f64>,
    /// Cached potential energy, valid when `know_pot` is set.
    pub pot_energy: f64,
    /// Cached kinetic energy, valid when `know_kinetic` is set.
    pub kinetic_energy: f64,
    pub know_pot: bool,
    pub know_kinetic: bool,
    pub know_grad: bool,
    /// Active tempering ladder position, present only while tempering.
    pub temp_state: Option<TempState>,
    pub(crate) slevel: SliceLevel,
}

impl DynamicState {
    pub fn new(dim: usize) -> Self {
        Self::with_aux(dim, 0)
    }

    pub fn with_aux(dim: usize, aux_dim: usize) -> Self {
        DynamicState {
            q: vec![0.; dim],
            p: None,
            grad: None,
            stepsize: vec![1.; dim],
            aux: vec![0.; aux_dim],
            pot_energy: 0.,
            kinetic_energy: 0.,
            know_pot: false,
            know_kinetic: false,
            know_grad: false,
            temp_state: None,
            slevel: SliceLevel::default(),
        }
    }

    pub fn dim(&self) -> usize {
        self.q.len()
    }

    /// Inverse temperature of the active tempering rung, 1.0 outside
    /// tempering operations.
    pub fn inv_temp(&self) -> f64 {
        self.temp_state.as_ref().map_or(1.0, |t| t.inv_temp)
    }

    /// Kinetic energy as a pure function of the current momentum.
    pub(crate) fn kinetic(&self) -> f64 {
        let p = self.p.as_deref().expect("momentum not allocated");
        crate::math::sum_squares(p) / 2.
    }

    pub(crate) fn refresh_kinetic(&mut self) {
        if !self.know_kinetic {
            self.kinetic_energy = self.kinetic();
            self.know_kinetic = true;
        }
    }

    /// Recompute the potential energy (and optionally the gradient) at the
    /// current position, updating the caches and their validity flags.
    pub(crate) fn refresh_pot<M: Model>(&mut self, model: &mut M, approx: &[i32], with_grad: bool) {
        let inv_temp = self.temp_state.as_ref().map_or(1.0, |t| t.inv_temp);
        let eval = Eval {
            inv_temp,
            approx_order: approx,
        };
        let grad = if with_grad {
            Some(
                self.grad
                    .as_deref_mut()
                    .expect("gradient buffer not allocated"),
            )
        } else {
            None
        };
        self.pot_energy = model.energy(&self.q, &self.aux, eval, grad);
        self.know_pot = true;
        if with_grad {
            self.know_grad = true;
        }
    }

    pub(crate) fn momentum(&self) -> &[f64] {
        self.p.as_deref().expect("momentum not allocated")
    }

    pub(crate) fn momentum_mut(&mut self) -> &mut [f64] {
        self.p.as_deref_mut().expect("momentum not allocated")
    }

    pub(crate) fn gradient(&self) -> &[f64] {
        self.grad.as_deref().expect("gradient not allocated")
    }

    /// Fix the slice level used by the hybrid acceptance tests to a constant
    /// in (0, 1) instead of drawing it fresh on every use. The level is
    /// rescaled by the acceptance ratio on every accepted transition, which
    /// makes the accept decisions a deterministic function of the chain.
    pub fn fix_slice_level(&mut self, value: f64) {
        self.slevel = SliceLevel {
            value,
            random: false,
        };
    }
}

/// Replace the momentum with a draw from its equilibrium distribution at the
/// given temperature, mixing in the old momentum when `decay` is nonzero.
pub(crate) fn heatbath<R: rand::Rng + ?Sized>(
    ds: &mut DynamicState,
    rng: &mut R,
    temperature: f64,
    decay: f64,
) {
    let sd = temperature.sqrt();
    let p = ds.p.as_deref_mut().expect("momentum not allocated");
    if decay == 0.0 {
        for v in p.iter_mut() {
            *v = sd * rng.sample::<f64, _>(StandardNormal);
        }
    } else {
        let mix = (1.0 - decay * decay).sqrt();
        for v in p.iter_mut() {
            *v = decay * *v + mix * sd * rng.sample::<f64, _>(StandardNormal);
        }
    }
    ds.know_kinetic = false;
}

/// Slice-level cell shared by the hybrid acceptance tests.
///
/// In the default mode a fresh open-uniform level is drawn on every use; the
/// cell still remembers the last draw so that an accepted transition can
/// rescale it by the acceptance ratio.
pub(crate) struct SliceLevel {
    pub(crate) value: f64,
    pub(crate) random: bool,
}

impl Default for SliceLevel {
    fn default() -> Self {
        SliceLevel {
            value: 0.5,
            random: true,
        }
    }
}

impl SliceLevel {
    pub(crate) fn draw<R: rand::Rng + ?Sized>(&mut self, rng: &mut R) -> f64 {
        if self.random {
            self.value = rng.sample(Open01);
        }
        self.value
    }

    /// Exponential slice increment derived from the level.
    pub(crate) fn exp_inc<R: rand::Rng + ?Sized>(&mut self, rng: &mut R) -> f64 {
        -self.draw(rng).ln()
    }

    /// Rescale after an accepted transition with acceptance ratio `a`.
    /// The accepting draw satisfied `value < a`, so the level stays in (0,1).
    pub(crate) fn rescale(&mut self, a: f64) {
        self.value /= a;
    }
}

/// Per-iteration inputs, counters and diagnostics.
///
/// `temperature` and `decay` are set by the caller before each call;
/// `proposals`, `rejects` and the slice diagnostics accumulate across calls;
/// the remaining fields describe the last proposal.
#[derive(Debug, Clone)]
pub struct IterRecord {
    /// Sampling temperature, usually 1.0.
    pub temperature: f64,
    /// Heatbath decay override; negative means use each operation's own decay.
    pub decay: f64,
    /// Stepsize factor in effect for the current operation.
    pub stepsize_factor: f64,
    pub proposals: u64,
    pub rejects: u64,
    /// Signed run length: a positive streak of accepts or the negated length
    /// of the streak that just ended in a reject.
    pub consecutive_accepts: i64,
    /// Energy change of the last proposal.
    pub delta: f64,
    /// How far the last proposal moved, in trajectory steps (zero if the
    /// update was rejected or not trajectory-based).
    pub move_point: i64,
    /// Window offset used by the last windowed hybrid update.
    pub window_offset: usize,
    /// Start offset of the last spiral update.
    pub spiral_offset: i64,
    /// Switch point of the last spiral update.
    pub spiral_switch: i64,
    pub slice_calls: u64,
    pub slice_evals: u64,
    /// Traversal order over energy approximation partitions, reset each
    /// iteration and shuffled by the permute operation.
    pub approx_order: Vec<i32>,
}

impl IterRecord {
    pub fn new() -> Self {
        IterRecord {
            temperature: 1.0,
            decay: -1.0,
            stepsize_factor: 1.0,
            proposals: 0,
            rejects: 0,
            consecutive_accepts: 0,
            delta: 0.,
            move_point: 0,
            window_offset: 0,
            spiral_offset: 0,
            spiral_switch: 0,
            slice_calls: 0,
            slice_evals: 0,
            approx_order: vec![1],
        }
    }
}

impl Default for IterRecord {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_models::GaussianModel;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn kinetic_energy_is_half_sum_of_squares() {
        let mut ds = DynamicState::new(2);
        ds.p = Some(vec![3., 4.]);
        assert_abs_diff_eq!(ds.kinetic(), 12.5);
    }

    #[test]
    fn refresh_pot_sets_caches() {
        let mut model = GaussianModel { dim: 3, mu: 0.5 };
        let mut ds = DynamicState::new(3);
        ds.grad = Some(vec![0.; 3]);
        ds.q.copy_from_slice(&[1.5, 0.5, -0.5]);
        ds.refresh_pot(&mut model, &[1], true);
        assert!(ds.know_pot && ds.know_grad);
        assert_abs_diff_eq!(ds.pot_energy, 1.0);
        assert_abs_diff_eq!(ds.gradient()[0], 1.0);
        assert_abs_diff_eq!(ds.gradient()[2], -1.0);
    }

    #[test]
    fn heatbath_with_full_decay_keeps_momentum() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut ds = DynamicState::new(2);
        ds.p = Some(vec![1., -2.]);
        heatbath(&mut ds, &mut rng, 1.0, 1.0);
        assert_eq!(ds.momentum(), &[1., -2.]);
        assert!(!ds.know_kinetic);
    }

    #[test]
    fn heatbath_momenta_have_unit_scale() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let mut ds = DynamicState::new(1000);
        ds.p = Some(vec![0.; 1000]);
        heatbath(&mut ds, &mut rng, 1.0, 0.0);
        let var = crate::math::sum_squares(ds.momentum()) / 1000.;
        assert!((var - 1.0).abs() < 0.15, "momentum variance {var}");
    }
}
