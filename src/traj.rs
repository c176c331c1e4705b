use itertools::izip;
use rand::seq::SliceRandom;

use crate::model::Model;
use crate::state::{DynamicState, IterRecord};

/// Upper bound on the number of energy approximation partitions.
pub(crate) const MAX_APPROX: u32 = 16;

/// Static description of how trajectories are simulated.
#[derive(Debug, Clone, Copy)]
pub struct TrajSpec {
    /// Number of coordinate partitions the energy function is split into for
    /// approximate evaluation. One means no splitting.
    pub n_approx: i32,
}

impl Default for TrajSpec {
    fn default() -> Self {
        TrajSpec { n_approx: 1 }
    }
}

/// Shuffle the traversal order over energy approximation partitions.
pub(crate) fn permute<R: rand::Rng + ?Sized>(rng: &mut R, it: &mut IterRecord) {
    it.approx_order.shuffle(rng);
}

/// Simulate `steps` leapfrog steps (backwards in time if negative) from the
/// current state, leaving position, momentum, gradient and potential energy
/// at the far end of the segment.
///
/// The kinetic energy cache is invalidated rather than recomputed, since the
/// callers that need it only need it at segment ends.
pub(crate) fn trajectory<M: Model>(
    model: &mut M,
    ds: &mut DynamicState,
    stepsize_factor: f64,
    steps: i64,
    approx: &[i32],
) {
    let dir = if steps < 0 { -1.0 } else { 1.0 };
    let n = steps.unsigned_abs();
    let sf = stepsize_factor * dir;

    if !ds.know_grad {
        ds.refresh_pot(model, approx, true);
    }

    for _ in 0..n {
        half_momentum_step(ds, sf);
        position_step(ds, sf);
        ds.refresh_pot(model, approx, true);
        half_momentum_step(ds, sf);
    }
    ds.know_kinetic = false;
}

fn half_momentum_step(ds: &mut DynamicState, sf: f64) {
    let grad = ds.grad.as_deref().expect("gradient not allocated");
    let p = ds.p.as_deref_mut().expect("momentum not allocated");
    for (v, &g, &ss) in izip!(p.iter_mut(), grad, &ds.stepsize) {
        *v -= 0.5 * sf * ss * g;
    }
}

pub(crate) fn position_step(ds: &mut DynamicState, sf: f64) {
    let p = ds.p.as_deref().expect("momentum not allocated");
    for (q, &v, &ss) in izip!(ds.q.iter_mut(), p, &ds.stepsize) {
        *q += sf * ss * v;
    }
    ds.know_pot = false;
    ds.know_grad = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_models::GaussianModel;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    fn prepared_state(q: &[f64], p: &[f64]) -> DynamicState {
        let mut ds = DynamicState::new(q.len());
        ds.q.copy_from_slice(q);
        ds.p = Some(p.to_vec());
        ds.grad = Some(vec![0.; q.len()]);
        ds
    }

    proptest! {
        #[test]
        fn trajectory_is_reversible(
            q0 in -2f64..2f64,
            q1 in -2f64..2f64,
            p0 in -1f64..1f64,
            p1 in -1f64..1f64,
            steps in 1i64..40,
        ) {
            let mut model = GaussianModel { dim: 2, mu: 0.0 };
            let mut ds = prepared_state(&[q0, q1], &[p0, p1]);
            trajectory(&mut model, &mut ds, 0.2, steps, &[1]);
            trajectory(&mut model, &mut ds, 0.2, -steps, &[1]);
            prop_assert!((ds.q[0] - q0).abs() < 1e-9);
            prop_assert!((ds.q[1] - q1).abs() < 1e-9);
            prop_assert!((ds.momentum()[0] - p0).abs() < 1e-9);
            prop_assert!((ds.momentum()[1] - p1).abs() < 1e-9);
        }
    }

    #[test]
    fn trajectory_nearly_conserves_energy() {
        let mut model = GaussianModel { dim: 1, mu: 0.0 };
        let mut ds = prepared_state(&[1.0], &[0.5]);
        ds.refresh_pot(&mut model, &[1], true);
        let h0 = ds.pot_energy + ds.kinetic();
        trajectory(&mut model, &mut ds, 0.05, 100, &[1]);
        let h1 = ds.pot_energy + ds.kinetic();
        assert!((h1 - h0).abs() < 1e-3, "energy drift {}", h1 - h0);
    }

    #[test]
    fn trajectory_leaves_caches_valid() {
        let mut model = GaussianModel { dim: 1, mu: 0.0 };
        let mut ds = prepared_state(&[0.7], &[0.1]);
        trajectory(&mut model, &mut ds, 0.1, 3, &[1]);
        assert!(ds.know_pot && ds.know_grad);
        assert!(!ds.know_kinetic);
        assert_abs_diff_eq!(ds.pot_energy, ds.q[0] * ds.q[0] / 2., epsilon = 1e-12);
    }
}
