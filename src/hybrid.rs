//! Hybrid (Hamiltonian) Monte Carlo updates: the windowed form with optional
//! momentum tempering, the threshold-accepting form, and spiral dynamics.

use crate::math::{logaddexp, negate, scale};
use crate::model::Model;
use crate::sampler::Scratch;
use crate::state::{DynamicState, IterRecord};
use crate::traj;

fn note_accept(it: &mut IterRecord) {
    it.consecutive_accepts = if it.consecutive_accepts <= 0 {
        1
    } else {
        it.consecutive_accepts + 1
    };
}

fn note_reject(it: &mut IterRecord) {
    it.rejects += 1;
    it.consecutive_accepts = if it.consecutive_accepts <= 0 {
        0
    } else {
        -it.consecutive_accepts
    };
}

/// A window representative chosen by weighted reservoir sampling, with the
/// running free energy of its window.
#[derive(Clone, Copy)]
struct WinRep {
    free: f64,
    point: i64,
    pot: f64,
    kin: f64,
}

/// Windowed hybrid Monte Carlo, optionally with momentum tempering.
///
/// The start state is placed at a uniform offset within the accept/reject
/// windows, the trajectory is run backwards to cover the rest of the reject
/// window and then forwards to its far end, and a representative of each
/// window is kept with probability proportional to its Boltzmann weight. The
/// transition between representatives is accepted by the free energy
/// difference of the two windows.
#[allow(clippy::too_many_arguments)]
pub(crate) fn hybrid<M: Model, R: rand::Rng + ?Sized>(
    model: &mut M,
    ds: &mut DynamicState,
    rng: &mut R,
    it: &mut IterRecord,
    steps: usize,
    window: usize,
    jump: usize,
    temper_factor: Option<f64>,
    scr: &mut Scratch,
) {
    let jmps = (steps / jump) as i64;
    let window = window as i64;
    let jump = jump as i64;

    let offset = rng.random_range(0..window);
    it.window_offset = offset as usize;

    let mut old_pot = 0.;
    let mut old_kin = 0.;
    if offset > 0 {
        scr.q_save.copy_from_slice(&ds.q);
        scr.p_save.copy_from_slice(ds.momentum());

        let approx = it.approx_order.clone();
        if !ds.know_pot {
            ds.refresh_pot(model, &approx, false);
        }
        ds.refresh_kinetic();

        old_pot = ds.pot_energy;
        old_kin = ds.kinetic_energy;
    }

    traj::permute(rng, it);
    let approx = it.approx_order.clone();
    let sf = it.stepsize_factor;

    let mut rej: Option<WinRep> = None;
    let mut acc: Option<WinRep> = None;
    let mut n = offset;
    let mut dir = -1i64;
    let mut h = 0.;

    // One new state per pass, possibly landing in either window.
    while dir == -1 || n != jmps {
        if dir == -1 && n == 0 {
            // Next state is the original start state.
            if offset > 0 {
                ds.q.copy_from_slice(&scr.q_save);
                ds.momentum_mut().copy_from_slice(&scr.p_save);
                ds.pot_energy = old_pot;
                ds.kinetic_energy = old_kin;
                ds.know_pot = true;
                ds.know_kinetic = true;
                ds.know_grad = false;
            }
            n = offset;
            dir = 1;
        } else {
            if let Some(tf) = temper_factor {
                if n <= jmps - window && 2 * n > jmps {
                    scale(ds.momentum_mut(), 1. / tf);
                }
            }

            n += dir;
            traj::trajectory(model, ds, sf, dir * jump, &approx);

            if let Some(tf) = temper_factor {
                if n >= window && 2 * n < jmps {
                    scale(ds.momentum_mut(), tf);
                }
            }
        }

        if n < window || n > jmps - window {
            if !ds.know_pot {
                ds.refresh_pot(model, &approx, false);
            }
            ds.refresh_kinetic();
            h = ds.pot_energy + ds.kinetic_energy;
        }

        // The reject window is irrelevant when the windows cover the whole
        // trajectory, since the two representatives then come from the same
        // distribution.
        if window != jmps + 1 && n < window {
            let w = h / it.temperature;
            let (free, fresh) = match rej {
                None => (w, true),
                Some(r) => (-logaddexp(-r.free, -w), false),
            };
            if fresh || rng.random::<f64>() < (free - w).exp() {
                scr.q_rej.copy_from_slice(&ds.q);
                scr.p_rej.copy_from_slice(ds.momentum());
                rej = Some(WinRep {
                    free,
                    point: n,
                    pot: ds.pot_energy,
                    kin: ds.kinetic_energy,
                });
            } else if let Some(r) = &mut rej {
                r.free = free;
            }
        }

        if n > jmps - window {
            let w = h / it.temperature;
            let (free, fresh) = match acc {
                None => (w, true),
                Some(a) => (-logaddexp(-a.free, -w), false),
            };
            if fresh || rng.random::<f64>() < (free - w).exp() {
                if n != jmps {
                    scr.q_acc.copy_from_slice(&ds.q);
                    scr.p_acc.copy_from_slice(ds.momentum());
                }
                acc = Some(WinRep {
                    free,
                    point: n,
                    pot: ds.pot_energy,
                    kin: ds.kinetic_energy,
                });
            } else if let Some(a) = &mut acc {
                a.free = free;
            }
        }
    }

    let acc = acc.expect("accept window never empty");

    it.proposals += 1;
    it.delta = match rej {
        Some(r) => (acc.free - r.free) * it.temperature,
        None => 0.,
    };

    let u = ds.slevel.draw(rng);
    let a = (-it.delta / it.temperature).exp();

    if u < a {
        it.move_point = jump * (acc.point - offset);
        note_accept(it);

        if acc.point != jmps {
            ds.q.copy_from_slice(&scr.q_acc);
            ds.momentum_mut().copy_from_slice(&scr.p_acc);
            ds.pot_energy = acc.pot;
            ds.kinetic_energy = acc.kin;
            ds.know_pot = true;
            ds.know_kinetic = true;
            ds.know_grad = false;
        }

        negate(ds.momentum_mut());
        ds.slevel.rescale(a);
    } else {
        let rej = rej.expect("rejection requires a reject representative");
        note_reject(it);
        it.move_point = jump * (rej.point - offset);

        ds.q.copy_from_slice(&scr.q_rej);
        ds.momentum_mut().copy_from_slice(&scr.p_rej);
        ds.pot_energy = rej.pot;
        ds.kinetic_energy = rej.kin;
        ds.know_pot = true;
        ds.know_kinetic = true;
        ds.know_grad = false;
    }
}

/// Hybrid Monte Carlo accepting by an energy threshold.
///
/// The trajectory runs until the step budget is spent or enough jumps ended
/// below the threshold, and the end state is accepted iff its energy is below
/// the threshold. The threshold sits one exponential slice increment above
/// the starting energy.
pub(crate) fn hybrid2<M: Model, R: rand::Rng + ?Sized>(
    model: &mut M,
    ds: &mut DynamicState,
    rng: &mut R,
    it: &mut IterRecord,
    steps: usize,
    in_steps: usize,
    jump: usize,
    scr: &mut Scratch,
) {
    let approx = it.approx_order.clone();
    if !ds.know_pot || !ds.know_grad {
        ds.refresh_pot(model, &approx, true);
    }
    ds.refresh_kinetic();

    scr.q_save.copy_from_slice(&ds.q);
    scr.p_save.copy_from_slice(ds.momentum());

    let old_pot = ds.pot_energy;
    let old_kin = ds.kinetic_energy;

    let threshold = old_pot + old_kin + it.temperature * ds.slevel.exp_inc(rng);

    traj::permute(rng, it);
    let approx = it.approx_order.clone();
    let sf = it.stepsize_factor;

    let mut n = 0usize;
    let mut inside = 0usize;
    let mut h = old_pot + old_kin;

    while n < steps && inside < in_steps {
        traj::trajectory(model, ds, sf, jump as i64, &approx);
        ds.refresh_kinetic();
        h = ds.pot_energy + ds.kinetic_energy;

        n += jump;
        if h <= threshold {
            inside += 1;
        }
    }

    it.proposals += 1;
    it.delta = h - old_pot - old_kin;

    if h <= threshold {
        it.move_point = n as i64;
        note_accept(it);
        negate(ds.momentum_mut());
        ds.slevel.rescale((-it.delta / it.temperature).exp());
    } else {
        note_reject(it);
        it.move_point = 0;

        ds.q.copy_from_slice(&scr.q_save);
        ds.momentum_mut().copy_from_slice(&scr.p_save);
        ds.pot_energy = old_pot;
        ds.kinetic_energy = old_kin;
        ds.know_pot = true;
        ds.know_kinetic = true;
        ds.know_grad = false;
    }
}

/// Spiral dynamics: single leapfrog steps along an expanding then
/// contracting spiral in momentum space, ending at a state drawn from the
/// whole path by weighted reservoir sampling. There is no accept/reject
/// decision, so no proposal is counted.
pub(crate) fn spiral<M: Model, R: rand::Rng + ?Sized>(
    model: &mut M,
    ds: &mut DynamicState,
    rng: &mut R,
    it: &mut IterRecord,
    steps: usize,
    temper_factor: f64,
    double: bool,
    scr: &mut Scratch,
) {
    let sqtf = temper_factor.sqrt();
    let lgf = temper_factor.ln();
    let dim = ds.dim() as f64;
    let steps = steps as i64;

    let offset = rng.random_range(0..=steps);
    let switch_point = if double {
        rng.random_range(0..=steps)
    } else {
        steps
    };

    // The start state is also the initial accept state.
    scr.q_save.copy_from_slice(&ds.q);
    scr.q_acc.copy_from_slice(&ds.q);
    scr.p_save.copy_from_slice(ds.momentum());
    scr.p_acc.copy_from_slice(ds.momentum());

    let approx = it.approx_order.clone();
    if !ds.know_pot {
        ds.refresh_pot(model, &approx, false);
    }
    ds.refresh_kinetic();

    let old_pot = ds.pot_energy;
    let old_kin = ds.kinetic_energy;

    let mut acc_pot = ds.pot_energy;
    let mut acc_kin = ds.kinetic_energy;
    let mut acc_free =
        ds.pot_energy + ds.kinetic_energy + (offset - switch_point).abs() as f64 * lgf * dim;
    let mut acc_point = offset;

    traj::permute(rng, it);
    let approx = it.approx_order.clone();
    let sf = it.stepsize_factor;

    let mut n = offset;
    let mut dir = -1i64;

    loop {
        if dir == -1 && n == 0 {
            // Next state is a step from the original start state.
            ds.q.copy_from_slice(&scr.q_save);
            ds.momentum_mut().copy_from_slice(&scr.p_save);
            ds.pot_energy = old_pot;
            ds.kinetic_energy = old_kin;
            ds.know_pot = true;
            ds.know_kinetic = true;
            ds.know_grad = false;

            n = offset;
            dir = 1;
        }

        if dir == 1 && n == steps {
            break;
        }

        let contracting = if dir == 1 {
            n >= switch_point
        } else {
            n < switch_point
        };
        scale(ds.momentum_mut(), if contracting { 1. / sqtf } else { sqtf });

        traj::trajectory(model, ds, sf, dir, &approx);

        scale(ds.momentum_mut(), if contracting { 1. / sqtf } else { sqtf });

        if !ds.know_pot {
            ds.refresh_pot(model, &approx, false);
        }
        ds.kinetic_energy = ds.kinetic();
        ds.know_kinetic = true;

        n += dir;

        let a = ds.pot_energy + ds.kinetic_energy + (n - switch_point).abs() as f64 * lgf * dim;
        acc_free = -logaddexp(-acc_free, -a);

        if rng.random::<f64>() < (acc_free - a).exp() {
            scr.q_acc.copy_from_slice(&ds.q);
            scr.p_acc.copy_from_slice(ds.momentum());
            acc_pot = ds.pot_energy;
            acc_kin = ds.kinetic_energy;
            acc_point = n;
        }
    }

    it.move_point = acc_point - offset;
    it.spiral_offset = offset;
    it.spiral_switch = switch_point;

    ds.q.copy_from_slice(&scr.q_acc);
    ds.momentum_mut().copy_from_slice(&scr.p_acc);
    ds.pot_energy = acc_pot;
    ds.kinetic_energy = acc_kin;
    ds.know_pot = true;
    ds.know_kinetic = true;
    ds.know_grad = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_models::GaussianModel;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn prepared(q: &[f64], p: &[f64]) -> (GaussianModel, DynamicState, Scratch) {
        let model = GaussianModel {
            dim: q.len(),
            mu: 0.0,
        };
        let mut ds = DynamicState::new(q.len());
        ds.q.copy_from_slice(q);
        ds.p = Some(p.to_vec());
        ds.grad = Some(vec![0.; q.len()]);
        let needs = crate::ops::Needs {
            momentum: true,
            gradient: true,
            save: true,
            accept_reject: true,
            ..Default::default()
        };
        (model, ds, Scratch::sized(q.len(), 0, &needs))
    }

    #[test]
    fn unwindowed_delta_matches_energy_change() {
        // With a window of one the delta reduces to the plain end-to-end
        // energy change of the trajectory.
        let (mut model, mut ds, mut scr) = prepared(&[1.0], &[0.5]);
        let mut expect = DynamicState::new(1);
        expect.q[0] = 1.0;
        expect.p = Some(vec![0.5]);
        expect.grad = Some(vec![0.0]);

        let mut it = IterRecord::new();
        it.stepsize_factor = 0.25;
        let h0 = 1.0 * 1.0 / 2. + 0.5 * 0.5 / 2.;

        traj::trajectory(&mut model, &mut expect, 0.25, 20, &[1]);
        let h1 = expect.pot_energy + expect.kinetic();

        let mut rng = ChaCha8Rng::seed_from_u64(17);
        hybrid(&mut model, &mut ds, &mut rng, &mut it, 20, 1, 1, None, &mut scr);

        assert_eq!(it.window_offset, 0);
        assert_eq!(it.proposals, 1);
        assert_abs_diff_eq!(it.delta, h1 - h0, epsilon = 1e-10);
    }

    #[test]
    fn tiny_steps_are_always_accepted() {
        let (mut model, mut ds, mut scr) = prepared(&[1.0, -0.5], &[0.3, 0.8]);
        let mut it = IterRecord::new();
        it.stepsize_factor = 1e-4;
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        hybrid(&mut model, &mut ds, &mut rng, &mut it, 8, 3, 2, None, &mut scr);
        assert_eq!((it.proposals, it.rejects), (1, 0));
        assert_eq!(it.consecutive_accepts, 1);
        assert!(it.delta.abs() < 1e-4);
    }

    #[test]
    fn full_window_always_accepts() {
        // Windows spanning the whole trajectory leave no reject window, and
        // the transition is between identically distributed representatives.
        let (mut model, mut ds, mut scr) = prepared(&[0.4], &[0.1]);
        let mut it = IterRecord::new();
        it.stepsize_factor = 0.5;
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        hybrid(&mut model, &mut ds, &mut rng, &mut it, 4, 5, 1, None, &mut scr);
        assert_eq!(it.delta, 0.);
        assert_eq!((it.proposals, it.rejects), (1, 0));
    }

    #[test]
    fn threshold_form_accepts_tiny_steps_at_full_distance() {
        let (mut model, mut ds, mut scr) = prepared(&[0.7], &[0.2]);
        let mut it = IterRecord::new();
        it.stepsize_factor = 1e-4;
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        hybrid2(&mut model, &mut ds, &mut rng, &mut it, 12, 12, 2, &mut scr);
        assert_eq!((it.proposals, it.rejects), (1, 0));
        assert_eq!(it.move_point, 12);
        assert_abs_diff_eq!(ds.momentum()[0], -0.2, epsilon = 1e-3);
    }

    #[test]
    fn threshold_form_rejection_restores_start() {
        let (mut model, mut ds, mut scr) = prepared(&[3.0], &[2.0]);
        let mut it = IterRecord::new();
        // A wildly unstable stepsize blows the energy past any threshold.
        it.stepsize_factor = 5.0;
        let mut rejected = false;
        for seed in 0..20 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            ds.q[0] = 3.0;
            ds.p = Some(vec![2.0]);
            ds.know_pot = false;
            ds.know_grad = false;
            ds.know_kinetic = false;
            let before = it.rejects;
            hybrid2(&mut model, &mut ds, &mut rng, &mut it, 10, 10, 1, &mut scr);
            if it.rejects > before {
                rejected = true;
                assert_eq!(it.move_point, 0);
                assert_abs_diff_eq!(ds.q[0], 3.0);
                assert_abs_diff_eq!(ds.momentum()[0], 2.0);
                assert!(it.consecutive_accepts <= 0);
                break;
            }
        }
        assert!(rejected, "no rejection in 20 seeds");
    }

    #[test]
    fn untempered_spiral_moves_and_keeps_state_consistent() {
        let (mut model, mut ds, mut scr) = prepared(&[0.9, -0.2], &[0.4, 0.6]);
        let mut it = IterRecord::new();
        it.stepsize_factor = 0.3;
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        spiral(
            &mut model, &mut ds, &mut rng, &mut it, 15, 1.0, false, &mut scr,
        );
        assert_eq!(it.spiral_switch, 15);
        assert!((0..=15).contains(&it.spiral_offset));
        assert!(ds.know_pot && ds.know_kinetic && !ds.know_grad);
        let pot: f64 = ds.q.iter().map(|q| q * q / 2.).sum();
        assert_abs_diff_eq!(ds.pot_energy, pot, epsilon = 1e-10);
        assert_abs_diff_eq!(ds.kinetic_energy, ds.kinetic(), epsilon = 1e-12);
    }

    #[test]
    fn double_spiral_draws_its_switch_point() {
        let (mut model, mut ds, mut scr) = prepared(&[0.5], &[0.1]);
        let mut it = IterRecord::new();
        it.stepsize_factor = 0.2;
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        spiral(&mut model, &mut ds, &mut rng, &mut it, 10, 1.2, true, &mut scr);
        assert!((0..=10).contains(&it.spiral_switch));
        assert!((0..=10).contains(&it.spiral_offset));
        assert!(it.move_point.abs() <= 10);
    }
}
