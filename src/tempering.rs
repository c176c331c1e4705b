use crate::model::{Eval, Model};
use crate::ops::ConfigError;
use crate::state::{DynamicState, IterRecord};

/// Recorded energy change when a rung move is blocked at a ladder end.
pub(crate) const BLOCKED_DELTA: f64 = 1e30;

/// One rung of a tempering ladder: an inverse temperature and the bias added
/// to the energy when occupying this rung, used to even out rung occupancy.
#[derive(Debug, Clone, Copy)]
pub struct TempRung {
    pub inv_temp: f64,
    pub bias: f64,
}

impl TempRung {
    pub fn new(inv_temp: f64) -> Self {
        TempRung { inv_temp, bias: 0. }
    }
}

/// A tempering ladder, supplied coldest rung first.
///
/// The first rung must have inverse temperature one and later rungs must
/// strictly decrease towards zero (exclusive). Internally rungs are kept
/// hottest first, so moving down the index moves towards hotter rungs.
#[derive(Debug)]
pub struct TempSchedule {
    rungs: Vec<TempRung>,
}

impl TempSchedule {
    pub fn new(mut rungs: Vec<TempRung>) -> Result<Self, ConfigError> {
        let ordered = rungs.first().is_some_and(|r| r.inv_temp == 1.0)
            && rungs
                .windows(2)
                .all(|w| w[1].inv_temp > 0.0 && w[1].inv_temp < w[0].inv_temp);
        if !ordered {
            return Err(ConfigError::UnorderedSchedule);
        }
        rungs.reverse();
        Ok(TempSchedule { rungs })
    }

    pub fn len(&self) -> usize {
        self.rungs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rungs.is_empty()
    }

    /// Index of the rung with inverse temperature one.
    pub(crate) fn coldest(&self) -> usize {
        self.rungs.len() - 1
    }

    pub(crate) fn rung(&self, index: usize) -> TempRung {
        self.rungs[index]
    }
}

/// Position on the tempering ladder while a tempering operation is active.
#[derive(Debug, Clone, Copy)]
pub struct TempState {
    pub index: usize,
    pub inv_temp: f64,
    /// Direction of the next proposed rung move: -1 towards hotter rungs,
    /// +1 towards the cold end.
    pub dir: i32,
}

/// Ensure a tempering state exists, starting at the coldest rung and headed
/// towards hotter ones.
pub(crate) fn temp_present(ds: &mut DynamicState, sched: &TempSchedule) {
    if ds.temp_state.is_none() {
        ds.temp_state = Some(TempState {
            index: sched.coldest(),
            inv_temp: 1.0,
            dir: -1,
        });
    }
}

fn step_index(index: usize, dir: i32) -> usize {
    (index as i64 + dir as i64) as usize
}

/// Energy change of moving one rung in direction `dir` at the current
/// position, including the rung biases. Leaves the state untouched.
pub(crate) fn energy_diff<M: Model>(
    model: &mut M,
    ds: &mut DynamicState,
    sched: &TempSchedule,
    dir: i32,
    approx: &[i32],
) -> f64 {
    if !ds.know_pot {
        ds.refresh_pot(model, approx, false);
    }
    let here = ds.temp_state.as_ref().expect("tempering state missing");
    let from = sched.rung(here.index);
    let to = sched.rung(step_index(here.index, dir));
    let eval = Eval {
        inv_temp: to.inv_temp,
        approx_order: approx,
    };
    let pot_there = model.energy(&ds.q, &ds.aux, eval, None);
    (pot_there + to.bias) - (ds.pot_energy + from.bias)
}

/// Metropolis update of the ladder position, leaving `q` fixed.
///
/// A move off either end of the ladder is counted as a proposal and rejected
/// with a huge recorded energy change. On acceptance the travel direction is
/// reversed, so repeated updates random-walk along the ladder.
pub(crate) fn simulated_tempering<M: Model, R: rand::Rng + ?Sized>(
    model: &mut M,
    ds: &mut DynamicState,
    rng: &mut R,
    sched: &TempSchedule,
    it: &mut IterRecord,
    approx: &[i32],
) {
    temp_present(ds, sched);

    if !ds.know_pot {
        ds.refresh_pot(model, approx, false);
    }
    let old_energy = ds.pot_energy;
    let ts = *ds.temp_state.as_ref().expect("tempering state missing");
    let olde = old_energy + sched.rung(ts.index).bias;

    if (ts.index == 0 && ts.dir == -1) || (ts.inv_temp == 1.0 && ts.dir == 1) {
        it.proposals += 1;
        it.delta = BLOCKED_DELTA;
        it.move_point = 0;
        it.rejects += 1;
        return;
    }

    let new_index = step_index(ts.index, ts.dir);
    {
        let ts = ds.temp_state.as_mut().expect("tempering state missing");
        ts.index = new_index;
        ts.inv_temp = sched.rung(new_index).inv_temp;
    }
    ds.refresh_pot(model, approx, false);
    let newe = ds.pot_energy + sched.rung(new_index).bias;

    it.proposals += 1;
    it.delta = newe - olde;

    if it.delta <= 0. || rng.random::<f64>() < (-it.delta / it.temperature).exp() {
        it.move_point = 1;
        let ts = ds.temp_state.as_mut().expect("tempering state missing");
        ts.dir = -ts.dir;
        ds.know_grad = false;
    } else {
        it.move_point = 0;
        it.rejects += 1;
        ds.pot_energy = old_energy;
        let ts = ds.temp_state.as_mut().expect("tempering state missing");
        ts.index = step_index(ts.index, -ts.dir);
        ts.inv_temp = sched.rung(ts.index).inv_temp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_models::GaussianModel;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn ladder(inv_temps: &[f64]) -> TempSchedule {
        TempSchedule::new(inv_temps.iter().map(|&b| TempRung::new(b)).collect()).unwrap()
    }

    #[test]
    fn schedule_must_start_cold_and_decrease() {
        assert!(matches!(
            TempSchedule::new(vec![]).unwrap_err(),
            ConfigError::UnorderedSchedule
        ));
        assert!(matches!(
            TempSchedule::new(vec![TempRung::new(0.5)]).unwrap_err(),
            ConfigError::UnorderedSchedule
        ));
        assert!(matches!(
            TempSchedule::new(vec![TempRung::new(1.0), TempRung::new(1.0)]).unwrap_err(),
            ConfigError::UnorderedSchedule
        ));
        let sched = ladder(&[1.0, 0.5, 0.25]);
        assert_eq!(sched.len(), 3);
        assert_abs_diff_eq!(sched.rung(0).inv_temp, 0.25);
        assert_abs_diff_eq!(sched.rung(sched.coldest()).inv_temp, 1.0);
    }

    #[test]
    fn temp_present_starts_cold_headed_down() {
        let sched = ladder(&[1.0, 0.5]);
        let mut ds = DynamicState::new(1);
        temp_present(&mut ds, &sched);
        let ts = ds.temp_state.unwrap();
        assert_eq!(ts.index, sched.coldest());
        assert_abs_diff_eq!(ts.inv_temp, 1.0);
        assert_eq!(ts.dir, -1);
    }

    #[test]
    fn blocked_move_off_hot_end_is_rejected() {
        let sched = ladder(&[1.0, 0.5]);
        let mut model = GaussianModel { dim: 1, mu: 0.0 };
        let mut ds = DynamicState::new(1);
        ds.temp_state = Some(TempState {
            index: 0,
            inv_temp: 0.5,
            dir: -1,
        });
        let mut it = IterRecord::new();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        simulated_tempering(&mut model, &mut ds, &mut rng, &sched, &mut it, &[1]);
        assert_eq!((it.proposals, it.rejects), (1, 1));
        assert_eq!(it.delta, BLOCKED_DELTA);
        assert_eq!(ds.temp_state.unwrap().index, 0);
    }

    #[test]
    fn downhill_move_is_accepted_and_reverses_direction() {
        // Moving towards a hotter rung lowers the tempered gaussian energy,
        // so the proposal is always accepted.
        let sched = ladder(&[1.0, 0.5]);
        let mut model = GaussianModel { dim: 1, mu: 0.0 };
        let mut ds = DynamicState::new(1);
        ds.q[0] = 2.0;
        let mut it = IterRecord::new();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        simulated_tempering(&mut model, &mut ds, &mut rng, &sched, &mut it, &[1]);
        let ts = ds.temp_state.unwrap();
        assert_eq!(ts.index, 0);
        assert_abs_diff_eq!(ts.inv_temp, 0.5);
        assert_eq!(ts.dir, 1);
        assert_eq!(it.move_point, 1);
        assert!(it.delta < 0.);
        assert_abs_diff_eq!(ds.pot_energy, 0.5 * 2.0 * 2.0 / 2.0);
    }

    #[test]
    fn rejected_move_restores_rung_and_energy() {
        // From the hot rung headed up, the colder rung raises the energy by
        // more than enough that a rejection occurs for some seed.
        let sched = ladder(&[1.0, 0.1]);
        let mut model = GaussianModel { dim: 1, mu: 0.0 };
        let mut ds = DynamicState::new(1);
        ds.q[0] = 6.0;
        ds.temp_state = Some(TempState {
            index: 0,
            inv_temp: 0.1,
            dir: 1,
        });
        let mut it = IterRecord::new();
        let mut rejected = false;
        for seed in 0..20 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            ds.know_pot = false;
            simulated_tempering(&mut model, &mut ds, &mut rng, &sched, &mut it, &[1]);
            let ts = ds.temp_state.unwrap();
            if it.move_point == 0 {
                rejected = true;
                assert_eq!(ts.index, 0);
                assert_abs_diff_eq!(ts.inv_temp, 0.1);
                assert_abs_diff_eq!(ds.pot_energy, 0.1 * 6.0 * 6.0 / 2.0);
                break;
            }
            // Accepted: walk back for another try.
            ds.temp_state = Some(TempState {
                index: 0,
                inv_temp: 0.1,
                dir: 1,
            });
        }
        assert!(rejected, "no rejection in 20 seeds");
    }
}
