use std::rc::Rc;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Gamma, Open01, StandardNormal};

use crate::hybrid;
use crate::model::Model;
use crate::ops::{ConfigError, Needs, Op, OpPlan, StepsizeSpec};
use crate::slice;
use crate::state::{self, DynamicState, IterRecord};
use crate::tempering::{self, TempSchedule};
use crate::traj::{self, TrajSpec, MAX_APPROX};

/// Saved-state buffers shared by the update operations, allocated once at
/// setup according to what the operation list can touch.
pub(crate) struct Scratch {
    pub q_save: Vec<f64>,
    pub p_save: Vec<f64>,
    pub q_acc: Vec<f64>,
    pub p_acc: Vec<f64>,
    pub q_rej: Vec<f64>,
    pub p_rej: Vec<f64>,
    pub q_savet: Vec<f64>,
    pub p_savet: Vec<f64>,
    pub aux_savet: Vec<f64>,
    pub ensemble: Vec<EnsembleSlot>,
}

pub(crate) struct EnsembleSlot {
    pub q: Vec<f64>,
    pub p: Vec<f64>,
    pub aux: Vec<f64>,
}

impl Scratch {
    pub(crate) fn sized(dim: usize, aux_dim: usize, needs: &Needs) -> Self {
        let buf = |wanted: bool| if wanted { vec![0.; dim] } else { vec![] };
        Scratch {
            q_save: buf(needs.save),
            p_save: buf(needs.save),
            q_acc: buf(needs.accept_reject),
            p_acc: buf(needs.accept_reject),
            q_rej: buf(needs.accept_reject),
            p_rej: buf(needs.accept_reject),
            q_savet: buf(needs.save_tempered),
            p_savet: buf(needs.save_tempered),
            aux_savet: if needs.save_tempered {
                vec![0.; aux_dim]
            } else {
                vec![]
            },
            ensemble: (0..needs.ensemble)
                .map(|_| EnsembleSlot {
                    q: vec![0.; dim],
                    p: vec![0.; dim],
                    aux: vec![0.; aux_dim],
                })
                .collect(),
        }
    }
}

type Monitor = Box<dyn FnMut(usize, &DynamicState, &IterRecord)>;

/// Executes a validated operation list against a model, once per iteration.
///
/// Owns the model and the random number generator; the chain state and the
/// iteration record stay with the caller so that chains can be checkpointed
/// or branched.
pub struct Sampler<M: Model, R: rand::Rng> {
    model: M,
    plan: Rc<OpPlan>,
    traj: TrajSpec,
    sched: Option<Rc<TempSchedule>>,
    rng: R,
    scratch: Scratch,
    /// Whether the cached per-coordinate stepsizes are current.
    have_ss: bool,
    print_index: usize,
    monitor: Option<Monitor>,
}

impl<M: Model> Sampler<M, ChaCha8Rng> {
    pub fn seeded(model: M, ops: Vec<Op>, seed: u64) -> Result<Self, ConfigError> {
        Self::new(model, ops, ChaCha8Rng::seed_from_u64(seed))
    }
}

impl<M: Model, R: rand::Rng> Sampler<M, R> {
    pub fn new(model: M, ops: Vec<Op>, rng: R) -> Result<Self, ConfigError> {
        Self::build(model, ops, None, rng)
    }

    pub fn with_schedule(
        model: M,
        ops: Vec<Op>,
        sched: TempSchedule,
        rng: R,
    ) -> Result<Self, ConfigError> {
        Self::build(model, ops, Some(sched), rng)
    }

    fn build(
        model: M,
        ops: Vec<Op>,
        sched: Option<TempSchedule>,
        rng: R,
    ) -> Result<Self, ConfigError> {
        let plan = OpPlan::new(ops, sched.is_some())?;
        let scratch = Scratch::sized(model.dim(), model.aux_dim(), &plan.needs);
        Ok(Sampler {
            model,
            plan: Rc::new(plan),
            traj: TrajSpec::default(),
            sched: sched.map(Rc::new),
            rng,
            scratch,
            have_ss: false,
            print_index: 0,
            monitor: None,
        })
    }

    pub fn with_traj(mut self, traj: TrajSpec) -> Self {
        self.traj = traj;
        self
    }

    pub fn set_monitor(&mut self, monitor: impl FnMut(usize, &DynamicState, &IterRecord) + 'static) {
        self.monitor = Some(Box::new(monitor));
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    /// A fresh all-zero state sized for the model.
    pub fn init_state(&self) -> DynamicState {
        DynamicState::with_aux(self.model.dim(), self.model.aux_dim())
    }

    /// Run the whole operation list once, mutating the state in place.
    pub fn iterate(&mut self, ds: &mut DynamicState, it: &mut IterRecord) -> Result<(), ConfigError> {
        if self.plan.needs.momentum && ds.p.is_none() {
            ds.p = Some(vec![0.; ds.dim()]);
            state::heatbath(ds, &mut self.rng, it.temperature, 0.);
        }
        if self.plan.needs.gradient && ds.grad.is_none() {
            ds.grad = Some(vec![0.; ds.dim()]);
            ds.know_grad = false;
        }

        it.stepsize_factor = 1.0;
        it.move_point = 0;
        it.delta = 0.;
        let na = self.traj.n_approx.unsigned_abs().max(1).min(MAX_APPROX);
        it.approx_order.clear();
        it.approx_order.extend(1..=na as i32);

        self.have_ss = false;
        self.print_index = 0;

        let plan = Rc::clone(&self.plan);
        self.exec_group(ds, it, &plan.ops, false)
    }

    fn exec_group(
        &mut self,
        ds: &mut DynamicState,
        it: &mut IterRecord,
        ops: &[Op],
        reverse: bool,
    ) -> Result<(), ConfigError> {
        if reverse {
            for op in ops.iter().rev() {
                self.exec_op(ds, it, op, reverse)?;
            }
        } else {
            for op in ops {
                self.exec_op(ds, it, op, reverse)?;
            }
        }
        Ok(())
    }

    /// Draw the per-operation stepsize factor and fetch the base stepsizes if
    /// they are not current.
    fn prepare_stepsizes(&mut self, ds: &mut DynamicState, it: &mut IterRecord, spec: &StepsizeSpec) {
        let mut factor = spec.adjust.abs();
        if spec.alpha > 0. {
            let gamma = Gamma::new(spec.alpha / 2., 1.0).expect("shape is positive");
            factor /= (self.rng.sample(gamma) / (spec.alpha / 2.)).sqrt();
        } else if spec.alpha < 0. {
            let u: f64 = self.rng.sample(Open01);
            factor *= 10f64.powf(-spec.alpha * (u - 0.5));
        }
        it.stepsize_factor = factor;

        if !self.have_ss {
            if spec.adjust > 0. {
                self.model.stepsizes(&ds.q, &mut ds.stepsize);
            } else {
                ds.stepsize.fill(1.0);
            }
            self.have_ss = true;
        }
    }

    fn exec_op(
        &mut self,
        ds: &mut DynamicState,
        it: &mut IterRecord,
        op: &Op,
        reverse: bool,
    ) -> Result<(), ConfigError> {
        if let Some(spec) = op.stepsize_spec() {
            self.prepare_stepsizes(ds, it, spec);
        }

        match op {
            Op::Heatbath { decay } => {
                let decay = if it.decay >= 0. { it.decay } else { *decay };
                state::heatbath(ds, &mut self.rng, it.temperature, decay);
            }
            Op::Negate => {
                crate::math::negate(ds.momentum_mut());
            }
            Op::Metropolis { .. } => {
                self.metropolis(ds, it);
            }
            Op::Dynamic { steps, .. } => {
                let approx = it.approx_order.clone();
                traj::trajectory(&mut self.model, ds, it.stepsize_factor, *steps as i64, &approx);
            }
            Op::PermutedDynamic { steps, .. } => {
                traj::permute(&mut self.rng, it);
                let approx = it.approx_order.clone();
                traj::trajectory(&mut self.model, ds, it.stepsize_factor, *steps as i64, &approx);
            }
            Op::Hybrid {
                steps,
                window,
                jump,
                ..
            } => {
                hybrid::hybrid(
                    &mut self.model,
                    ds,
                    &mut self.rng,
                    it,
                    *steps,
                    *window,
                    *jump,
                    None,
                    &mut self.scratch,
                );
            }
            Op::TemperedHybrid {
                steps,
                window,
                jump,
                temper_factor,
                ..
            } => {
                hybrid::hybrid(
                    &mut self.model,
                    ds,
                    &mut self.rng,
                    it,
                    *steps,
                    *window,
                    *jump,
                    Some(*temper_factor),
                    &mut self.scratch,
                );
            }
            Op::ThresholdHybrid {
                steps,
                in_steps,
                jump,
                ..
            } => {
                hybrid::hybrid2(
                    &mut self.model,
                    ds,
                    &mut self.rng,
                    it,
                    *steps,
                    *in_steps,
                    *jump,
                    &mut self.scratch,
                );
            }
            Op::Spiral {
                steps,
                temper_factor,
                double,
                ..
            } => {
                hybrid::spiral(
                    &mut self.model,
                    ds,
                    &mut self.rng,
                    it,
                    *steps,
                    *temper_factor,
                    *double,
                    &mut self.scratch,
                );
            }
            Op::Slice {
                range, max_steps, ..
            } => {
                slice::slice_one(&mut self.model, ds, &mut self.rng, it, *range, *max_steps);
            }
            Op::SliceOver {
                refinements,
                refresh_prob,
                range,
                max_steps,
                ..
            } => {
                slice::slice_over(
                    &mut self.model,
                    ds,
                    &mut self.rng,
                    it,
                    *refinements,
                    *refresh_prob,
                    *range,
                    *max_steps,
                );
            }
            Op::SliceInside { steps, .. } => {
                slice::slice_inside(
                    &mut self.model,
                    ds,
                    &mut self.rng,
                    it,
                    *steps,
                    &mut self.scratch.q_save,
                    &mut self.scratch.p_save,
                );
            }
            Op::SliceOutside {
                steps, in_steps, ..
            } => {
                slice::slice_outside(
                    &mut self.model,
                    ds,
                    &mut self.rng,
                    it,
                    *steps,
                    *in_steps,
                    &mut self.scratch.q_save,
                    &mut self.scratch.p_save,
                );
            }
            Op::SimulatedTempering => {
                let sched = Rc::clone(self.sched.as_ref().expect("schedule checked at setup"));
                let approx = it.approx_order.clone();
                tempering::simulated_tempering(
                    &mut self.model,
                    ds,
                    &mut self.rng,
                    &sched,
                    it,
                    &approx,
                );
                self.have_ss = false;
            }
            Op::TemperedTransition {
                repeat,
                high_count,
                group,
            } => {
                self.tempered_transition(ds, it, *repeat, *high_count, group, reverse)?;
            }
            Op::NegateTempDir => {
                let sched = self.sched.as_ref().expect("schedule checked at setup");
                tempering::temp_present(ds, sched);
                let ts = ds.temp_state.as_mut().expect("tempering state present");
                ts.dir = -ts.dir;
            }
            Op::RandomizeTempDir => {
                let sched = self.sched.as_ref().expect("schedule checked at setup");
                tempering::temp_present(ds, sched);
                let dir = if self.rng.random::<bool>() { -1 } else { 1 };
                ds.temp_state.as_mut().expect("tempering state present").dir = dir;
            }
            Op::Repeat { count, group } => {
                for _ in 0..*count {
                    self.exec_group(ds, it, group, reverse)?;
                }
            }
            Op::Group(group) => {
                self.exec_group(ds, it, group, reverse)?;
            }
            Op::Plot => {
                let index = self.print_index;
                self.print_index += 1;
                if let Some(monitor) = &mut self.monitor {
                    monitor(index, ds, it);
                }
            }
            Op::Application { name, param } => {
                if !self.model.app_update(&mut self.rng, ds, name, *param, it) {
                    return Err(ConfigError::UnknownAppOp(name.clone()));
                }
                self.have_ss = false;
            }
        }
        Ok(())
    }

    /// Gaussian random-walk Metropolis update of the whole position.
    fn metropolis(&mut self, ds: &mut DynamicState, it: &mut IterRecord) {
        let approx = it.approx_order.clone();
        if !ds.know_pot {
            ds.refresh_pot(&mut self.model, &approx, false);
        }
        let old_pot = ds.pot_energy;
        self.scratch.q_save.copy_from_slice(&ds.q);

        let sf = it.stepsize_factor;
        {
            let DynamicState { q, stepsize, .. } = ds;
            for (qk, &ss) in q.iter_mut().zip(stepsize.iter()) {
                *qk += sf * ss * self.rng.sample::<f64, _>(StandardNormal);
            }
        }
        ds.refresh_pot(&mut self.model, &approx, false);

        it.proposals += 1;
        it.delta = ds.pot_energy - old_pot;

        if it.delta <= 0. || self.rng.random::<f64>() < (-it.delta / it.temperature).exp() {
            it.move_point = 1;
            ds.know_grad = false;
        } else {
            it.rejects += 1;
            it.move_point = 0;
            ds.q.copy_from_slice(&self.scratch.q_save);
            ds.pot_energy = old_pot;
        }
    }

    /// Anneal to the hot end of the ladder and back, running the nested
    /// group at every rung (in reversed order on the way back), and accept
    /// or reject the whole excursion at once.
    fn tempered_transition(
        &mut self,
        ds: &mut DynamicState,
        it: &mut IterRecord,
        repeat: usize,
        high_count: usize,
        group: &[Op],
        reverse: bool,
    ) -> Result<(), ConfigError> {
        if ds.temp_state.is_some() {
            return Err(ConfigError::NestedTempering);
        }
        let sched = Rc::clone(self.sched.as_ref().expect("schedule checked at setup"));
        let approx = it.approx_order.clone();

        ds.temp_state = Some(tempering::TempState {
            index: sched.coldest(),
            inv_temp: 1.0,
            dir: -1,
        });

        self.scratch.q_savet.copy_from_slice(&ds.q);
        if let Some(p) = &ds.p {
            self.scratch.p_savet.copy_from_slice(p);
        }
        self.scratch.aux_savet.copy_from_slice(&ds.aux);

        let mut delta = 0.;

        loop {
            let (dir, index) = {
                let ts = ds.temp_state.as_ref().expect("tempering state present");
                (ts.dir, ts.index)
            };

            if dir == -1 && index == 0 {
                ds.temp_state.as_mut().expect("tempering state present").dir = 1;
            } else {
                delta += tempering::energy_diff(&mut self.model, ds, &sched, dir, &approx);
                let ts = ds.temp_state.as_mut().expect("tempering state present");
                ts.index = (ts.index as i64 + dir as i64) as usize;
                ds.know_pot = false;
                ds.know_grad = false;
                self.have_ss = false;
            }

            let (dir, index, inv_temp) = {
                let ts = ds.temp_state.as_mut().expect("tempering state present");
                ts.inv_temp = sched.rung(ts.index).inv_temp;
                (ts.dir, ts.index, ts.inv_temp)
            };

            if inv_temp == 1.0 {
                break;
            }

            let rev = if dir == -1 { reverse } else { !reverse };
            if index == 0 {
                for _ in 0..high_count {
                    self.exec_group(ds, it, group, rev)?;
                }
            } else if repeat == 1 {
                self.exec_group(ds, it, group, rev)?;
            } else {
                self.temp_over(ds, it, repeat, group)?;
            }
        }

        it.proposals += 1;
        it.delta = delta;

        if delta <= 0. || self.rng.random::<f64>() < (-delta / it.temperature).exp() {
            it.move_point = 1;
        } else {
            it.rejects += 1;
            it.move_point = 0;

            ds.q.copy_from_slice(&self.scratch.q_savet);
            if let Some(p) = ds.p.as_deref_mut() {
                p.copy_from_slice(&self.scratch.p_savet);
            }
            ds.aux.copy_from_slice(&self.scratch.aux_savet);
        }

        ds.temp_state = None;
        ds.know_pot = false;
        ds.know_grad = false;
        self.have_ss = false;

        Ok(())
    }

    /// Over-relaxed rung update inside a tempered transition: run the group
    /// from a random member of an ensemble of `repeat` states, then pick the
    /// member whose rank (by energy difference towards the cold end) mirrors
    /// the starting member's.
    fn temp_over(
        &mut self,
        ds: &mut DynamicState,
        it: &mut IterRecord,
        repeat: usize,
        group: &[Op],
    ) -> Result<(), ConfigError> {
        let sched = Rc::clone(self.sched.as_ref().expect("schedule checked at setup"));
        let approx = it.approx_order.clone();

        let st = self.rng.random_range(0..repeat);
        let mut ranks: Vec<(usize, f64)> = vec![(0, 0.); repeat];
        let mut above = 0usize;

        let mut i = st as i64;
        let mut d = 1i64;

        loop {
            {
                let slot = &mut self.scratch.ensemble[i as usize];
                slot.q.copy_from_slice(&ds.q);
                if let Some(p) = &ds.p {
                    slot.p.copy_from_slice(p);
                }
                slot.aux.copy_from_slice(&ds.aux);
            }

            let value = tempering::energy_diff(&mut self.model, ds, &sched, 1, &approx);
            ranks[i as usize] = (i as usize, value);
            if value > ranks[st].1 {
                above += 1;
            }

            i += d;
            if i == repeat as i64 {
                let slot = &self.scratch.ensemble[st];
                ds.q.copy_from_slice(&slot.q);
                if let Some(p) = ds.p.as_deref_mut() {
                    p.copy_from_slice(&slot.p);
                }
                ds.aux.copy_from_slice(&slot.aux);
                ds.know_pot = false;
                ds.know_grad = false;
                i = st as i64 - 1;
                d = -1;
            }
            if i < 0 {
                break;
            }

            self.exec_group(ds, it, group, d == -1)?;
        }

        ranks.sort_by(|a, b| a.1.total_cmp(&b.1));
        let chosen = ranks[above].0;

        let slot = &self.scratch.ensemble[chosen];
        ds.q.copy_from_slice(&slot.q);
        if let Some(p) = ds.p.as_deref_mut() {
            p.copy_from_slice(&slot.p);
        }
        ds.aux.copy_from_slice(&slot.aux);
        ds.know_pot = false;
        ds.know_grad = false;

        Ok(())
    }
}
