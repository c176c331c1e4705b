use thiserror::Error;

/// Largest allowed repeat count inside a tempered transition. Bounds the
/// over-relaxation ensemble allocated at setup.
pub const MAX_TEMP_REPEAT: usize = 1000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("jump size must be at least 1")]
    ZeroJump,
    #[error("trajectory of {steps} steps does not divide into jumps of {jump}")]
    UnevenJump { steps: usize, jump: usize },
    #[error("window size must be at least 1")]
    ZeroWindow,
    #[error("window of {window} does not fit a trajectory of {jumps} jumps")]
    WindowTooWide { window: usize, jumps: usize },
    #[error("trajectory must have at least one step")]
    EmptyTrajectory,
    #[error("stepsize adjustment must be nonzero and finite, got {0}")]
    BadStepsizeAdjust(f64),
    #[error("stepsize alpha must be finite, got {0}")]
    BadStepsizeAlpha(f64),
    #[error("temper factor must be positive and finite, got {0}")]
    BadTemperFactor(f64),
    #[error("repeat count must be at least 1")]
    ZeroRepeat,
    #[error("repeat count {0} in a tempered transition exceeds the limit of {MAX_TEMP_REPEAT}")]
    RepeatTooBig(usize),
    #[error("tempering operations cannot be nested")]
    NestedTempering,
    #[error("no tempering schedule has been specified")]
    MissingSchedule,
    #[error("tempering schedule must start at inverse temperature 1 and decrease")]
    UnorderedSchedule,
    #[error("slice refresh probability must lie in [0, 1], got {0}")]
    BadRefreshProb(f64),
    #[error("unknown application-specific operation: {0}")]
    UnknownAppOp(String),
}

/// Per-operation stepsize adjustment.
///
/// The factor applied to the model's base stepsizes is `|adjust|`, optionally
/// multiplied by a heavy-tailed random draw controlled by `alpha`: for
/// `alpha > 0` the multiplier is `1/sqrt(Gamma(alpha/2)/(alpha/2))`, for
/// `alpha < 0` it is `10^(-alpha (U - 1/2))` with `U` open-uniform. A
/// negative `adjust` uses unit base scales instead of consulting the model's
/// stepsize provider.
#[derive(Debug, Clone, Copy)]
pub struct StepsizeSpec {
    pub adjust: f64,
    pub alpha: f64,
}

impl Default for StepsizeSpec {
    fn default() -> Self {
        StepsizeSpec {
            adjust: 1.0,
            alpha: 0.0,
        }
    }
}

impl StepsizeSpec {
    pub fn fixed(adjust: f64) -> Self {
        StepsizeSpec { adjust, alpha: 0.0 }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.adjust == 0.0 || !self.adjust.is_finite() {
            return Err(ConfigError::BadStepsizeAdjust(self.adjust));
        }
        if !self.alpha.is_finite() {
            return Err(ConfigError::BadStepsizeAlpha(self.alpha));
        }
        Ok(())
    }
}

/// One update operation. Group-carrying variants nest their members
/// directly, so operation lists are trees and unbalanced nesting is
/// unrepresentable.
#[derive(Debug, Clone)]
pub enum Op {
    /// Refresh momentum from its equilibrium distribution, with partial decay.
    Heatbath { decay: f64 },
    /// Negate the momentum.
    Negate,
    /// Gaussian random-walk Metropolis update of all coordinates.
    Metropolis { stepsize: StepsizeSpec },
    /// Deterministic leapfrog trajectory segment.
    Dynamic { steps: usize, stepsize: StepsizeSpec },
    /// Leapfrog trajectory preceded by a shuffle of the approximation order.
    PermutedDynamic { steps: usize, stepsize: StepsizeSpec },
    /// Windowed hybrid Monte Carlo.
    Hybrid {
        steps: usize,
        window: usize,
        jump: usize,
        stepsize: StepsizeSpec,
    },
    /// Windowed hybrid Monte Carlo with momentum tempering along the path.
    TemperedHybrid {
        steps: usize,
        window: usize,
        jump: usize,
        temper_factor: f64,
        stepsize: StepsizeSpec,
    },
    /// Hybrid Monte Carlo accepting by energy threshold, with early exit
    /// after `in_steps` jumps below the threshold.
    ThresholdHybrid {
        steps: usize,
        in_steps: usize,
        jump: usize,
        stepsize: StepsizeSpec,
    },
    /// Spiral dynamics; `double` draws an independent switch point.
    Spiral {
        steps: usize,
        temper_factor: f64,
        double: bool,
        stepsize: StepsizeSpec,
    },
    /// Single-coordinate slice sampling over a coordinate range
    /// (`None` = all), with a step-out budget (`0` = unlimited).
    Slice {
        range: Option<(usize, usize)>,
        max_steps: usize,
        stepsize: StepsizeSpec,
    },
    /// Over-relaxed single-coordinate slice sampling.
    SliceOver {
        refinements: usize,
        refresh_prob: f64,
        range: Option<(usize, usize)>,
        max_steps: usize,
        stepsize: StepsizeSpec,
    },
    /// Multivariate slice sampling with inside reflection.
    SliceInside { steps: usize, stepsize: StepsizeSpec },
    /// Multivariate slice sampling with outside reflection.
    SliceOutside {
        steps: usize,
        in_steps: usize,
        stepsize: StepsizeSpec,
    },
    /// Metropolis move of one rung along the tempering ladder.
    SimulatedTempering,
    /// Anneal down the ladder and back, running the nested group at each
    /// rung, accepted or rejected as a whole.
    TemperedTransition {
        repeat: usize,
        high_count: usize,
        group: Vec<Op>,
    },
    /// Negate the tempering direction.
    NegateTempDir,
    /// Randomize the tempering direction.
    RandomizeTempDir,
    /// Run the nested group a fixed number of times.
    Repeat { count: usize, group: Vec<Op> },
    /// Plain grouping bracket.
    Group(Vec<Op>),
    /// Invoke the caller-installed monitor with the current state.
    Plot,
    /// Dispatch to a model-specific update by name.
    Application { name: String, param: f64 },
}

impl Op {
    /// The stepsize adjustment of a step-using operation, if any. Presence
    /// of a spec is what triggers the per-operation stepsize factor draw and
    /// the cached base-stepsize fetch.
    pub(crate) fn stepsize_spec(&self) -> Option<&StepsizeSpec> {
        match self {
            Op::Metropolis { stepsize }
            | Op::Dynamic { stepsize, .. }
            | Op::PermutedDynamic { stepsize, .. }
            | Op::Hybrid { stepsize, .. }
            | Op::TemperedHybrid { stepsize, .. }
            | Op::ThresholdHybrid { stepsize, .. }
            | Op::Spiral { stepsize, .. }
            | Op::Slice { stepsize, .. }
            | Op::SliceOver { stepsize, .. }
            | Op::SliceInside { stepsize, .. }
            | Op::SliceOutside { stepsize, .. } => Some(stepsize),
            _ => None,
        }
    }
}

/// Which buffers and optional state vectors a configuration ever touches,
/// determined once at setup so that scratch space is allocated exactly once.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Needs {
    pub momentum: bool,
    pub gradient: bool,
    /// Metropolis-style save/restore of the start state.
    pub save: bool,
    /// Tempered-transition snapshot of the pre-excursion state.
    pub save_tempered: bool,
    /// Accept/reject window representatives.
    pub accept_reject: bool,
    /// Over-relaxation ensemble size (largest tempered repeat above one).
    pub ensemble: usize,
    pub schedule: bool,
}

/// A validated operation list.
#[derive(Debug)]
pub(crate) struct OpPlan {
    pub ops: Vec<Op>,
    pub needs: Needs,
}

impl OpPlan {
    pub fn new(ops: Vec<Op>, have_schedule: bool) -> Result<Self, ConfigError> {
        let mut needs = Needs::default();
        validate_group(&ops, false, &mut needs)?;
        if needs.schedule && !have_schedule {
            return Err(ConfigError::MissingSchedule);
        }
        Ok(OpPlan { ops, needs })
    }
}

fn validate_trajectory(steps: usize, jump: usize) -> Result<usize, ConfigError> {
    if jump == 0 {
        return Err(ConfigError::ZeroJump);
    }
    if steps == 0 {
        return Err(ConfigError::EmptyTrajectory);
    }
    if steps % jump != 0 {
        return Err(ConfigError::UnevenJump { steps, jump });
    }
    Ok(steps / jump)
}

fn validate_group(ops: &[Op], in_tempering: bool, needs: &mut Needs) -> Result<(), ConfigError> {
    for op in ops {
        if let Some(spec) = op.stepsize_spec() {
            spec.validate()?;
        }
        match op {
            Op::Heatbath { .. } | Op::Negate => {
                needs.momentum = true;
            }
            Op::Metropolis { .. } => {
                needs.save = true;
            }
            Op::Dynamic { steps, .. } | Op::PermutedDynamic { steps, .. } => {
                if *steps == 0 {
                    return Err(ConfigError::EmptyTrajectory);
                }
                needs.momentum = true;
                needs.gradient = true;
            }
            Op::Hybrid {
                steps,
                window,
                jump,
                ..
            }
            | Op::TemperedHybrid {
                steps,
                window,
                jump,
                ..
            } => {
                let jumps = validate_trajectory(*steps, *jump)?;
                if *window == 0 {
                    return Err(ConfigError::ZeroWindow);
                }
                if *window > jumps + 1 {
                    return Err(ConfigError::WindowTooWide {
                        window: *window,
                        jumps,
                    });
                }
                if let Op::TemperedHybrid { temper_factor, .. } = op {
                    if !(temper_factor.is_finite() && *temper_factor > 0.0) {
                        return Err(ConfigError::BadTemperFactor(*temper_factor));
                    }
                }
                needs.momentum = true;
                needs.gradient = true;
                needs.save = true;
                needs.accept_reject = true;
            }
            Op::ThresholdHybrid {
                steps,
                in_steps,
                jump,
                ..
            } => {
                validate_trajectory(*steps, *jump)?;
                if *in_steps % *jump != 0 {
                    return Err(ConfigError::UnevenJump {
                        steps: *in_steps,
                        jump: *jump,
                    });
                }
                needs.momentum = true;
                needs.gradient = true;
                needs.save = true;
            }
            Op::Spiral {
                steps,
                temper_factor,
                ..
            } => {
                if *steps == 0 {
                    return Err(ConfigError::EmptyTrajectory);
                }
                if !(temper_factor.is_finite() && *temper_factor > 0.0) {
                    return Err(ConfigError::BadTemperFactor(*temper_factor));
                }
                needs.momentum = true;
                needs.gradient = true;
                needs.save = true;
                needs.accept_reject = true;
            }
            Op::Slice { .. } => {}
            Op::SliceOver { refresh_prob, .. } => {
                if !(0.0..=1.0).contains(refresh_prob) {
                    return Err(ConfigError::BadRefreshProb(*refresh_prob));
                }
            }
            Op::SliceInside { .. } | Op::SliceOutside { .. } => {
                needs.momentum = true;
                needs.gradient = true;
                needs.save = true;
            }
            Op::SimulatedTempering => {
                if in_tempering {
                    return Err(ConfigError::NestedTempering);
                }
                needs.schedule = true;
            }
            Op::TemperedTransition {
                repeat,
                high_count,
                group,
            } => {
                if in_tempering {
                    return Err(ConfigError::NestedTempering);
                }
                if *repeat == 0 || *high_count == 0 {
                    return Err(ConfigError::ZeroRepeat);
                }
                if *repeat > MAX_TEMP_REPEAT {
                    return Err(ConfigError::RepeatTooBig(*repeat));
                }
                needs.schedule = true;
                needs.save_tempered = true;
                if *repeat > 1 {
                    needs.ensemble = needs.ensemble.max(*repeat);
                }
                validate_group(group, true, needs)?;
            }
            Op::NegateTempDir | Op::RandomizeTempDir => {
                needs.schedule = true;
            }
            Op::Repeat { count, group } => {
                if *count == 0 {
                    return Err(ConfigError::ZeroRepeat);
                }
                validate_group(group, in_tempering, needs)?;
            }
            Op::Group(group) => {
                validate_group(group, in_tempering, needs)?;
            }
            Op::Plot | Op::Application { .. } => {}
        }
    }
    Ok(())
}
