use crate::partition::{block, finetune, onchip, PartitionContext};
use crate::pattern::{dynamic_pattern, static_pattern};
use crate::plan::{TilingOutput, TilingPlan, MAX_KEYED_RANK, ZERO_DISPATCH_KEY};
use crate::problem::ReductionProblem;
use crate::profile::CompileProfile;
use crate::schedule::{self, SelectionContext};
use crate::source::{ShapeSource, SourceError};
use crate::utils::join_into_string;

use log::debug;

/// The stage of a tiling request that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Stage {
    Input,
    Normalize,
    Classify,
    Block,
    Onchip,
    Serialize,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StageFailure {
    #[error("Axis {axis} is out of range for rank {rank}")]
    AxisOutOfRange { axis: i64, rank: usize },
    #[error("Extent of axis {0} is not known")]
    UnknownExtent(usize),
    #[error("Input of shape {0} has more elements than can be addressed")]
    TooManyElements(String),
    #[error("No budgets were compiled for pattern {0}")]
    PatternNotCompiled(i32),
    #[error("No precomputed plan for static pattern {0}")]
    MissingPrecomputedPlan(i32),
    #[error("No axis can be split across lanes")]
    NoBlockAxis,
    #[error("On-chip footprint of {footprint} elements exceeds the budget of {budget}")]
    BudgetTooSmall { footprint: u64, budget: u64 },
    #[error("Canonical rank {0} is too large to encode in a dispatch key")]
    RankTooLarge(usize),
    #[error("Profile declares no parameters for dispatch key {0}")]
    UndeclaredDispatchKey(i32),
    #[error("Operator has no attribute {0:?}")]
    MissingAttribute(String),
    #[error("Profile declares no on-chip factor for zero-sized inputs")]
    ZeroBranchUndeclared,
    #[error("Value of {0} does not fit in a parameter")]
    ParamOverflow(String),
    #[error("Parameter dimension {index} is out of range for canonical rank {rank}")]
    DimOutOfRange { index: usize, rank: usize },
    #[error(transparent)]
    Source(#[from] SourceError),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Reduce tiling failed in {stage} stage: {reason}")]
pub struct TilingError {
    pub stage: Stage,
    #[source]
    pub reason: StageFailure,
}

/// Tiles reductions against one compile profile.
///
/// Holds no per-request state, so one value can serve any number of requests, including from
/// several threads at once.
#[derive(Debug, Clone, Copy)]
pub struct ReduceTiling<'p> {
    profile: &'p CompileProfile,
}

impl<'p> ReduceTiling<'p> {
    pub fn new(profile: &'p CompileProfile) -> Self {
        ReduceTiling { profile }
    }

    pub fn profile(&self) -> &'p CompileProfile {
        self.profile
    }

    /// Runs a full tiling request.
    ///
    /// Inputs with a zero-sized axis and profiles compiled for fully known shapes short-circuit
    /// before schedule selection.
    pub fn tile<S: ShapeSource>(&self, source: &S) -> Result<TilingOutput, TilingError> {
        let problem = self.problem(source)?;
        if problem.has_zero_extent() {
            debug!("Input has a zero-sized axis; emitting the empty plan");
            return self.zero_output(&problem).map_err(at(Stage::Serialize));
        }
        if self.profile.shape_known() {
            return self.precomputed_output(&problem).map_err(at(Stage::Classify));
        }
        let plan = self.plan(&problem)?;
        plan.serialize(self.profile, source)
            .map_err(at(Stage::Serialize))
    }

    /// Reads and canonicalizes a request.
    pub fn problem<S: ShapeSource>(&self, source: &S) -> Result<ReductionProblem, TilingError> {
        let shape = source.input_shape().map_err(|e| at(Stage::Input)(e.into()))?;
        let axes = source.reduce_axes().map_err(|e| at(Stage::Input)(e.into()))?;
        let pinned = source.disable_fuse_axes();
        let problem = ReductionProblem::new(&shape, &axes, &pinned, self.profile.keep_dims())
            .map_err(at(Stage::Normalize))?;
        debug!(
            "Canonicalized {} {} reducing {:?} to {} reducing {:?}",
            self.profile.dtype(),
            join_into_string(problem.raw_shape(), "x"),
            problem.raw_reduce_axes(),
            join_into_string(problem.shape(), "x"),
            problem.reduce_axes()
        );
        Ok(problem)
    }

    /// Selects a variant for a canonical problem and partitions it.
    pub fn plan(&self, problem: &ReductionProblem) -> Result<TilingPlan, TilingError> {
        let shape = problem.shape();
        let reduce_axes = problem.reduce_axes();
        if shape.len() > MAX_KEYED_RANK {
            return Err(at(Stage::Classify)(StageFailure::RankTooLarge(shape.len())));
        }
        let pattern = dynamic_pattern(shape.len(), reduce_axes);
        let budgets = self
            .profile
            .budgets(pattern)
            .ok_or(StageFailure::PatternNotCompiled(pattern))
            .map_err(at(Stage::Classify))?;

        let lane_count = u64::from(self.profile.lane_count());
        let dma_align = u64::from(self.profile.dma_align());
        let selection = schedule::select(&SelectionContext {
            shape,
            reduce_axes,
            budgets,
            capabilities: self.profile.capabilities(),
            lane_count,
            dma_align,
        });
        debug!(
            "Pattern {} selected {} variant with budget {}",
            pattern, selection.variant, selection.budget
        );

        let cx = PartitionContext {
            shape,
            reduce_axes,
            selection,
            lane_count,
            dma_align,
        };
        let block = block::partition(&cx).map_err(at(Stage::Block))?;
        let onchip = onchip::partition(&cx, &block).map_err(at(Stage::Onchip))?;
        let (block, onchip) = finetune::fine_tune(&cx, block, onchip);
        TilingPlan::new(&cx, pattern, block, onchip, self.profile.dtype())
            .map_err(at(Stage::Serialize))
    }

    fn zero_output(&self, problem: &ReductionProblem) -> Result<TilingOutput, StageFailure> {
        let factor = self
            .profile
            .zero_onchip_factor()
            .ok_or(StageFailure::ZeroBranchUndeclared)?;
        let retained = i32::try_from(problem.retained_count())
            .map_err(|_| StageFailure::ParamOverflow("retained count".to_string()))?;
        let factor = i32::try_from(factor)
            .map_err(|_| StageFailure::ParamOverflow("zero_onchip_factor".to_string()))?;
        Ok(TilingOutput {
            dispatch_key: ZERO_DISPATCH_KEY,
            params: vec![retained, factor],
            workspaces: vec![],
            lanes_used: 1,
            atomic: false,
        })
    }

    fn precomputed_output(&self, problem: &ReductionProblem) -> Result<TilingOutput, StageFailure> {
        let key = static_pattern(problem.raw_reduce_axes());
        let plan = self
            .profile
            .precomputed(key)
            .ok_or(StageFailure::MissingPrecomputedPlan(key))?;
        debug!(
            "Using precomputed plan for static pattern {}: {} lanes, atomic: {}",
            key, plan.lanes_used, plan.atomic
        );
        Ok(TilingOutput {
            dispatch_key: key,
            params: vec![],
            workspaces: vec![],
            lanes_used: plan.lanes_used,
            atomic: plan.atomic,
        })
    }
}

fn at(stage: Stage) -> impl Fn(StageFailure) -> TilingError {
    move |reason| TilingError { stage, reason }
}
