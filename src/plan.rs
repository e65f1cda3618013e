//! The finished tiling of one request and its serialized, kernel-facing form.

use crate::common::{Axes, Dtype, Shape, Variant};
use crate::engine::StageFailure;
use crate::partition::{onchip, BlockTiling, OnchipTiling, PartitionContext};
use crate::profile::{CompileProfile, TilingVar};
use crate::schedule::Selection;
use crate::source::ShapeSource;
use crate::utils::{align_up, volume};

use log::debug;
use serde::Serialize;

/// Dispatch key of the plan emitted for inputs with a zero-sized axis.
pub const ZERO_DISPATCH_KEY: i32 = i32::MAX;

/// Dispatch keys store each axis index in one decimal digit.
pub const MAX_KEYED_RANK: usize = 10;

const VARIANT_WEIGHT: i32 = 10_000_000;
const BLOCK_AXIS_WEIGHT: i32 = 1_000_000;
const ONCHIP_AXIS_WEIGHT: i32 = 100_000;

/// Atomic accumulation stages partial results as 32-bit floats.
const ATOMIC_STAGING_BYTES: u64 = 4;
const GROUP_SYNC_BYTES_PER_LANE: u64 = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilingPlan {
    shape: Shape,
    reduce_axes: Axes,
    pattern: i32,
    selection: Selection,
    block: BlockTiling,
    onchip: OnchipTiling,
    lane_count: u64,
    dma_align: u64,
    dtype: Dtype,
}

/// What the kernel dispatcher receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TilingOutput {
    pub dispatch_key: i32,
    /// The values of the profile's declared variables for `dispatch_key`, in order.
    pub params: Vec<i32>,
    /// Byte sizes of the auxiliary buffers to allocate.
    pub workspaces: Vec<u64>,
    pub lanes_used: u32,
    pub atomic: bool,
}

impl TilingPlan {
    pub fn new(
        cx: &PartitionContext,
        pattern: i32,
        block: BlockTiling,
        onchip: OnchipTiling,
        dtype: Dtype,
    ) -> Result<Self, StageFailure> {
        let rank = cx.shape.len();
        if rank > MAX_KEYED_RANK {
            return Err(StageFailure::RankTooLarge(rank));
        }
        Ok(TilingPlan {
            shape: Shape::from_slice(cx.shape),
            reduce_axes: Axes::from_slice(cx.reduce_axes),
            pattern,
            selection: cx.selection,
            block,
            onchip,
            lane_count: cx.lane_count,
            dma_align: cx.dma_align,
            dtype,
        })
    }

    pub fn variant(&self) -> Variant {
        self.selection.variant
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// The canonical shape the plan tiles.
    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn reduce_axes(&self) -> &[usize] {
        &self.reduce_axes
    }

    pub fn pattern(&self) -> i32 {
        self.pattern
    }

    pub fn block(&self) -> &BlockTiling {
        &self.block
    }

    pub fn onchip(&self) -> &OnchipTiling {
        &self.onchip
    }

    pub fn lanes_used(&self) -> u64 {
        self.block.lanes_used
    }

    pub fn context(&self) -> PartitionContext<'_> {
        PartitionContext {
            shape: &self.shape,
            reduce_axes: &self.reduce_axes,
            selection: self.selection,
            lane_count: self.lane_count,
            dma_align: self.dma_align,
        }
    }

    /// Elements resident on-chip per iteration. Never exceeds the selected budget.
    pub fn working_set(&self) -> u64 {
        onchip::working_set(&self.context(), &self.block, &self.onchip)
    }

    /// Packs the variant, both tiling axes, and the pattern into decimal digits.
    ///
    /// Only atomic plans have positive keys.
    pub fn dispatch_key(&self) -> i32 {
        let key = i32::from(self.variant().ordinal()) * VARIANT_WEIGHT
            + self.block.axis as i32 * BLOCK_AXIS_WEIGHT
            + self.onchip.axis as i32 * ONCHIP_AXIS_WEIGHT
            + self.pattern;
        if self.variant() == Variant::Atomic {
            key
        } else {
            -key
        }
    }

    /// Byte sizes of the cross-lane buffers the variant needs.
    pub fn workspace_requests(&self) -> Vec<u64> {
        match self.variant() {
            Variant::Atomic => {
                let retained = volume(
                    self.shape
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| !self.reduce_axes.contains(i))
                        .map(|(_, d)| d),
                );
                vec![align_up(retained, self.dma_align).saturating_mul(ATOMIC_STAGING_BYTES)]
            }
            Variant::Group => {
                let tail = self.shape[self.shape.len() - 1];
                vec![
                    self.block
                        .lanes_used
                        .saturating_mul(align_up(tail, self.dma_align))
                        .saturating_mul(u64::from(self.dtype.size())),
                    self.lane_count * GROUP_SYNC_BYTES_PER_LANE,
                ]
            }
            Variant::Normal | Variant::Padded | Variant::Transposed => vec![],
        }
    }

    pub fn serialize<S: ShapeSource>(
        &self,
        profile: &CompileProfile,
        source: &S,
    ) -> Result<TilingOutput, StageFailure> {
        let dispatch_key = self.dispatch_key();
        let vars = profile
            .vars(dispatch_key)
            .ok_or(StageFailure::UndeclaredDispatchKey(dispatch_key))?;
        let params = vars
            .iter()
            .map(|var| self.param(var, source))
            .collect::<Result<Vec<_>, _>>()?;
        let lanes_used = u32::try_from(self.block.lanes_used)
            .map_err(|_| StageFailure::ParamOverflow("lanes_used".to_string()))?;
        debug!("Serialized dispatch key {} with params {:?}", dispatch_key, params);
        Ok(TilingOutput {
            dispatch_key,
            params,
            workspaces: self.workspace_requests(),
            lanes_used,
            atomic: self.variant() == Variant::Atomic,
        })
    }

    fn param<S: ShapeSource>(&self, var: &TilingVar, source: &S) -> Result<i32, StageFailure> {
        match var {
            TilingVar::Dim(index) => {
                let extent = self.shape.get(*index).ok_or(StageFailure::DimOutOfRange {
                    index: *index,
                    rank: self.shape.len(),
                })?;
                to_param(var, *extent)
            }
            TilingVar::BlockFactor => to_param(var, self.block.factor),
            TilingVar::OnchipFactor => to_param(var, self.onchip.factor),
            TilingVar::Attr(name) => {
                let value = source
                    .attr(name)
                    .ok_or_else(|| StageFailure::MissingAttribute(name.clone()))?;
                to_param(var, value)
            }
        }
    }
}

fn to_param<T: TryInto<i32>>(var: &TilingVar, value: T) -> Result<i32, StageFailure> {
    value
        .try_into()
        .map_err(|_| StageFailure::ParamOverflow(var.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::tests::pcx;
    use crate::pattern::dynamic_pattern;
    use crate::profile::profile_from;
    use crate::source::OpInfo;
    use serde_json::json;

    fn profile() -> CompileProfile {
        profile_from(json!({
            "lane_count": 32,
            "dma_align": 16,
            "dtype": "float16",
            "patterns": [9],
            "budgets": { "normal": [65536] },
            "vars": {
                "-100009": ["_dim_0", "_dim_2", "_block_factor", "_ub_factor"],
                "11000004": ["_block_factor", "_attr_alpha"],
                "-21100009": ["_dim_7"]
            }
        }))
    }

    fn normal_plan() -> TilingPlan {
        let c = pcx(&[5182, 22, 36754], &[1], Variant::Normal, 65536);
        let block = BlockTiling {
            axis: 0,
            factor: 162,
            lanes_used: 32,
        };
        let onchip = OnchipTiling { axis: 1, factor: 1 };
        TilingPlan::new(&c, dynamic_pattern(3, &[1]), block, onchip, Dtype::Float16).unwrap()
    }

    fn atomic_plan() -> TilingPlan {
        let c = pcx(&[4, 100_000], &[1], Variant::Atomic, 8192);
        let block = BlockTiling {
            axis: 1,
            factor: 3125,
            lanes_used: 32,
        };
        let onchip = OnchipTiling { axis: 0, factor: 2 };
        TilingPlan::new(&c, dynamic_pattern(2, &[1]), block, onchip, Dtype::Float32).unwrap()
    }

    #[test]
    fn test_dispatch_key_layout() {
        assert_eq!(normal_plan().dispatch_key(), -100_009);
        assert_eq!(atomic_plan().dispatch_key(), 11_000_004);
    }

    #[test]
    fn test_group_and_padded_keys_are_negative() {
        let c = pcx(&[4, 100_000, 64], &[1], Variant::Group, 16384);
        let block = BlockTiling {
            axis: 1,
            factor: 12500,
            lanes_used: 32,
        };
        let onchip = OnchipTiling {
            axis: 1,
            factor: 256,
        };
        let plan = TilingPlan::new(&c, 9, block, onchip, Dtype::Float16).unwrap();
        assert_eq!(plan.dispatch_key(), -21_100_009);

        let c = pcx(&[100_000, 15], &[1], Variant::Padded, 16000);
        let block = BlockTiling {
            axis: 0,
            factor: 3125,
            lanes_used: 32,
        };
        let onchip = OnchipTiling {
            axis: 0,
            factor: 782,
        };
        let plan = TilingPlan::new(&c, 4, block, onchip, Dtype::Float16).unwrap();
        assert_eq!(plan.dispatch_key(), -30_000_004);
    }

    #[test]
    fn test_rejects_rank_beyond_key_digits() {
        let shape = [2u64; 11];
        let c = pcx(&shape, &[1, 3, 5, 7, 9], Variant::Normal, 16384);
        let block = BlockTiling {
            axis: 0,
            factor: 1,
            lanes_used: 2,
        };
        let onchip = OnchipTiling { axis: 0, factor: 1 };
        assert_eq!(
            TilingPlan::new(&c, 0, block, onchip, Dtype::Float16),
            Err(StageFailure::RankTooLarge(11))
        );
    }

    #[test]
    fn test_workspaces() {
        assert!(normal_plan().workspace_requests().is_empty());
        // 4 retained elements, aligned to 16, as f32.
        assert_eq!(atomic_plan().workspace_requests(), vec![64]);

        let c = pcx(&[4, 100_000, 64], &[1], Variant::Group, 16384);
        let block = BlockTiling {
            axis: 1,
            factor: 12500,
            lanes_used: 32,
        };
        let onchip = OnchipTiling {
            axis: 1,
            factor: 256,
        };
        let plan = TilingPlan::new(&c, 9, block, onchip, Dtype::Float16).unwrap();
        assert_eq!(plan.workspace_requests(), vec![32 * 64 * 2, 32 * 32]);
    }

    #[test]
    fn test_working_set_of_plan() {
        assert_eq!(normal_plan().working_set(), 36768);
        assert_eq!(atomic_plan().working_set(), 2 * 3136);
    }

    #[test]
    fn test_serializes_declared_vars_in_order() {
        let out = normal_plan()
            .serialize(&profile(), &OpInfo::new([5182, 22, 46, 799], [1]))
            .unwrap();
        assert_eq!(
            out,
            TilingOutput {
                dispatch_key: -100_009,
                params: vec![5182, 36754, 162, 1],
                workspaces: vec![],
                lanes_used: 32,
                atomic: false,
            }
        );
    }

    #[test]
    fn test_serializes_attributes() {
        let source = OpInfo::new([4, 100_000], [1]).with_attr("alpha", -3);
        let out = atomic_plan().serialize(&profile(), &source).unwrap();
        assert_eq!(out.params, vec![3125, -3]);
        assert!(out.atomic);
        assert_eq!(out.workspaces, vec![64]);
    }

    #[test]
    fn test_serialize_errors() {
        let source = OpInfo::new([4, 100_000], [1]);
        assert_eq!(
            atomic_plan().serialize(&profile(), &source),
            Err(StageFailure::MissingAttribute("alpha".to_string()))
        );

        let undeclared = profile_from(json!({
            "lane_count": 32,
            "dma_align": 16,
            "dtype": "float16",
            "patterns": [9],
            "budgets": { "normal": [65536] }
        }));
        assert_eq!(
            normal_plan().serialize(&undeclared, &source),
            Err(StageFailure::UndeclaredDispatchKey(-100_009))
        );

        let c = pcx(&[4, 100_000, 64], &[1], Variant::Group, 16384);
        let block = BlockTiling {
            axis: 1,
            factor: 12500,
            lanes_used: 32,
        };
        let onchip = OnchipTiling {
            axis: 1,
            factor: 256,
        };
        let plan = TilingPlan::new(&c, 9, block, onchip, Dtype::Float16).unwrap();
        assert_eq!(
            plan.serialize(&profile(), &source),
            Err(StageFailure::DimOutOfRange { index: 7, rank: 3 })
        );
    }

    #[test]
    fn test_oversized_extent_overflows() {
        let c = pcx(&[1 << 40, 3], &[1], Variant::Normal, 65536);
        let block = BlockTiling {
            axis: 0,
            factor: 1 << 35,
            lanes_used: 32,
        };
        let onchip = OnchipTiling { axis: 0, factor: 1 };
        let plan = TilingPlan::new(&c, 4, block, onchip, Dtype::Float16).unwrap();
        let profile = profile_from(json!({
            "lane_count": 32,
            "dma_align": 16,
            "dtype": "float16",
            "patterns": [4],
            "budgets": { "normal": [65536] },
            "vars": { "-4": ["_ub_factor", "_block_factor"] }
        }));
        assert_eq!(
            plan.serialize(&profile, &OpInfo::default()),
            Err(StageFailure::ParamOverflow("_block_factor".to_string()))
        );
    }
}
