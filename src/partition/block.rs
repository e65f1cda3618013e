use crate::common::{Axes, Variant};
use crate::engine::StageFailure;
use crate::partition::PartitionContext;
use crate::utils::{ceil_div, chunks_and_tail};

use log::{debug, warn};

/// How work is spread across lanes: `axis` is cut into chunks of `factor`, one per lane, and
/// every axis of the same kind before it is spread whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTiling {
    pub axis: usize,
    pub factor: u64,
    pub lanes_used: u64,
}

pub fn partition(cx: &PartitionContext) -> Result<BlockTiling, StageFailure> {
    let tiling = match cx.variant() {
        Variant::Atomic => spread(cx, cx.reduce_axes),
        Variant::Group => {
            // Retained axes up to, and including, the single reduced axis.
            let reduced = *cx.reduce_axes.first().ok_or(StageFailure::NoBlockAxis)?;
            let axes = (0..=reduced).collect::<Axes>();
            spread(cx, &axes)
        }
        Variant::Normal | Variant::Padded | Variant::Transposed => retained(cx),
    }?;
    debug!(
        "Block tiling on axis {} with factor {} over {} lanes",
        tiling.axis, tiling.factor, tiling.lanes_used
    );
    Ok(tiling)
}

/// Spreads the given axes across lanes, outermost first, stopping at the first axis which
/// reaches the lane count.
fn spread(cx: &PartitionContext, axes: &[usize]) -> Result<BlockTiling, StageFailure> {
    let mut lanes_so_far = 1u64;
    for &axis in axes {
        let extent = cx.shape[axis];
        if lanes_so_far.saturating_mul(extent) >= cx.lane_count {
            let factor = ceil_div(extent, cx.lane_count / lanes_so_far);
            return Ok(BlockTiling {
                axis,
                factor,
                lanes_used: lanes_so_far * ceil_div(extent, factor),
            });
        }
        lanes_so_far *= extent;
    }
    let &axis = axes.last().ok_or(StageFailure::NoBlockAxis)?;
    Ok(BlockTiling {
        axis,
        factor: 1,
        lanes_used: lanes_so_far,
    })
}

/// Spreads the output across lanes while keeping every lane's output transfer at least one
/// alignment quantum.
fn retained(cx: &PartitionContext) -> Result<BlockTiling, StageFailure> {
    let out = (0..cx.shape.len())
        .filter(|&i| !cx.is_reduced(i))
        .collect::<Axes>();
    let &leading = out.first().ok_or(StageFailure::NoBlockAxis)?;
    let min_transfer = cx.dma_align;

    let mut lanes_so_far = 1u64;
    for (pos, &axis) in out.iter().enumerate() {
        let extent = cx.shape[axis];
        let right = out[pos + 1..]
            .iter()
            .fold(1u64, |acc, &a| acc.saturating_mul(cx.footprint(a, cx.shape[a])));

        if right > cx.budget() {
            // A deeper on-chip split is mandatory, so this axis cannot carry the block split.
            lanes_so_far = lanes_so_far.saturating_mul(extent);
            if lanes_so_far >= cx.lane_count {
                break;
            }
            continue;
        }

        if lanes_so_far.saturating_mul(extent) >= cx.lane_count {
            return Ok(split_lane_limited(cx, axis, lanes_so_far, right, min_transfer));
        }

        if right <= min_transfer {
            // Going deeper would give lanes less than one transfer; grow from the minimum chunk.
            let factor = ceil_div(min_transfer, right).min(extent).max(1);
            return Ok(BlockTiling {
                axis,
                factor,
                lanes_used: lanes_so_far * ceil_div(extent, factor),
            });
        }
        lanes_so_far *= extent;
    }

    warn!("No retained axis qualifies for block tiling; splitting the leading axis");
    let extent = cx.shape[leading];
    let factor = ceil_div(extent, cx.lane_count).max(1);
    Ok(BlockTiling {
        axis: leading,
        factor,
        lanes_used: ceil_div(extent, factor),
    })
}

/// Chooses a factor for `axis` when spreading it fully would exceed the lane count.
///
/// Tries the largest usable lane count first and falls back to fewer lanes until the last
/// (tail) chunk still moves at least `min_transfer` elements.
fn split_lane_limited(
    cx: &PartitionContext,
    axis: usize,
    lanes_so_far: u64,
    right: u64,
    min_transfer: u64,
) -> BlockTiling {
    let extent = cx.shape[axis];
    let target = (cx.lane_count / lanes_so_far).max(1);
    for lanes in (1..=target).rev() {
        let factor = ceil_div(extent, lanes);
        let (chunks, tail) = chunks_and_tail(extent, factor);
        if chunks == 1 || tail.saturating_mul(right) >= min_transfer {
            return BlockTiling {
                axis,
                factor,
                lanes_used: lanes_so_far * chunks,
            };
        }
    }
    BlockTiling {
        axis,
        factor: extent,
        lanes_used: lanes_so_far,
    }
}
