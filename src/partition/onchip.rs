use crate::common::{Axes, Variant};
use crate::engine::StageFailure;
use crate::partition::{BlockTiling, PartitionContext};
use crate::utils::align_down;

use log::debug;

/// How each lane's block is iterated: `axis` is loaded `factor` elements at a time, with every
/// axis after it in [iteration_order] loaded whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnchipTiling {
    pub axis: usize,
    pub factor: u64,
}

/// The order in which a lane walks the axes of its block.
///
/// Group reductions walk the canonical order. Everything else visits retained axes, then
/// reduced axes, keeping a retained innermost axis last so that it stays contiguous.
pub fn iteration_order(cx: &PartitionContext) -> Axes {
    let rank = cx.shape.len();
    if cx.variant() == Variant::Group {
        return (0..rank).collect();
    }
    let innermost = cx.innermost();
    let retained_innermost = !cx.is_reduced(innermost);
    let mut order = (0..rank)
        .filter(|&i| !cx.is_reduced(i) && !(retained_innermost && i == innermost))
        .collect::<Axes>();
    order.extend(cx.reduce_axes.iter().copied());
    if retained_innermost {
        order.push(innermost);
    }
    order
}

/// The subsequence of [iteration_order] left after block tiling.
///
/// Axes ahead of the block axis are spread across lanes by block tiling and so no longer vary
/// within a lane. For group reductions that is every such axis; otherwise only those of the
/// block axis's kind.
pub fn live_axes(cx: &PartitionContext, block: &BlockTiling) -> Axes {
    let order = iteration_order(cx);
    let block_pos = order.iter().position(|&a| a == block.axis);
    let block_reduced = cx.is_reduced(block.axis);
    order
        .iter()
        .enumerate()
        .filter(|&(pos, &axis)| {
            let ahead = block_pos.map_or(false, |b| pos < b);
            let consumed = ahead
                && (cx.variant() == Variant::Group || cx.is_reduced(axis) == block_reduced);
            !consumed
        })
        .map(|(_, &axis)| axis)
        .collect()
}

/// The on-chip footprint of everything strictly after position `pos` of `live`.
fn load_after(cx: &PartitionContext, block: &BlockTiling, live: &[usize], pos: usize) -> u64 {
    live[pos + 1..].iter().fold(1u64, |acc, &axis| {
        acc.saturating_mul(cx.footprint(axis, cx.extent_within_block(block, axis)))
    })
}

/// The on-chip footprint of one element of `axis`: everything loaded whole alongside it.
pub fn load_per_element(cx: &PartitionContext, block: &BlockTiling, axis: usize) -> u64 {
    let live = live_axes(cx, block);
    live.iter()
        .position(|&a| a == axis)
        .map_or(1, |pos| load_after(cx, block, &live, pos))
}

/// Elements resident on-chip for one iteration of the given tiling.
pub fn working_set(cx: &PartitionContext, block: &BlockTiling, onchip: &OnchipTiling) -> u64 {
    cx.footprint(onchip.axis, onchip.factor)
        .saturating_mul(load_per_element(cx, block, onchip.axis))
}

pub fn partition(cx: &PartitionContext, block: &BlockTiling) -> Result<OnchipTiling, StageFailure> {
    let live = live_axes(cx, block);
    let budget = cx.budget();
    let innermost = cx.innermost();

    let tiling = live
        .iter()
        .enumerate()
        .find_map(|(pos, &axis)| {
            let load = load_after(cx, block, &live, pos);
            if load > budget {
                return None;
            }
            let capacity = if axis == innermost {
                align_down(budget, cx.dma_align)
            } else {
                budget / load
            };
            let mut factor = capacity.min(cx.extent_within_block(block, axis)).max(1);
            if cx.variant() == Variant::Transposed && axis == block.axis && block.factor > factor {
                let aligned = align_down(factor, cx.dma_align);
                if aligned > 0 {
                    factor = aligned;
                }
            }
            Some(OnchipTiling { axis, factor })
        })
        .unwrap_or(OnchipTiling {
            axis: innermost,
            factor: 1,
        });

    let footprint = working_set(cx, block, &tiling);
    if footprint > budget {
        return Err(StageFailure::BudgetTooSmall { footprint, budget });
    }
    debug!(
        "On-chip tiling on axis {} with factor {} ({} of {} elements)",
        tiling.axis, tiling.factor, footprint, budget
    );
    Ok(tiling)
}
